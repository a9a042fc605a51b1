//! End-to-end pipeline behaviour against the in-memory store.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde_json::json;
use tokio::sync::Notify;

use common::{harness, new_feed, FlakyIndex, TestTarget, ALICE, BOB, CHANNEL};
use feedrelay::broadcast::PublishOutcome;
use feedrelay::config::{PipelineConfig, BROADCAST_WATERMARK_KEY};
use feedrelay::dispatch::{LiveEvent, LiveTarget};
use feedrelay::error::FeedError;
use feedrelay::feed::{IngestRequest, SenderType};
use feedrelay::pipeline::{ExpirySweeper, FeedService, RetryScheduler};
use feedrelay::store::{FeedStore, RecipientIndex, WatermarkStore};

// =============================================================================
// Ingestion
// =============================================================================

#[tokio::test]
async fn test_duplicate_payload_id_stores_one_feed() {
    let h = harness();

    let first = h
        .service
        .add_feed(new_feed("p-1", &[ALICE, BOB], 1000))
        .await
        .unwrap();
    let second = h
        .service
        .add_feed(new_feed("p-1", &[ALICE, BOB], 1000))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.feed_id, second.feed_id);
    assert_eq!(h.memory.feed_count().await, 1);
    assert_eq!(
        h.memory.list_feed_ids(ALICE, false).await.unwrap(),
        vec![first.feed_id]
    );
    assert_eq!(
        h.memory.list_feed_ids(BOB, false).await.unwrap(),
        vec![first.feed_id]
    );
}

#[tokio::test]
async fn test_duplicate_is_dispatched_once() {
    let h = harness();
    let node = TestTarget::healthy();
    h.sessions.register_node(node.clone()).await;

    h.service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();
    h.service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();

    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    assert_eq!(node.received().len(), 1);
}

#[tokio::test]
async fn test_index_covers_every_recipient_partition() {
    let h = harness();
    let mut spam = new_feed("p-spam", &[ALICE, BOB], 1000);
    spam.is_spam = true;

    let normal = h
        .service
        .add_feed(new_feed("p-normal", &[ALICE], 1000))
        .await
        .unwrap();
    let spam = h.service.add_feed(spam).await.unwrap();

    assert_eq!(
        h.memory.list_feed_ids(ALICE, false).await.unwrap(),
        vec![normal.feed_id]
    );
    assert_eq!(
        h.memory.list_feed_ids(ALICE, true).await.unwrap(),
        vec![spam.feed_id]
    );
    assert_eq!(
        h.memory.list_feed_ids(BOB, true).await.unwrap(),
        vec![spam.feed_id]
    );
    assert!(h.memory.list_feed_ids(BOB, false).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_raw_request_is_normalized_and_relayed() {
    let h = harness();
    let node = TestTarget::healthy();
    h.sessions.register_node(node.clone()).await;

    let request: IngestRequest = serde_json::from_value(json!({
        "payloadId": "raw-1",
        "sender": CHANNEL,
        "senderType": 0,
        "recipients": ["0x00000000000000000000000000000000000000A1"],
        "payload": {
            "data": {"type": 3, "asub": "s", "amsg": "m"},
            "notification": {"title": "t", "body": "b"},
            "recipients": ALICE,
            "verificationProof": "eip712v2:0xproof"
        },
        "source": "ETH_TEST_SEPOLIA"
    }))
    .unwrap();

    let inserted = h.service.add(request).await.unwrap();
    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert_eq!(stored.recipients, vec![ALICE.to_string()]);
    assert_eq!(stored.sender_type, SenderType::Channel);

    h.relay.drain_once().await.unwrap();
    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert!(stored.processed);
    assert_eq!(node.received().len(), 1);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_storage() {
    let h = harness();
    let request: IngestRequest = serde_json::from_value(json!({
        "payloadId": "bad-1",
        "sender": CHANNEL,
        "senderType": 0,
        "recipients": ["not an address"],
        "payload": {
            "data": {"type": 1, "asub": "s", "amsg": "m"},
            "notification": {"title": "t", "body": "b"},
            "recipients": {},
            "verificationProof": "eip712v2:0xproof"
        },
        "source": "ETH_TEST_SEPOLIA"
    }))
    .unwrap();

    let result = h.service.add(request).await;
    assert!(matches!(result, Err(FeedError::Validation(_))));
    assert_eq!(h.memory.feed_count().await, 0);
}

#[tokio::test]
async fn test_index_failure_keeps_feed_and_other_recipients() {
    let h = harness();
    let index = Arc::new(FlakyIndex {
        inner: h.memory.clone(),
        refuse: BOB.to_string(),
    });
    let service = FeedService::new(h.store.clone(), index, Arc::new(Notify::new()));

    let inserted = service
        .add_feed(new_feed("p-1", &[ALICE, BOB], 1000))
        .await
        .unwrap();

    assert!(inserted.created);
    assert!(h.memory.get_feed(inserted.feed_id).await.unwrap().is_some());
    assert_eq!(
        h.memory.list_feed_ids(ALICE, false).await.unwrap(),
        vec![inserted.feed_id]
    );
    assert!(h.memory.list_feed_ids(BOB, false).await.unwrap().is_empty());
    assert_eq!(
        h.memory.pending_dispatch(10).await.unwrap(),
        vec![inserted.feed_id]
    );
}

#[tokio::test]
async fn test_concurrent_adds_for_one_recipient_all_land() {
    let h = harness();
    let adds = (0..20).map(|i| {
        let service = h.service.clone();
        async move {
            service
                .add_feed(new_feed(&format!("p-{i}"), &[ALICE], 1000 + i))
                .await
                .unwrap()
                .feed_id
        }
    });
    let mut ids = join_all(adds).await;
    ids.sort();

    assert_eq!(h.memory.list_feed_ids(ALICE, false).await.unwrap(), ids);
    assert_eq!(h.memory.feed_count().await, 20);
}

// =============================================================================
// Dispatch and broadcast
// =============================================================================

#[tokio::test]
async fn test_stale_epoch_skips_broadcast_but_completes() {
    let h = harness();
    let node = TestTarget::healthy();
    h.sessions.register_node(node.clone()).await;

    let newer = h
        .service
        .add_feed(new_feed("p-newer", &[ALICE], 2000))
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();

    let older = h
        .service
        .add_feed(new_feed("p-older", &[ALICE], 1000))
        .await
        .unwrap();
    let feed = h.memory.get_feed(older.feed_id).await.unwrap().unwrap();
    let report = h.pipeline.process(&feed).await.unwrap();

    assert_eq!(report.publish, PublishOutcome::Stale);
    assert_eq!(report.dispatch.nodes_delivered, 1);
    assert_eq!(h.sink.ids(), vec![newer.feed_id]);
    assert_eq!(
        h.memory.get(BROADCAST_WATERMARK_KEY).await.unwrap(),
        Some(2000)
    );
    assert!(h.memory.get_feed(older.feed_id).await.unwrap().unwrap().processed);
    assert_eq!(node.received().len(), 2);
}

#[tokio::test]
async fn test_equal_epoch_is_still_published() {
    let h = harness();
    h.service
        .add_feed(new_feed("p-a", &[ALICE], 1500))
        .await
        .unwrap();
    h.service
        .add_feed(new_feed("p-b", &[ALICE], 1500))
        .await
        .unwrap();

    h.relay.drain_once().await.unwrap();

    assert_eq!(h.sink.ids().len(), 2);
}

#[tokio::test]
async fn test_failing_node_does_not_block_others() {
    let h = harness();
    let healthy_a = TestTarget::healthy();
    let broken = TestTarget::failing();
    let healthy_b = TestTarget::healthy();
    for node in [&healthy_a, &broken, &healthy_b] {
        h.sessions.register_node(node.clone()).await;
    }

    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();
    let feed = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    let report = h.pipeline.process(&feed).await.unwrap();

    assert_eq!(report.dispatch.nodes_delivered, 2);
    assert_eq!(report.dispatch.nodes_failed, 1);
    assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_a.received().len(), 1);
    assert_eq!(healthy_b.received().len(), 1);
    assert!(h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_matched_client_gets_user_event() {
    let h = harness();
    let alice = TestTarget::healthy();
    let bob = TestTarget::healthy();
    h.sessions
        .register_client(ALICE, alice.clone() as Arc<dyn LiveTarget>)
        .await
        .unwrap();
    h.sessions
        .register_client(BOB, bob.clone() as Arc<dyn LiveTarget>)
        .await
        .unwrap();

    let mut spam = new_feed("p-spam", &[ALICE], 1000);
    spam.is_spam = true;
    h.service
        .add_feed(new_feed("p-normal", &[ALICE], 1000))
        .await
        .unwrap();
    h.service.add_feed(spam).await.unwrap();
    h.relay.drain_once().await.unwrap();

    let events = alice.received();
    assert_eq!(events.len(), 2);
    assert!(events.iter().any(|e| matches!(e, LiveEvent::UserFeeds(_))));
    assert!(events
        .iter()
        .any(|e| matches!(e, LiveEvent::UserSpamFeeds(_))));
    assert!(bob.received().is_empty());
}

#[tokio::test]
async fn test_dispatched_payload_carries_id_and_epoch() {
    let h = harness();
    let node = TestTarget::healthy();
    h.sessions.register_node(node.clone()).await;

    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1234))
        .await
        .unwrap();
    h.relay.drain_once().await.unwrap();

    let events = node.received();
    let LiveEvent::LiveFeeds(feed) = &events[0] else {
        panic!("expected liveFeeds, got {}", events[0].name());
    };
    assert_eq!(feed.payload.data.sid, Some(inserted.feed_id.to_string()));
    assert_eq!(feed.payload.data.epoch, Some("1234".to_string()));

    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert_eq!(stored.payload.data.sid, Some(inserted.feed_id.to_string()));
}

// =============================================================================
// Completion and retry
// =============================================================================

#[tokio::test]
async fn test_completion_failure_bumps_attempts() {
    let h = harness();
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();
    h.store.fail_completion.store(true, Ordering::SeqCst);

    let feed = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    let result = h.pipeline.process(&feed).await;

    assert!(matches!(
        result,
        Err(FeedError::Completion { feed_id, .. }) if feed_id == inserted.feed_id
    ));
    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert!(!stored.processed);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_relay_acks_failed_feed_and_retry_completes_it() {
    let h = harness();
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();

    h.store.fail_completion.store(true, Ordering::SeqCst);
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);

    h.store.fail_completion.store(false, Ordering::SeqCst);
    let retry = RetryScheduler::new(h.store.clone(), h.pipeline.clone(), &PipelineConfig::default());
    let report = retry.run_once().await.unwrap();

    assert_eq!(report.selected, 1);
    assert_eq!(report.completed, 1);
    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert!(stored.processed);
    assert_eq!(stored.attempts, 1);
}

#[tokio::test]
async fn test_retry_respects_attempt_cap() {
    let h = harness();
    let mut ids = Vec::new();
    for (payload_id, attempts) in [("p-0", 0), ("p-1", 1), ("p-3", 3)] {
        let inserted = h
            .service
            .add_feed(new_feed(payload_id, &[ALICE], 1000))
            .await
            .unwrap();
        h.memory.set_attempts(inserted.feed_id, attempts).await.unwrap();
        h.memory.ack_dispatch(inserted.feed_id).await.unwrap();
        ids.push(inserted.feed_id);
    }

    let config = PipelineConfig {
        max_attempts: 3,
        ..PipelineConfig::default()
    };
    let retry = RetryScheduler::new(h.store.clone(), h.pipeline.clone(), &config);
    let report = retry.run_once().await.unwrap();

    assert_eq!(report.selected, 2);
    assert_eq!(report.completed, 2);
    assert!(h.memory.get_feed(ids[0]).await.unwrap().unwrap().processed);
    assert!(h.memory.get_feed(ids[1]).await.unwrap().unwrap().processed);
    assert!(!h.memory.get_feed(ids[2]).await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_retry_stops_once_cap_is_reached() {
    let h = harness();
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();
    h.store.fail_completion.store(true, Ordering::SeqCst);
    h.relay.drain_once().await.unwrap();

    let config = PipelineConfig {
        max_attempts: 2,
        ..PipelineConfig::default()
    };
    let retry = RetryScheduler::new(h.store.clone(), h.pipeline.clone(), &config);
    assert_eq!(retry.run_once().await.unwrap().failed, 1);
    assert_eq!(retry.run_once().await.unwrap().selected, 0);

    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert_eq!(stored.attempts, 2);
    assert!(!stored.processed);
}

#[tokio::test]
async fn test_unreachable_watermark_leaves_feed_for_retry() {
    let h = harness();
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();

    h.watermarks.down.store(true, Ordering::SeqCst);
    let feed = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    let result = h.pipeline.process(&feed).await;
    assert!(matches!(
        result,
        Err(FeedError::WatermarkUnavailable { feed_id }) if feed_id == inserted.feed_id
    ));
    let stored = h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap();
    assert!(!stored.processed);
    assert_eq!(stored.attempts, 1);
    assert!(h.sink.ids().is_empty());

    h.watermarks.down.store(false, Ordering::SeqCst);
    h.memory.ack_dispatch(inserted.feed_id).await.unwrap();
    let retry = RetryScheduler::new(h.store.clone(), h.pipeline.clone(), &PipelineConfig::default());
    assert_eq!(retry.run_once().await.unwrap().completed, 1);

    assert_eq!(h.sink.ids(), vec![inserted.feed_id]);
    assert!(h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_unreadable_outbox_feed_is_not_acknowledged() {
    let h = harness();
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();

    h.store.fail_reads.store(true, Ordering::SeqCst);
    assert_eq!(h.relay.drain_once().await.unwrap(), 0);
    assert_eq!(
        h.memory.pending_dispatch(10).await.unwrap(),
        vec![inserted.feed_id]
    );

    h.store.fail_reads.store(false, Ordering::SeqCst);
    assert_eq!(h.relay.drain_once().await.unwrap(), 1);
    assert!(h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap().processed);
}

#[tokio::test]
async fn test_relay_and_retry_running_together_deliver_once() {
    let h = harness();
    let node = TestTarget::healthy();
    h.sessions.register_node(node.clone()).await;
    let inserted = h
        .service
        .add_feed(new_feed("p-1", &[ALICE], 1000))
        .await
        .unwrap();

    let retry = RetryScheduler::new(h.store.clone(), h.pipeline.clone(), &PipelineConfig::default());
    let (drained, retried) = tokio::join!(h.relay.drain_once(), retry.run_once());

    assert_eq!(drained.unwrap(), 1);
    assert_eq!(retried.unwrap().selected, 0);
    assert_eq!(node.received().len(), 1);
    assert_eq!(h.sink.ids(), vec![inserted.feed_id]);
    assert!(h.memory.get_feed(inserted.feed_id).await.unwrap().unwrap().processed);
}

// =============================================================================
// Expiry
// =============================================================================

#[tokio::test]
async fn test_expired_feeds_leave_store_and_index() {
    let h = harness();
    let mut expired = new_feed("p-old", &[ALICE], 1000);
    expired.expiry = Some(Utc::now() - Duration::hours(1));
    let mut live = new_feed("p-live", &[ALICE], 1000);
    live.expiry = Some(Utc::now() + Duration::hours(1));

    let expired = h.service.add_feed(expired).await.unwrap();
    let live = h.service.add_feed(live).await.unwrap();

    let sweeper = ExpirySweeper::new(h.memory.clone(), h.memory.clone());
    assert_eq!(sweeper.sweep_once(Utc::now()).await.unwrap(), 1);

    assert!(h.memory.get_feed(expired.feed_id).await.unwrap().is_none());
    assert_eq!(
        h.memory.list_feed_ids(ALICE, false).await.unwrap(),
        vec![live.feed_id]
    );
}
