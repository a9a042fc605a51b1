//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use uuid::Uuid;

use feedrelay::broadcast::{BroadcastMessage, BroadcastPublisher, BroadcastSink};
use feedrelay::config::BroadcastConfig;
use feedrelay::dispatch::{Dispatcher, LiveEvent, LiveTarget, SessionRegistry};
use feedrelay::error::{DeliveryError, PublishError};
use feedrelay::feed::{Feed, FeedId, FeedPayload, Inserted, NewFeed, SenderType};
use feedrelay::pipeline::{FeedService, OutboxRelay, Pipeline};
use feedrelay::store::{FeedStore, MemoryStore, RecipientIndex, StoreError, WatermarkStore};

pub const CHANNEL: &str = "eip155:0x00000000000000000000000000000000000000c1";
pub const ALICE: &str = "eip155:0x00000000000000000000000000000000000000a1";
pub const BOB: &str = "eip155:0x00000000000000000000000000000000000000b2";

pub fn payload(title: &str) -> FeedPayload {
    serde_json::from_value(json!({
        "data": {"type": 3, "asub": "subject", "amsg": "message", "app": "demo"},
        "notification": {"title": title, "body": "body text"},
        "recipients": ALICE,
        "verificationProof": "eip712v2:0xproof"
    }))
    .unwrap()
}

pub fn new_feed(payload_id: &str, recipients: &[&str], epoch: i64) -> NewFeed {
    NewFeed {
        payload_id: payload_id.to_string(),
        sender: CHANNEL.to_string(),
        channel: Some(CHANNEL.to_string()),
        sender_type: SenderType::Channel,
        recipients: recipients.iter().map(|r| r.to_string()).collect(),
        payload: payload(payload_id),
        source: "ETH_TEST_SEPOLIA".to_string(),
        is_spam: false,
        hidden: false,
        epoch,
        expiry: None,
        delegate: None,
    }
}

// =============================================================================
// Fault injection
// =============================================================================

/// Memory store whose `get_feed` and `mark_processed` can be made to fail.
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub fail_completion: AtomicBool,
    pub fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new(inner: Arc<MemoryStore>) -> Self {
        Self {
            inner,
            fail_completion: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FeedStore for FlakyStore {
    async fn insert_feed(&self, feed: NewFeed) -> Result<Inserted, StoreError> {
        self.inner.insert_feed(feed).await
    }

    async fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("feed read refused".into()));
        }
        self.inner.get_feed(id).await
    }

    async fn mark_processed(&self, id: FeedId, payload: &FeedPayload) -> Result<(), StoreError> {
        if self.fail_completion.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("completion write refused".into()));
        }
        self.inner.mark_processed(id, payload).await
    }

    async fn bump_attempts(&self, id: FeedId) -> Result<(), StoreError> {
        self.inner.bump_attempts(id).await
    }

    async fn retry_candidates(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Feed>, StoreError> {
        self.inner.retry_candidates(max_attempts, limit).await
    }

    async fn pending_dispatch(&self, limit: usize) -> Result<Vec<FeedId>, StoreError> {
        self.inner.pending_dispatch(limit).await
    }

    async fn ack_dispatch(&self, id: FeedId) -> Result<(), StoreError> {
        self.inner.ack_dispatch(id).await
    }
}

/// Watermark store that can be switched off.
pub struct FlakyWatermarks {
    pub inner: Arc<MemoryStore>,
    pub down: AtomicBool,
}

impl FlakyWatermarks {
    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("watermark row locked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl WatermarkStore for FlakyWatermarks {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.check()?;
        self.inner.set(key, value).await
    }

    async fn advance_if_at_least(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        self.check()?;
        self.inner.advance_if_at_least(key, value).await
    }
}

/// Recipient index that refuses appends for one recipient.
pub struct FlakyIndex {
    pub inner: Arc<MemoryStore>,
    pub refuse: String,
}

#[async_trait]
impl RecipientIndex for FlakyIndex {
    async fn append_feed(
        &self,
        recipient: &str,
        feed_id: FeedId,
        is_spam: bool,
    ) -> Result<(), StoreError> {
        if recipient == self.refuse {
            return Err(StoreError::Unavailable(format!("index shard for {recipient} is down")));
        }
        self.inner.append_feed(recipient, feed_id, is_spam).await
    }

    async fn list_feed_ids(&self, recipient: &str, is_spam: bool) -> Result<Vec<FeedId>, StoreError> {
        self.inner.list_feed_ids(recipient, is_spam).await
    }

    async fn remove_feeds(&self, ids: &[FeedId]) -> Result<u64, StoreError> {
        self.inner.remove_feeds(ids).await
    }
}

/// Live target that records events or refuses every delivery.
pub struct TestTarget {
    id: Uuid,
    pub fail: bool,
    pub events: Mutex<Vec<LiveEvent>>,
    pub attempts: AtomicUsize,
}

impl TestTarget {
    pub fn healthy() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            fail: false,
            events: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            fail: true,
            events: Mutex::new(Vec::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn received(&self) -> Vec<LiveEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl LiveTarget for TestTarget {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn deliver(&self, event: LiveEvent) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail {
            return Err(DeliveryError::Closed(self.id.to_string()));
        }
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Broadcast sink that records every message.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<BroadcastMessage>>,
}

impl RecordingSink {
    pub fn ids(&self) -> Vec<FeedId> {
        self.messages.lock().unwrap().iter().map(|m| m.id).collect()
    }
}

#[async_trait]
impl BroadcastSink for RecordingSink {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), PublishError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// =============================================================================
// Harness
// =============================================================================

pub struct Harness {
    pub memory: Arc<MemoryStore>,
    pub store: Arc<FlakyStore>,
    pub watermarks: Arc<FlakyWatermarks>,
    pub sessions: Arc<SessionRegistry>,
    pub sink: Arc<RecordingSink>,
    pub pipeline: Arc<Pipeline>,
    pub service: FeedService,
    pub relay: OutboxRelay,
}

pub fn harness() -> Harness {
    let memory = Arc::new(MemoryStore::new());
    let store = Arc::new(FlakyStore::new(memory.clone()));
    let sessions = Arc::new(SessionRegistry::new(10));
    let sink = Arc::new(RecordingSink::default());

    let watermarks = Arc::new(FlakyWatermarks {
        inner: memory.clone(),
        down: AtomicBool::new(false),
    });

    let broadcast_sink: Arc<dyn BroadcastSink> = sink.clone();
    let publisher = BroadcastPublisher::new(
        watermarks.clone(),
        Some(broadcast_sink),
        &BroadcastConfig::default(),
    );
    let pipeline = Arc::new(Pipeline::new(
        store.clone(),
        Dispatcher::new(sessions.clone()),
        publisher,
    ));
    let notify = Arc::new(Notify::new());
    let service = FeedService::new(store.clone(), memory.clone(), notify.clone());
    let relay = OutboxRelay::new(store.clone(), pipeline.clone(), notify, 50, 8);

    Harness {
        memory,
        store,
        watermarks,
        sessions,
        sink,
        pipeline,
        service,
        relay,
    }
}
