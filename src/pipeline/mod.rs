//! Store-and-fan-out pipeline.
//!
//! [`FeedService::add`] stores a feed and its outbox entry, appends it to every recipient's
//! index, then wakes the [`OutboxRelay`]. The relay drains the outbox and runs each feed
//! through [`Pipeline::process`]:
//!
//! 1. enrich the payload with the feed id and epoch
//! 2. dispatch to live sessions and delivery nodes
//! 3. publish to the broadcast topic (watermark gated)
//! 4. mark the feed processed, or bump its attempt counter if that write fails or the
//!    watermark could not be read
//!
//! Feeds left unprocessed are picked up again by the [`RetryScheduler`] until they reach the
//! attempt cap. Feeds still waiting in the outbox belong to the relay and are not retried.

pub mod expiry;
pub mod retry;

pub use expiry::ExpirySweeper;
pub use retry::RetryScheduler;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{self, StreamExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::broadcast::{BroadcastPublisher, PublishOutcome};
use crate::dispatch::{DispatchReport, Dispatcher};
use crate::error::{FeedError, StoreError};
use crate::feed::{Feed, FeedId, IngestRequest, Inserted, NewFeed};
use crate::store::{FeedStore, RecipientIndex};

/// What happened to one feed on one pass through the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    pub dispatch: DispatchReport,
    pub publish: PublishOutcome,
}

/// Post-store stages for a single feed.
pub struct Pipeline {
    feeds: Arc<dyn FeedStore>,
    dispatcher: Dispatcher,
    publisher: BroadcastPublisher,
}

impl Pipeline {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        dispatcher: Dispatcher,
        publisher: BroadcastPublisher,
    ) -> Self {
        Self {
            feeds,
            dispatcher,
            publisher,
        }
    }

    /// Run dispatch, publish and completion for `feed`.
    ///
    /// Dispatch and sink failures are logged where they happen. An unreachable watermark or a
    /// failed completion write leaves the feed unprocessed, bumps its attempt counter and is
    /// returned.
    #[instrument(
        name = "pipeline.process",
        skip(self, feed),
        fields(feed_id = feed.id, payload_id = %feed.payload_id, attempts = feed.attempts, duration_ms)
    )]
    pub async fn process(&self, feed: &Feed) -> Result<ProcessReport, FeedError> {
        let start = Instant::now();
        let payload = feed.payload.enriched(feed.id, feed.epoch);

        let dispatch = self.dispatcher.dispatch(feed, &payload).await;
        let publish = self.publisher.publish(feed, &payload).await;
        if publish == PublishOutcome::WatermarkUnavailable {
            Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
            self.bump_attempts(feed.id).await;
            return Err(FeedError::WatermarkUnavailable { feed_id: feed.id });
        }

        let completed = self.feeds.mark_processed(feed.id, &payload).await;
        Span::current().record("duration_ms", start.elapsed().as_millis() as u64);

        if let Err(source) = completed {
            error!(error = %source, "Failed to mark feed processed");
            self.bump_attempts(feed.id).await;
            return Err(FeedError::Completion {
                feed_id: feed.id,
                source,
            });
        }

        debug!(%publish, "Feed processed");
        Ok(ProcessReport { dispatch, publish })
    }

    async fn bump_attempts(&self, id: FeedId) {
        if let Err(e) = self.feeds.bump_attempts(id).await {
            error!(error = %e, "Failed to bump attempt counter");
        }
    }
}

/// Ingestion entry point.
#[derive(Clone)]
pub struct FeedService {
    feeds: Arc<dyn FeedStore>,
    index: Arc<dyn RecipientIndex>,
    relay: Arc<Notify>,
}

impl FeedService {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        index: Arc<dyn RecipientIndex>,
        relay: Arc<Notify>,
    ) -> Self {
        Self { feeds, index, relay }
    }

    /// Validate and store a raw request.
    pub async fn add(&self, request: IngestRequest) -> Result<Inserted, FeedError> {
        let feed = request.into_new_feed(Utc::now().timestamp())?;
        self.add_feed(feed).await
    }

    /// Store a validated feed and index it for every recipient.
    ///
    /// Returns once the feed and the index are written. Dispatch happens later on the relay.
    /// Index failures are logged and do not undo the insert.
    #[instrument(
        name = "pipeline.add",
        skip(self, feed),
        fields(payload_id = %feed.payload_id, feed_id, created)
    )]
    pub async fn add_feed(&self, feed: NewFeed) -> Result<Inserted, FeedError> {
        let recipients = feed.recipients.clone();
        let is_spam = feed.is_spam;

        let inserted = self.feeds.insert_feed(feed).await?;
        Span::current().record("feed_id", inserted.feed_id);
        Span::current().record("created", inserted.created);
        if !inserted.created {
            debug!("Duplicate payload id; nothing to do");
            return Ok(inserted);
        }

        let appends = recipients.iter().map(|recipient| async move {
            let result = self
                .index
                .append_feed(recipient, inserted.feed_id, is_spam)
                .await;
            (recipient, result)
        });
        for (recipient, result) in join_all(appends).await {
            if let Err(e) = result {
                warn!(%recipient, error = %FeedError::Index(e), "Recipient left out of index");
            }
        }

        self.relay.notify_one();
        Ok(inserted)
    }
}

/// Consumer of the dispatch outbox.
pub struct OutboxRelay {
    feeds: Arc<dyn FeedStore>,
    pipeline: Arc<Pipeline>,
    notify: Arc<Notify>,
    batch_size: usize,
    concurrency: usize,
}

impl OutboxRelay {
    pub fn new(
        feeds: Arc<dyn FeedStore>,
        pipeline: Arc<Pipeline>,
        notify: Arc<Notify>,
        batch_size: usize,
        concurrency: usize,
    ) -> Self {
        Self {
            feeds,
            pipeline,
            notify,
            batch_size,
            concurrency,
        }
    }

    /// Process one batch of outbox entries. Returns how many entries were acknowledged.
    ///
    /// Every loaded entry is acknowledged whatever the pipeline outcome; unprocessed feeds are
    /// left to the retry scheduler.
    pub async fn drain_once(&self) -> Result<usize, StoreError> {
        let pending = self.feeds.pending_dispatch(self.batch_size).await?;

        let acked = stream::iter(pending)
            .map(|id| self.relay_one(id))
            .buffer_unordered(self.concurrency)
            .filter(|acked| futures::future::ready(*acked))
            .count()
            .await;

        Ok(acked)
    }

    /// Returns whether the entry was acknowledged.
    async fn relay_one(&self, id: FeedId) -> bool {
        match self.feeds.get_feed(id).await {
            Ok(Some(feed)) if !feed.processed => {
                if let Err(e) = self.pipeline.process(&feed).await {
                    warn!(feed_id = id, error = %e, "Feed left for retry");
                }
            }
            Ok(_) => debug!(feed_id = id, "Outbox entry has nothing to dispatch"),
            Err(e) => {
                // Keep the entry so the next drain sees it again.
                error!(feed_id = id, error = %e, "Failed to load outbox feed");
                return false;
            }
        }
        match self.feeds.ack_dispatch(id).await {
            Ok(()) => true,
            Err(e) => {
                error!(feed_id = id, error = %e, "Failed to acknowledge outbox entry");
                false
            }
        }
    }

    /// Drain on every wake-up and at least once per `poll`.
    pub fn spawn(self: Arc<Self>, poll: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(poll_secs = poll.as_secs(), "Outbox relay started");
            loop {
                tokio::select! {
                    _ = self.notify.notified() => {}
                    _ = ticker.tick() => {}
                }
                loop {
                    match self.drain_once().await {
                        // Keep going only while full batches are being acknowledged.
                        Ok(acked) if acked == self.batch_size => continue,
                        Ok(_) => break,
                        Err(e) => {
                            error!(error = %e, "Outbox drain failed");
                            break;
                        }
                    }
                }
            }
        })
    }
}
