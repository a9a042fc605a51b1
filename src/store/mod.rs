//! Storage abstraction.
//!
//! The relay talks to storage through narrow traits so the pipeline, the query service and
//! the background sweepers each see only what they use:
//!
//! - [`FeedStore`] - idempotent insert, completion bookkeeping and the dispatch outbox
//! - [`RecipientIndex`] - per-recipient feed id sets, partitioned by spam flag
//! - [`WatermarkStore`] - persisted scalars, including the broadcast watermark
//! - [`FeedQueries`] - paginated read paths
//! - [`SubscriptionDirectory`] - read-only subscriber to channel lookups
//!
//! Two backends implement all five: [`MemoryStore`] for tests and development, and
//! [`PostgresStore`] for durable deployments.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::{StoreBackend, StoreConfig};
pub use crate::error::StoreError;
use crate::feed::{
    Feed, FeedId, FeedPayload, IdFilter, Inserted, NewFeed, NotificationKind, PageRequest,
    SearchCriteria,
};

/// One page of feeds plus the size of the full filtered set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Paged {
    pub feeds: Vec<Feed>,
    pub total: usize,
}

#[async_trait]
pub trait FeedStore: Send + Sync {
    /// Insert a feed unless one with the same payload id exists.
    ///
    /// A created feed is written together with its outbox entry. A duplicate reports the
    /// existing id with `created = false` and touches nothing.
    async fn insert_feed(&self, feed: NewFeed) -> Result<Inserted, StoreError>;

    async fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StoreError>;

    /// Set `processed` and persist the enriched payload.
    async fn mark_processed(&self, id: FeedId, payload: &FeedPayload) -> Result<(), StoreError>;

    async fn bump_attempts(&self, id: FeedId) -> Result<(), StoreError>;

    /// Unprocessed non-spam feeds below the attempt cap, fewest attempts first, then newest.
    async fn retry_candidates(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Feed>, StoreError>;

    /// Oldest outbox entries awaiting dispatch.
    async fn pending_dispatch(&self, limit: usize) -> Result<Vec<FeedId>, StoreError>;

    async fn ack_dispatch(&self, id: FeedId) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RecipientIndex: Send + Sync {
    /// Add `feed_id` to the recipient's partition. Appending an existing id is a no-op.
    async fn append_feed(
        &self,
        recipient: &str,
        feed_id: FeedId,
        is_spam: bool,
    ) -> Result<(), StoreError>;

    /// Ascending feed ids for a recipient partition.
    async fn list_feed_ids(&self, recipient: &str, is_spam: bool)
        -> Result<Vec<FeedId>, StoreError>;

    /// Drop the given ids from every recipient. Returns the number of entries removed.
    async fn remove_feeds(&self, ids: &[FeedId]) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait WatermarkStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError>;

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError>;

    /// Atomically move `key` to `value` when `value >= current` or no value exists yet.
    ///
    /// Returns true when the watermark now equals `value`.
    async fn advance_if_at_least(&self, key: &str, value: i64) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait FeedQueries: Send + Sync {
    /// Page over the given ids after applying `filter`, newest first.
    async fn page_by_ids(
        &self,
        ids: &[FeedId],
        filter: &IdFilter,
        page: PageRequest,
    ) -> Result<Paged, StoreError>;

    /// Non-hidden feeds of a sender, newest first.
    async fn page_by_sender(
        &self,
        sender: &str,
        kind: Option<NotificationKind>,
        page: PageRequest,
    ) -> Result<Paged, StoreError>;

    async fn search(&self, criteria: &SearchCriteria, page: PageRequest)
        -> Result<Paged, StoreError>;

    /// Non-spam feeds with `start <= epoch <= end`, oldest first.
    async fn page_between(
        &self,
        start: i64,
        end: i64,
        page: PageRequest,
    ) -> Result<Paged, StoreError>;

    /// Distinct senders among the given feed ids.
    async fn distinct_senders(&self, ids: &[FeedId]) -> Result<Vec<String>, StoreError>;

    /// Delete feeds whose expiry is before `now` and return their ids.
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<FeedId>, StoreError>;
}

#[async_trait]
pub trait SubscriptionDirectory: Send + Sync {
    /// Channels the subscriber is subscribed to.
    async fn channels_for(&self, subscriber: &str) -> Result<Vec<String>, StoreError>;
}

/// Every storage role served by one backend.
#[derive(Clone)]
pub struct Stores {
    pub feeds: Arc<dyn FeedStore>,
    pub index: Arc<dyn RecipientIndex>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub queries: Arc<dyn FeedQueries>,
    pub subscriptions: Arc<dyn SubscriptionDirectory>,
}

impl Stores {
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: FeedStore
            + RecipientIndex
            + WatermarkStore
            + FeedQueries
            + SubscriptionDirectory
            + 'static,
    {
        Self {
            feeds: backend.clone(),
            index: backend.clone(),
            watermarks: backend.clone(),
            queries: backend.clone(),
            subscriptions: backend,
        }
    }

    /// Open the backend selected in configuration.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        match config.backend {
            StoreBackend::Memory => {
                tracing::warn!("Using in-memory store; feeds will not survive a restart");
                Ok(Self::from_backend(Arc::new(MemoryStore::new())))
            }
            StoreBackend::Postgres => {
                let store = PostgresStore::connect(config).await?;
                Ok(Self::from_backend(Arc::new(store)))
            }
        }
    }
}
