//! In-memory implementation of every storage role.
//!
//! # Durability and consistency
//! - **Not durable**: all state is lost on process restart.
//! - **Single-process consistency**: all state sits behind one `tokio::sync::RwLock`, so every
//!   operation (including the conditional watermark advance and index appends) is atomic with
//!   respect to the others.
//!
//! Used by the test suite and for local development without Postgres.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    FeedQueries, FeedStore, Paged, RecipientIndex, StoreError, SubscriptionDirectory,
    WatermarkStore,
};
use crate::feed::{
    Feed, FeedId, FeedPayload, IdFilter, Inserted, NewFeed, NotificationKind, PageRequest,
    SearchCriteria,
};

#[derive(Debug, Default)]
struct Partitions {
    normal: BTreeSet<FeedId>,
    spam: BTreeSet<FeedId>,
}

impl Partitions {
    fn get(&self, is_spam: bool) -> &BTreeSet<FeedId> {
        if is_spam {
            &self.spam
        } else {
            &self.normal
        }
    }

    fn get_mut(&mut self, is_spam: bool) -> &mut BTreeSet<FeedId> {
        if is_spam {
            &mut self.spam
        } else {
            &mut self.normal
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: FeedId,
    feeds: BTreeMap<FeedId, Feed>,
    by_payload_id: HashMap<String, FeedId>,
    index: HashMap<String, Partitions>,
    outbox: BTreeSet<FeedId>,
    meta: HashMap<String, i64>,
    subscriptions: HashMap<String, Vec<String>>,
}

impl Inner {
    fn feed_mut(&mut self, id: FeedId) -> Result<&mut Feed, StoreError> {
        self.feeds.get_mut(&id).ok_or(StoreError::NotFound(id))
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription; the directory is otherwise read-only.
    pub async fn subscribe(&self, subscriber: &str, channel: &str) {
        let mut inner = self.inner.write().await;
        let channels = inner.subscriptions.entry(subscriber.to_string()).or_default();
        if !channels.iter().any(|c| c == channel) {
            channels.push(channel.to_string());
        }
    }

    /// Overwrite the attempt counter of a stored feed.
    pub async fn set_attempts(&self, id: FeedId, attempts: u32) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.feed_mut(id)?.attempts = attempts;
        Ok(())
    }

    pub async fn feed_count(&self) -> usize {
        self.inner.read().await.feeds.len()
    }
}

/// Newest-first page over feeds already sorted ascending by id.
fn page_newest_first<'a>(feeds: impl DoubleEndedIterator<Item = &'a Feed>, page: PageRequest) -> Paged {
    let matched: Vec<Feed> = feeds.rev().cloned().collect();
    let total = matched.len();
    Paged {
        feeds: page.slice(matched),
        total,
    }
}

#[async_trait]
impl FeedStore for MemoryStore {
    async fn insert_feed(&self, feed: NewFeed) -> Result<Inserted, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(&existing) = inner.by_payload_id.get(&feed.payload_id) {
            return Ok(Inserted {
                feed_id: existing,
                created: false,
            });
        }
        inner.next_id += 1;
        let id = inner.next_id;
        inner.by_payload_id.insert(feed.payload_id.clone(), id);
        inner.feeds.insert(id, Feed::from_new(id, feed));
        inner.outbox.insert(id);
        Ok(Inserted {
            feed_id: id,
            created: true,
        })
    }

    async fn get_feed(&self, id: FeedId) -> Result<Option<Feed>, StoreError> {
        Ok(self.inner.read().await.feeds.get(&id).cloned())
    }

    async fn mark_processed(&self, id: FeedId, payload: &FeedPayload) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let feed = inner.feed_mut(id)?;
        feed.processed = true;
        feed.payload = payload.clone();
        Ok(())
    }

    async fn bump_attempts(&self, id: FeedId) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let feed = inner.feed_mut(id)?;
        feed.attempts = feed.attempts.saturating_add(1);
        Ok(())
    }

    async fn retry_candidates(
        &self,
        max_attempts: u32,
        limit: usize,
    ) -> Result<Vec<Feed>, StoreError> {
        let inner = self.inner.read().await;
        let mut candidates: Vec<&Feed> = inner
            .feeds
            .values()
            .filter(|f| {
                !f.processed
                    && !f.is_spam
                    && f.attempts < max_attempts
                    && !inner.outbox.contains(&f.id)
            })
            .collect();
        candidates.sort_by(|a, b| a.attempts.cmp(&b.attempts).then(b.id.cmp(&a.id)));
        Ok(candidates.into_iter().take(limit).cloned().collect())
    }

    async fn pending_dispatch(&self, limit: usize) -> Result<Vec<FeedId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.outbox.iter().take(limit).copied().collect())
    }

    async fn ack_dispatch(&self, id: FeedId) -> Result<(), StoreError> {
        self.inner.write().await.outbox.remove(&id);
        Ok(())
    }
}

#[async_trait]
impl RecipientIndex for MemoryStore {
    async fn append_feed(
        &self,
        recipient: &str,
        feed_id: FeedId,
        is_spam: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .index
            .entry(recipient.to_string())
            .or_default()
            .get_mut(is_spam)
            .insert(feed_id);
        Ok(())
    }

    async fn list_feed_ids(
        &self,
        recipient: &str,
        is_spam: bool,
    ) -> Result<Vec<FeedId>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .index
            .get(recipient)
            .map(|p| p.get(is_spam).iter().copied().collect())
            .unwrap_or_default())
    }

    async fn remove_feeds(&self, ids: &[FeedId]) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let mut removed = 0u64;
        for partitions in inner.index.values_mut() {
            for id in ids {
                removed += u64::from(partitions.normal.remove(id));
                removed += u64::from(partitions.spam.remove(id));
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl WatermarkStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<i64>, StoreError> {
        Ok(self.inner.read().await.meta.get(key).copied())
    }

    async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        self.inner.write().await.meta.insert(key.to_string(), value);
        Ok(())
    }

    async fn advance_if_at_least(&self, key: &str, value: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner.meta.get(key) {
            Some(&current) if value < current => Ok(false),
            _ => {
                inner.meta.insert(key.to_string(), value);
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl FeedQueries for MemoryStore {
    async fn page_by_ids(
        &self,
        ids: &[FeedId],
        filter: &IdFilter,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        let inner = self.inner.read().await;
        let wanted: BTreeSet<FeedId> = ids.iter().copied().collect();
        let matched = wanted
            .iter()
            .filter_map(|id| inner.feeds.get(id))
            .filter(|feed| filter.accepts(feed));
        Ok(page_newest_first(matched, page))
    }

    async fn page_by_sender(
        &self,
        sender: &str,
        kind: Option<NotificationKind>,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        let inner = self.inner.read().await;
        let matched = inner.feeds.values().filter(|feed| {
            feed.sender == sender
                && !feed.hidden
                && kind.is_none_or(|k| feed.payload.data.kind == k)
        });
        Ok(page_newest_first(matched, page))
    }

    async fn search(
        &self,
        criteria: &SearchCriteria,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        let inner = self.inner.read().await;
        let matched = inner.feeds.values().filter(|feed| criteria.accepts(feed));
        Ok(page_newest_first(matched, page))
    }

    async fn page_between(
        &self,
        start: i64,
        end: i64,
        page: PageRequest,
    ) -> Result<Paged, StoreError> {
        let inner = self.inner.read().await;
        let matched: Vec<Feed> = inner
            .feeds
            .values()
            .filter(|f| !f.is_spam && f.epoch >= start && f.epoch <= end)
            .cloned()
            .collect();
        let total = matched.len();
        Ok(Paged {
            feeds: page.slice(matched),
            total,
        })
    }

    async fn distinct_senders(&self, ids: &[FeedId]) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut seen = HashSet::new();
        Ok(ids
            .iter()
            .filter_map(|id| inner.feeds.get(id))
            .filter(|feed| seen.insert(feed.sender.clone()))
            .map(|feed| feed.sender.clone())
            .collect())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<Vec<FeedId>, StoreError> {
        let mut inner = self.inner.write().await;
        let expired: Vec<FeedId> = inner
            .feeds
            .values()
            .filter(|feed| feed.is_expired(now))
            .map(|feed| feed.id)
            .collect();
        for id in &expired {
            if let Some(feed) = inner.feeds.remove(id) {
                inner.by_payload_id.remove(&feed.payload_id);
            }
            inner.outbox.remove(id);
        }
        Ok(expired)
    }
}

#[async_trait]
impl SubscriptionDirectory for MemoryStore {
    async fn channels_for(&self, subscriber: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .subscriptions
            .get(subscriber)
            .cloned()
            .unwrap_or_default())
    }
}
