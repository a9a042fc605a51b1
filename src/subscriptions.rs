//! Cached subscriber to channel lookups used by search.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use tracing::instrument;

use crate::config::CacheConfig;
use crate::error::StoreError;
use crate::store::SubscriptionDirectory;

/// Read-through cache in front of a [`SubscriptionDirectory`].
///
/// Only successful lookups are cached.
#[derive(Clone)]
pub struct SubscriptionCache {
    directory: Arc<dyn SubscriptionDirectory>,
    cache: Cache<String, Arc<Vec<String>>>,
}

impl SubscriptionCache {
    pub fn new(directory: Arc<dyn SubscriptionDirectory>, config: &CacheConfig) -> Self {
        let cache = Cache::builder()
            .max_capacity(config.max_subscribers)
            .time_to_live(Duration::from_secs(config.subscriptions_ttl_seconds))
            .build();
        Self { directory, cache }
    }
}

#[async_trait]
impl SubscriptionDirectory for SubscriptionCache {
    #[instrument(
        name = "subscriptions.channels_for",
        skip(self),
        fields(cache_hit = false, duration_ms)
    )]
    async fn channels_for(&self, subscriber: &str) -> Result<Vec<String>, StoreError> {
        let start = Instant::now();
        if let Some(channels) = self.cache.get(subscriber).await {
            tracing::Span::current().record("cache_hit", true);
            tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
            return Ok(channels.as_ref().clone());
        }

        let channels = self.directory.channels_for(subscriber).await?;
        self.cache
            .insert(subscriber.to_string(), Arc::new(channels.clone()))
            .await;
        tracing::Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        Ok(channels)
    }
}
