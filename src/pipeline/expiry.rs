//! Periodic deletion of feeds past their expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument};

use crate::error::StoreError;
use crate::store::{FeedQueries, RecipientIndex};

pub struct ExpirySweeper {
    queries: Arc<dyn FeedQueries>,
    index: Arc<dyn RecipientIndex>,
}

impl ExpirySweeper {
    pub fn new(queries: Arc<dyn FeedQueries>, index: Arc<dyn RecipientIndex>) -> Self {
        Self { queries, index }
    }

    /// Delete every feed that expired before `now` and drop it from the recipient index.
    /// Returns the number of feeds deleted.
    #[instrument(name = "pipeline.expiry", skip(self))]
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let expired = self.queries.delete_expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let unindexed = self.index.remove_feeds(&expired).await?;
        info!(deleted = expired.len(), unindexed, "Expired feeds removed");
        Ok(expired.len())
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_once(Utc::now()).await {
                    error!(error = %e, "Expiry sweep failed");
                }
            }
        })
    }
}
