//! Re-drives feeds whose completion write failed.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, instrument, warn, Span};

use super::Pipeline;
use crate::config::PipelineConfig;
use crate::error::StoreError;
use crate::store::FeedStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub selected: usize,
    pub completed: usize,
    pub failed: usize,
}

pub struct RetryScheduler {
    feeds: Arc<dyn FeedStore>,
    pipeline: Arc<Pipeline>,
    max_attempts: u32,
    batch_size: usize,
    concurrency: usize,
}

impl RetryScheduler {
    pub fn new(feeds: Arc<dyn FeedStore>, pipeline: Arc<Pipeline>, config: &PipelineConfig) -> Self {
        Self {
            feeds,
            pipeline,
            max_attempts: config.max_attempts,
            batch_size: config.retry_batch_size,
            concurrency: config.concurrency,
        }
    }

    /// Select one batch of retry candidates and run each through the pipeline.
    #[instrument(name = "pipeline.retry", skip(self), fields(selected, failed))]
    pub async fn run_once(&self) -> Result<RetryReport, StoreError> {
        let candidates = self
            .feeds
            .retry_candidates(self.max_attempts, self.batch_size)
            .await?;
        let selected = candidates.len();

        let failed = stream::iter(candidates)
            .map(|feed| async move {
                match self.pipeline.process(&feed).await {
                    Ok(_) => false,
                    Err(e) => {
                        warn!(feed_id = feed.id, attempts = feed.attempts + 1, error = %e, "Retry failed");
                        true
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|failed| futures::future::ready(*failed))
            .count()
            .await;

        Span::current().record("selected", selected);
        Span::current().record("failed", failed);
        Ok(RetryReport {
            selected,
            completed: selected - failed,
            failed,
        })
    }

    pub fn spawn(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_secs = every.as_secs(), "Retry scheduler started");
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_once().await {
                    error!(error = %e, "Retry pass failed");
                }
            }
        })
    }
}
