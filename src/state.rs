//! Shared application state and wiring of the relay's services.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::broadcast::BroadcastPublisher;
use crate::config::AppConfig;
use crate::dispatch::{Dispatcher, SessionRegistry};
use crate::error::AppError;
use crate::pipeline::{ExpirySweeper, FeedService, OutboxRelay, Pipeline, RetryScheduler};
use crate::query::QueryService;
use crate::store::Stores;
use crate::subscriptions::SubscriptionCache;

/// Shared state handed to gateway handlers, cloneable via Arc-wrapped fields.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub sessions: Arc<SessionRegistry>,
    pub feeds: FeedService,
    pub queries: QueryService,
}

/// The assembled relay: handler state plus the background loops that drive the pipeline.
pub struct Relay {
    pub state: AppState,
    pub pipeline: Arc<Pipeline>,
    pub outbox: Arc<OutboxRelay>,
    retry: Arc<RetryScheduler>,
    expiry: Arc<ExpirySweeper>,
}

impl Relay {
    pub fn assemble(config: AppConfig, stores: Stores) -> Result<Self, AppError> {
        let sessions = Arc::new(SessionRegistry::new(
            config.sessions.max_connections_per_address,
        ));
        let publisher = BroadcastPublisher::from_config(stores.watermarks.clone(), &config.broadcast)?;
        let pipeline = Arc::new(Pipeline::new(
            stores.feeds.clone(),
            Dispatcher::new(sessions.clone()),
            publisher,
        ));

        let notify = Arc::new(Notify::new());
        let feeds = FeedService::new(stores.feeds.clone(), stores.index.clone(), notify.clone());
        let outbox = Arc::new(OutboxRelay::new(
            stores.feeds.clone(),
            pipeline.clone(),
            notify,
            config.pipeline.relay_batch_size,
            config.pipeline.concurrency,
        ));
        let retry = Arc::new(RetryScheduler::new(
            stores.feeds.clone(),
            pipeline.clone(),
            &config.pipeline,
        ));
        let expiry = Arc::new(ExpirySweeper::new(
            stores.queries.clone(),
            stores.index.clone(),
        ));

        let subscriptions = Arc::new(SubscriptionCache::new(
            stores.subscriptions.clone(),
            &config.cache,
        ));
        let queries = QueryService::new(
            stores.index.clone(),
            stores.queries.clone(),
            subscriptions,
            config.query.max_page_size,
        );

        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                sessions,
                feeds,
                queries,
            },
            pipeline,
            outbox,
            retry,
            expiry,
        })
    }

    /// Start the outbox relay, retry scheduler and expiry sweeper.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let pipeline = &self.state.config.pipeline;
        vec![
            self.outbox
                .clone()
                .spawn(Duration::from_secs(pipeline.relay_poll_seconds)),
            self.retry
                .clone()
                .spawn(Duration::from_secs(pipeline.retry_interval_seconds)),
            self.expiry
                .clone()
                .spawn(Duration::from_secs(pipeline.expiry_sweep_seconds)),
        ]
    }
}
