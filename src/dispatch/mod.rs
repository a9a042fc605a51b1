//! Live fan-out of newly stored feeds.
//!
//! Two tiers are served concurrently for every feed:
//! - end-user sessions whose address is among the feed's recipients get a `userFeeds` or
//!   `userSpamFeeds` event
//! - every delivery node gets the full feed as a `liveFeeds` event
//!
//! Each target is delivered to independently. A failing target is logged and skipped and never
//! delays its siblings.

pub mod messages;
pub mod sessions;

pub use messages::{LiveEvent, NodeRequest, SessionMode};
pub use sessions::SessionRegistry;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, instrument, warn, Span};
use uuid::Uuid;

use crate::error::DeliveryError;
use crate::feed::{DeliveryFeed, Feed, FeedPayload, LiveFeed};

/// A connected session that can receive events.
#[async_trait]
pub trait LiveTarget: Send + Sync {
    fn id(&self) -> Uuid;

    async fn deliver(&self, event: LiveEvent) -> Result<(), DeliveryError>;
}

/// Target backed by the bounded outbound queue of a WebSocket session.
///
/// Delivery never waits: a full queue is reported as a failure for this target only.
pub struct ChannelTarget {
    id: Uuid,
    tx: async_channel::Sender<LiveEvent>,
}

impl ChannelTarget {
    pub fn new(tx: async_channel::Sender<LiveEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }
}

#[async_trait]
impl LiveTarget for ChannelTarget {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn deliver(&self, event: LiveEvent) -> Result<(), DeliveryError> {
        self.tx.try_send(event).map_err(|e| match e {
            async_channel::TrySendError::Full(_) => DeliveryError::QueueFull(self.id.to_string()),
            async_channel::TrySendError::Closed(_) => DeliveryError::Closed(self.id.to_string()),
        })
    }
}

/// Per-tier delivery counts for one feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub clients_delivered: usize,
    pub clients_failed: usize,
    pub nodes_delivered: usize,
    pub nodes_failed: usize,
}

#[derive(Clone)]
pub struct Dispatcher {
    sessions: Arc<SessionRegistry>,
}

impl Dispatcher {
    pub fn new(sessions: Arc<SessionRegistry>) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    /// Push `feed` (with its enriched `payload`) to both tiers. Never fails.
    #[instrument(
        name = "dispatch.feed",
        skip(self, feed, payload),
        fields(feed_id = feed.id, is_spam = feed.is_spam, duration_ms)
    )]
    pub async fn dispatch(&self, feed: &Feed, payload: &FeedPayload) -> DispatchReport {
        let start = Instant::now();

        let live = LiveFeed {
            id: feed.id,
            sender: feed.sender.clone(),
            epoch: feed.epoch,
            payload: payload.clone(),
            source: feed.source.clone(),
        };
        let client_event = if feed.is_spam {
            LiveEvent::UserSpamFeeds(live)
        } else {
            LiveEvent::UserFeeds(live)
        };
        let node_event = LiveEvent::LiveFeeds(DeliveryFeed {
            id: feed.id,
            payload_id: feed.payload_id.clone(),
            sender: feed.sender.clone(),
            recipients: feed.recipients.clone(),
            payload: payload.clone(),
            epoch: feed.epoch,
            source: feed.source.clone(),
            is_spam: feed.is_spam,
        });

        let (clients, nodes) = tokio::join!(
            self.sessions.clients_for(&feed.recipients),
            self.sessions.nodes()
        );
        let ((clients_delivered, clients_failed), (nodes_delivered, nodes_failed)) = tokio::join!(
            deliver_all(clients, client_event),
            deliver_all(nodes, node_event)
        );

        let report = DispatchReport {
            clients_delivered,
            clients_failed,
            nodes_delivered,
            nodes_failed,
        };
        Span::current().record("duration_ms", start.elapsed().as_millis() as u64);
        debug!(?report, "Dispatched feed");
        report
    }
}

/// Deliver `event` to every target concurrently. Returns `(delivered, failed)`.
async fn deliver_all(targets: Vec<Arc<dyn LiveTarget>>, event: LiveEvent) -> (usize, usize) {
    let name = event.name();
    let results = join_all(targets.iter().map(|target| {
        let event = event.clone();
        async move {
            let result = target.deliver(event).await;
            if let Err(e) = &result {
                warn!(session = %target.id(), event = name, error = %e, "Live delivery failed");
            }
            result
        }
    }))
    .await;
    let delivered = results.iter().filter(|r| r.is_ok()).count();
    (delivered, results.len() - delivered)
}
