//! External broadcast publication gated by the epoch watermark.
//!
//! A feed is published only if its epoch is not older than the highest epoch already accepted.
//! The check and the advance are one conditional store update. Publication is at most once per
//! accepted feed: a failed publish is logged and the watermark stays where it is. When the
//! watermark itself cannot be reached nothing is published and the caller keeps the feed.

pub mod webhook;

pub use webhook::WebhookSink;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, instrument, warn};

use crate::config::{BroadcastConfig, BROADCAST_WATERMARK_KEY};
use crate::error::PublishError;
use crate::feed::{Feed, FeedId, FeedPayload};
use crate::store::WatermarkStore;

/// Message delivered to the broadcast topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub id: FeedId,
    pub sender: String,
    pub recipients: Vec<String>,
    pub payload: FeedPayload,
    pub epoch: i64,
    pub is_spam: bool,
    pub topic: String,
    pub subtopic: String,
}

#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), PublishError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Published,
    /// Epoch older than the watermark
    Stale,
    /// Watermark accepted the feed but the sink failed
    Failed,
    /// Watermark could not be read or advanced; nothing was published
    WatermarkUnavailable,
    /// Broadcast switched off
    Disabled,
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PublishOutcome::Published => write!(f, "published"),
            PublishOutcome::Stale => write!(f, "stale"),
            PublishOutcome::Failed => write!(f, "failed"),
            PublishOutcome::WatermarkUnavailable => write!(f, "watermark_unavailable"),
            PublishOutcome::Disabled => write!(f, "disabled"),
        }
    }
}

#[derive(Clone)]
pub struct BroadcastPublisher {
    watermarks: Arc<dyn WatermarkStore>,
    sink: Option<Arc<dyn BroadcastSink>>,
    topic: String,
    subtopic: String,
}

impl BroadcastPublisher {
    /// A publisher with no sink never reads or moves the watermark.
    pub fn new(
        watermarks: Arc<dyn WatermarkStore>,
        sink: Option<Arc<dyn BroadcastSink>>,
        config: &BroadcastConfig,
    ) -> Self {
        Self {
            watermarks,
            sink,
            topic: config.topic.clone(),
            subtopic: config.subtopic.clone(),
        }
    }

    /// Build the publisher described by configuration, with a webhook sink when enabled.
    pub fn from_config(
        watermarks: Arc<dyn WatermarkStore>,
        config: &BroadcastConfig,
    ) -> Result<Self, PublishError> {
        let sink = match (&config.endpoint, config.enabled) {
            (Some(endpoint), true) => {
                let webhook: Arc<dyn BroadcastSink> =
                    Arc::new(WebhookSink::new(endpoint.clone(), config.timeout_seconds)?);
                Some(webhook)
            }
            _ => None,
        };
        Ok(Self::new(watermarks, sink, config))
    }

    #[instrument(
        name = "broadcast.publish",
        skip(self, feed, payload),
        fields(feed_id = feed.id, epoch = feed.epoch, outcome)
    )]
    pub async fn publish(&self, feed: &Feed, payload: &FeedPayload) -> PublishOutcome {
        let outcome = self.try_publish(feed, payload).await;
        tracing::Span::current().record("outcome", tracing::field::display(outcome));
        outcome
    }

    async fn try_publish(&self, feed: &Feed, payload: &FeedPayload) -> PublishOutcome {
        let Some(sink) = &self.sink else {
            return PublishOutcome::Disabled;
        };

        match self
            .watermarks
            .advance_if_at_least(BROADCAST_WATERMARK_KEY, feed.epoch)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!("Skipping broadcast of stale feed");
                return PublishOutcome::Stale;
            }
            Err(e) => {
                error!(error = %PublishError::Watermark(e), "Broadcast skipped");
                return PublishOutcome::WatermarkUnavailable;
            }
        }

        let message = BroadcastMessage {
            id: feed.id,
            sender: feed.sender.clone(),
            recipients: feed.recipients.clone(),
            payload: payload.clone(),
            epoch: feed.epoch,
            is_spam: feed.is_spam,
            topic: self.topic.clone(),
            subtopic: self.subtopic.clone(),
        };
        match sink.publish(&message).await {
            Ok(()) => PublishOutcome::Published,
            Err(e) => {
                warn!(error = %e, "Broadcast publish failed; not retried");
                PublishOutcome::Failed
            }
        }
    }
}
