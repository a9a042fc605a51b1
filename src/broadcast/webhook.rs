//! HTTP sink for the broadcast topic.
//!
//! Each message is POSTed as JSON to the configured endpoint. Any non-2xx status counts as a
//! failed publish.

use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use super::{BroadcastMessage, BroadcastSink};
use crate::error::PublishError;

pub struct WebhookSink {
    client: reqwest::Client,
    endpoint: String,
}

impl WebhookSink {
    pub fn new(endpoint: String, timeout_seconds: u64) -> Result<Self, PublishError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl BroadcastSink for WebhookSink {
    #[instrument(name = "broadcast.webhook", skip_all, fields(feed_id = message.id))]
    async fn publish(&self, message: &BroadcastMessage) -> Result<(), PublishError> {
        let response = self.client.post(&self.endpoint).json(message).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Rejected(status.to_string()));
        }
        Ok(())
    }
}
