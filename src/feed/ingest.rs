//! Ingestion boundary: turns an untrusted request into a [`NewFeed`].
//!
//! Everything that can be rejected is rejected here, before anything is stored.

use std::collections::HashSet;

use chrono::DateTime;
use serde::Deserialize;
use serde_json::Value;

use super::{normalize_address, FeedPayload, NewFeed, NotificationKind, SenderType};
use crate::error::FeedError;

/// Raw add-feed request as produced by the upstream validation stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRequest {
    pub payload_id: String,
    pub sender: String,
    #[serde(default)]
    pub channel: Option<String>,
    pub sender_type: SenderType,
    pub recipients: Vec<String>,
    pub payload: Value,
    pub source: String,
    /// 0 or 1
    #[serde(default)]
    pub is_spam: u8,
    #[serde(default)]
    pub hidden: bool,
    /// Unix seconds
    #[serde(default)]
    pub expiry: Option<i64>,
    #[serde(default)]
    pub delegate: Option<String>,
}

/// Addressing rule implied by the notification type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Audience {
    Broadcast,
    Targeted(String),
    Subset(Vec<String>),
}

impl Audience {
    pub fn resolve(payload: &FeedPayload) -> Result<Self, FeedError> {
        let addresses = payload.recipients.addresses();
        match payload.data.kind {
            NotificationKind::Broadcast => Ok(Audience::Broadcast),
            NotificationKind::Targeted => match addresses.as_slice() {
                [single] => Ok(Audience::Targeted((*single).to_string())),
                _ => Err(FeedError::Validation(format!(
                    "targeted notification needs exactly one recipient, got {}",
                    addresses.len()
                ))),
            },
            NotificationKind::Subset if addresses.is_empty() => Err(FeedError::Validation(
                "subset notification has no recipients".into(),
            )),
            NotificationKind::Subset => Ok(Audience::Subset(
                addresses.into_iter().map(str::to_string).collect(),
            )),
        }
    }
}

impl IngestRequest {
    /// Validate the request and stamp it with `epoch`.
    pub fn into_new_feed(self, epoch: i64) -> Result<NewFeed, FeedError> {
        let payload_id = self.payload_id.trim().to_string();
        if payload_id.is_empty() {
            return Err(FeedError::Validation("payload id is empty".into()));
        }
        let sender = self.sender.trim().to_string();
        if sender.is_empty() {
            return Err(FeedError::Validation("sender is empty".into()));
        }
        let source = self.source.trim().to_string();
        if source.is_empty() {
            return Err(FeedError::Validation("source is empty".into()));
        }
        let is_spam = match self.is_spam {
            0 => false,
            1 => true,
            other => {
                return Err(FeedError::Validation(format!(
                    "is_spam must be 0 or 1, got {other}"
                )))
            }
        };

        let recipients = normalize_recipients(&self.recipients)?;
        let payload: FeedPayload = serde_json::from_value(self.payload)
            .map_err(|e| FeedError::Validation(format!("malformed payload: {e}")))?;
        Audience::resolve(&payload)?;

        let expiry = match self.expiry {
            Some(secs) => Some(DateTime::from_timestamp(secs, 0).ok_or_else(|| {
                FeedError::Validation(format!("expiry {secs} is out of range"))
            })?),
            None => None,
        };

        Ok(NewFeed {
            payload_id,
            sender,
            channel: self.channel.filter(|c| !c.trim().is_empty()),
            sender_type: self.sender_type,
            recipients,
            payload,
            source,
            is_spam,
            hidden: self.hidden,
            epoch,
            expiry,
            delegate: self.delegate.filter(|d| !d.trim().is_empty()),
        })
    }
}

fn normalize_recipients(raw: &[String]) -> Result<Vec<String>, FeedError> {
    let mut seen = HashSet::new();
    let mut recipients = Vec::with_capacity(raw.len());
    for address in raw {
        let normalized = normalize_address(address)
            .ok_or_else(|| FeedError::Validation(format!("invalid recipient: {address}")))?;
        if seen.insert(normalized.clone()) {
            recipients.push(normalized);
        }
    }
    Ok(recipients)
}
