//! Feed data model.
//!
//! A [`Feed`] is one stored notification. Its [`FeedPayload`] is carried opaquely through
//! the pipeline except for the typed `data.type` tag ([`NotificationKind`]) and the two
//! enrichment fields (`data.sid`, `data.epoch`) written before completion.
//!
//! This module also holds the wire views handed to live sessions, delivery nodes and the
//! query surface, and the paging/search criteria shared by the storage backends.

mod address;
pub mod ingest;

pub use address::normalize_address;
pub use ingest::IngestRequest;

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Monotonic surrogate key; larger ids are more recent.
pub type FeedId = i64;

// =============================================================================
// Tags
// =============================================================================

/// Kind of actor that emitted the notification.
///
/// Accepted on the wire either as the numeric code or as the lowercase name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "u8")]
pub enum SenderType {
    Channel,
    Chat,
    Video,
    Space,
}

impl SenderType {
    pub fn code(self) -> u8 {
        match self {
            SenderType::Channel => 0,
            SenderType::Chat => 1,
            SenderType::Video => 2,
            SenderType::Space => 3,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            0 => Some(SenderType::Channel),
            1 => Some(SenderType::Chat),
            2 => Some(SenderType::Video),
            3 => Some(SenderType::Space),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SenderType::Channel => "channel",
            SenderType::Chat => "chat",
            SenderType::Video => "video",
            SenderType::Space => "space",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "channel" => Some(SenderType::Channel),
            "chat" => Some(SenderType::Chat),
            "video" => Some(SenderType::Video),
            "space" => Some(SenderType::Space),
            other => other.parse::<u64>().ok().and_then(Self::from_code),
        }
    }
}

impl From<SenderType> for u8 {
    fn from(value: SenderType) -> Self {
        value.code()
    }
}

impl TryFrom<Value> for SenderType {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let parsed = match &value {
            Value::Number(n) => n.as_u64().and_then(Self::from_code),
            Value::String(s) => Self::parse(s),
            _ => None,
        };
        parsed.ok_or_else(|| format!("unknown sender type: {value}"))
    }
}

impl fmt::Display for SenderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Notification type tag embedded in `payload.data.type`.
///
/// Serialized as its integer code. Numeric strings are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "u8")]
pub enum NotificationKind {
    /// Every subscriber of the sender
    Broadcast,
    /// Exactly one recipient
    Targeted,
    /// An explicit subset of subscribers
    Subset,
}

impl NotificationKind {
    pub fn code(self) -> u8 {
        match self {
            NotificationKind::Broadcast => 1,
            NotificationKind::Targeted => 3,
            NotificationKind::Subset => 4,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(NotificationKind::Broadcast),
            3 => Some(NotificationKind::Targeted),
            4 => Some(NotificationKind::Subset),
            _ => None,
        }
    }
}

impl From<NotificationKind> for u8 {
    fn from(value: NotificationKind) -> Self {
        value.code()
    }
}

impl TryFrom<Value> for NotificationKind {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let code = match &value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        code.and_then(Self::from_code)
            .ok_or_else(|| format!("unknown notification type: {value}"))
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Title and body shown to the end user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationText {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
}

/// Recipient list as embedded in the signed payload.
///
/// Senders encode it as a single address, a list, or an object keyed by address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PayloadRecipients {
    One(String),
    Many(Vec<String>),
    Keyed(BTreeMap<String, Value>),
}

impl PayloadRecipients {
    pub fn addresses(&self) -> Vec<&str> {
        match self {
            PayloadRecipients::One(address) => vec![address.as_str()],
            PayloadRecipients::Many(list) => list.iter().map(String::as_str).collect(),
            PayloadRecipients::Keyed(map) => map.keys().map(String::as_str).collect(),
        }
    }
}

/// Structured notification data. Fields the relay never inspects are kept in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadData {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    /// Feed id, written during enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<String>,
    /// Feed epoch, written during enrichment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
    /// Subject line
    #[serde(default)]
    pub asub: String,
    /// Message text
    #[serde(default)]
    pub amsg: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedPayload {
    pub data: PayloadData,
    #[serde(default)]
    pub notification: NotificationText,
    pub recipients: PayloadRecipients,
    #[serde(rename = "verificationProof", default)]
    pub verification_proof: String,
}

impl FeedPayload {
    /// Copy of the payload stamped with the feed id and epoch.
    pub fn enriched(&self, id: FeedId, epoch: i64) -> FeedPayload {
        let mut payload = self.clone();
        payload.data.sid = Some(id.to_string());
        payload.data.epoch = Some(epoch.to_string());
        payload
    }

    /// Case-insensitive substring match over the user-visible text fields.
    ///
    /// `needle` must already be lowercase.
    pub fn matches_term(&self, needle: &str) -> bool {
        [
            self.notification.title.as_str(),
            self.notification.body.as_str(),
            self.data.asub.as_str(),
            self.data.amsg.as_str(),
        ]
        .iter()
        .any(|field| field.to_lowercase().contains(needle))
    }
}

// =============================================================================
// Feed records
// =============================================================================

/// A validated feed ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFeed {
    pub payload_id: String,
    pub sender: String,
    pub channel: Option<String>,
    pub sender_type: SenderType,
    /// Normalized, de-duplicated recipient addresses
    pub recipients: Vec<String>,
    pub payload: FeedPayload,
    pub source: String,
    pub is_spam: bool,
    pub hidden: bool,
    pub epoch: i64,
    pub expiry: Option<DateTime<Utc>>,
    pub delegate: Option<String>,
}

/// A stored feed.
#[derive(Debug, Clone, PartialEq)]
pub struct Feed {
    pub id: FeedId,
    pub payload_id: String,
    pub sender: String,
    pub channel: Option<String>,
    pub sender_type: SenderType,
    pub recipients: Vec<String>,
    pub payload: FeedPayload,
    pub source: String,
    pub is_spam: bool,
    pub hidden: bool,
    pub epoch: i64,
    pub expiry: Option<DateTime<Utc>>,
    pub delegate: Option<String>,
    pub processed: bool,
    pub attempts: u32,
}

impl Feed {
    pub fn from_new(id: FeedId, new: NewFeed) -> Self {
        Self {
            id,
            payload_id: new.payload_id,
            sender: new.sender,
            channel: new.channel,
            sender_type: new.sender_type,
            recipients: new.recipients,
            payload: new.payload,
            source: new.source,
            is_spam: new.is_spam,
            hidden: new.hidden,
            epoch: new.epoch,
            expiry: new.expiry,
            delegate: new.delegate,
            processed: false,
            attempts: 0,
        }
    }

    /// UTC calendar day of the feed epoch.
    pub fn epoch_date(&self) -> Option<NaiveDate> {
        DateTime::from_timestamp(self.epoch, 0).map(|dt| dt.date_naive())
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry.is_some_and(|expiry| expiry < now)
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inserted {
    pub feed_id: FeedId,
    /// False when a feed with the same payload id already existed
    pub created: bool,
}

// =============================================================================
// Paging and search criteria
// =============================================================================

/// One-based page request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub page: usize,
    pub page_size: usize,
}

impl PageRequest {
    pub fn new(page: usize, page_size: usize) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.max(1),
        }
    }

    pub fn clamped(self, max_page_size: usize) -> Self {
        Self {
            page: self.page,
            page_size: self.page_size.min(max_page_size.max(1)),
        }
    }

    /// Items before this page. Saturates, so an absurd page number reads past the end.
    pub fn offset(&self) -> usize {
        self.page.saturating_sub(1).saturating_mul(self.page_size)
    }

    /// Take this page out of an already ordered list.
    pub fn slice<T>(&self, items: Vec<T>) -> Vec<T> {
        items
            .into_iter()
            .skip(self.offset())
            .take(self.page_size)
            .collect()
    }
}

/// Filter applied to a recipient's candidate id set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdFilter {
    pub include_hidden: bool,
    pub sender: Option<String>,
    pub is_spam: Option<bool>,
}

impl IdFilter {
    pub fn accepts(&self, feed: &Feed) -> bool {
        (self.include_hidden || !feed.hidden)
            && self.sender.as_ref().is_none_or(|s| &feed.sender == s)
            && self.is_spam.is_none_or(|spam| feed.is_spam == spam)
    }
}

/// Calendar filter on the feed epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateFilter {
    On(NaiveDate),
    /// Exclusive lower bound, inclusive upper bound
    Between { low: NaiveDate, high: NaiveDate },
}

impl DateFilter {
    pub fn contains(&self, date: NaiveDate) -> bool {
        match *self {
            DateFilter::On(day) => date == day,
            DateFilter::Between { low, high } => date > low && date <= high,
        }
    }
}

/// Resolved search criteria handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub senders: Vec<String>,
    /// Lowercased search term
    pub term: Option<String>,
    pub is_spam: bool,
    pub date: Option<DateFilter>,
}

impl SearchCriteria {
    pub fn accepts(&self, feed: &Feed) -> bool {
        feed.is_spam == self.is_spam
            && self.senders.iter().any(|s| s == &feed.sender)
            && self
                .term
                .as_deref()
                .is_none_or(|term| feed.payload.matches_term(term))
            && self.date.is_none_or(|filter| {
                feed.epoch_date().is_some_and(|date| filter.contains(date))
            })
    }
}

// =============================================================================
// Wire views
// =============================================================================

/// Feed as returned by the query surface and the connect snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedView {
    pub id: FeedId,
    pub payload_id: String,
    pub sender: String,
    pub epoch: i64,
    pub payload: FeedPayload,
    pub source: String,
    pub etime: Option<DateTime<Utc>>,
}

impl From<Feed> for FeedView {
    fn from(feed: Feed) -> Self {
        Self {
            id: feed.id,
            payload_id: feed.payload_id,
            sender: feed.sender,
            epoch: feed.epoch,
            payload: feed.payload,
            source: feed.source,
            etime: feed.expiry,
        }
    }
}

/// Feed pushed to a matched end-user session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveFeed {
    pub id: FeedId,
    pub sender: String,
    pub epoch: i64,
    pub payload: FeedPayload,
    pub source: String,
}

/// Full feed pushed to every delivery node.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryFeed {
    pub id: FeedId,
    pub payload_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub payload: FeedPayload,
    pub epoch: i64,
    pub source: String,
    pub is_spam: bool,
}

/// Feed row in a historical export.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportFeed {
    pub id: FeedId,
    pub payload_id: String,
    pub recipients: Vec<String>,
    pub payload: FeedPayload,
    pub epoch: i64,
}

impl From<Feed> for ExportFeed {
    fn from(feed: Feed) -> Self {
        Self {
            id: feed.id,
            payload_id: feed.payload_id,
            recipients: feed.recipients,
            payload: feed.payload,
            epoch: feed.epoch,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedPage {
    pub feeds: Vec<FeedView>,
    pub itemcount: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchResults {
    pub results: Vec<FeedView>,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportPage {
    pub feeds: Vec<ExportFeed>,
    pub count: usize,
}
