//! Wire events exchanged with live sessions.
//!
//! Outbound events are queued per session by the dispatcher and serialized to WebSocket text
//! frames by the session writer. Delivery nodes may also send [`NodeRequest`]s back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::feed::{DeliveryFeed, ExportPage, FeedPage, LiveFeed};

/// Which side of the socket a session represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// End-user client bound to one address
    Client,
    /// Downstream delivery node receiving the unfiltered stream
    Delivery,
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionMode::Client => write!(f, "client"),
            SessionMode::Delivery => write!(f, "delivery"),
        }
    }
}

/// Event sent to a live session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum LiveEvent {
    /// New normal feed for a matched client
    #[serde(rename = "userFeeds")]
    UserFeeds(LiveFeed),
    /// New spam feed for a matched client
    #[serde(rename = "userSpamFeeds")]
    UserSpamFeeds(LiveFeed),
    /// Every new feed, for delivery nodes
    #[serde(rename = "liveFeeds")]
    LiveFeeds(DeliveryFeed),
    /// First page of normal feeds, sent on connect
    #[serde(rename = "feed")]
    Feed(FeedPage),
    /// First page of spam feeds, sent on connect
    #[serde(rename = "spam")]
    Spam(FeedPage),
    /// Reply to a historical export request
    #[serde(rename = "historicalFeeds")]
    HistoricalFeeds(ExportPage),
}

impl LiveEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LiveEvent::UserFeeds(_) => "userFeeds",
            LiveEvent::UserSpamFeeds(_) => "userSpamFeeds",
            LiveEvent::LiveFeeds(_) => "liveFeeds",
            LiveEvent::Feed(_) => "feed",
            LiveEvent::Spam(_) => "spam",
            LiveEvent::HistoricalFeeds(_) => "historicalFeeds",
        }
    }
}

/// Request sent by a delivery node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum NodeRequest {
    #[serde(rename = "historicalFeeds")]
    HistoricalFeeds {
        start_time: i64,
        end_time: i64,
        #[serde(default = "NodeRequest::default_page")]
        page: usize,
        #[serde(default = "NodeRequest::default_page_size")]
        page_size: usize,
    },
}

impl NodeRequest {
    fn default_page() -> usize {
        1
    }

    fn default_page_size() -> usize {
        crate::config::DEFAULT_MAX_PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::tests::sample_payload;
    use serde_json::json;

    #[test]
    fn test_session_mode_display() {
        assert_eq!(SessionMode::Client.to_string(), "client");
        assert_eq!(SessionMode::Delivery.to_string(), "delivery");
    }

    #[test]
    fn test_user_event_shape() {
        let event = LiveEvent::UserSpamFeeds(LiveFeed {
            id: 5,
            sender: "eip155:0xchannel".into(),
            epoch: 1000,
            payload: sample_payload("t"),
            source: "ETH_TEST_SEPOLIA".into(),
        });
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], json!("userSpamFeeds"));
        assert_eq!(value["data"]["id"], json!(5));
        assert_eq!(value["data"]["payload"]["notification"]["title"], json!("t"));
        assert_eq!(event.name(), "userSpamFeeds");
    }

    #[test]
    fn test_snapshot_event_shape() {
        let value = serde_json::to_value(LiveEvent::Feed(FeedPage::default())).unwrap();
        assert_eq!(value, json!({"event": "feed", "data": {"feeds": [], "itemcount": 0}}));
    }

    #[test]
    fn test_node_request_parses() {
        let request: NodeRequest = serde_json::from_value(json!({
            "event": "historicalFeeds",
            "startTime": 10,
            "endTime": 20,
            "pageSize": 5
        }))
        .unwrap();
        assert_eq!(
            request,
            NodeRequest::HistoricalFeeds {
                start_time: 10,
                end_time: 20,
                page: 1,
                page_size: 5
            }
        );
    }
}
