//! Read paths over stored feeds.
//!
//! Recipient queries resolve the candidate id set from the recipient index and re-derive
//! ordering from feed recency. Counts always describe the filtered set, not the page.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::instrument;

use crate::error::FeedError;
use crate::feed::{
    normalize_address, DateFilter, ExportFeed, ExportPage, FeedPage, FeedView, IdFilter,
    NotificationKind, PageRequest, SearchCriteria, SearchResults,
};
use crate::store::{FeedQueries, Paged, RecipientIndex, SubscriptionDirectory};

/// Structured search filter as sent by clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchFilter {
    /// Explicit sender set; falls back to the subscriber's subscriptions when absent
    #[serde(default)]
    pub channels: Option<Vec<String>>,
    #[serde(default)]
    pub date: Option<DateSpec>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DateSpec {
    Single(NaiveDate),
    #[serde(rename_all = "camelCase")]
    Range {
        low_date: NaiveDate,
        high_date: NaiveDate,
    },
}

impl SearchFilter {
    /// Parse the JSON filter string. An empty string means no filter.
    pub fn parse(raw: &str) -> Result<Self, FeedError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(raw)
            .map_err(|e| FeedError::Validation(format!("malformed search filter: {e}")))
    }

    fn date_filter(&self) -> Result<Option<DateFilter>, FeedError> {
        match self.date {
            None => Ok(None),
            Some(DateSpec::Single(day)) => Ok(Some(DateFilter::On(day))),
            Some(DateSpec::Range {
                low_date,
                high_date,
            }) => {
                if low_date > high_date {
                    return Err(FeedError::Validation(format!(
                        "date range {low_date}..{high_date} is inverted"
                    )));
                }
                Ok(Some(DateFilter::Between {
                    low: low_date,
                    high: high_date,
                }))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub subscriber: String,
    pub term: Option<String>,
    pub is_spam: bool,
    pub filter: SearchFilter,
    pub page: PageRequest,
}

#[derive(Clone)]
pub struct QueryService {
    index: Arc<dyn RecipientIndex>,
    queries: Arc<dyn FeedQueries>,
    subscriptions: Arc<dyn SubscriptionDirectory>,
    max_page_size: usize,
}

fn recipient_key(raw: &str) -> Result<String, FeedError> {
    normalize_address(raw).ok_or_else(|| FeedError::Validation(format!("invalid address: {raw}")))
}

fn into_page(paged: Paged) -> FeedPage {
    FeedPage {
        feeds: paged.feeds.into_iter().map(FeedView::from).collect(),
        itemcount: paged.total,
    }
}

impl QueryService {
    pub fn new(
        index: Arc<dyn RecipientIndex>,
        queries: Arc<dyn FeedQueries>,
        subscriptions: Arc<dyn SubscriptionDirectory>,
        max_page_size: usize,
    ) -> Self {
        Self {
            index,
            queries,
            subscriptions,
            max_page_size,
        }
    }

    async fn recipient_page(
        &self,
        recipient: &str,
        is_spam: bool,
        filter: IdFilter,
        page: PageRequest,
    ) -> Result<FeedPage, FeedError> {
        let recipient = recipient_key(recipient)?;
        let ids = self.index.list_feed_ids(&recipient, is_spam).await?;
        if ids.is_empty() {
            return Ok(FeedPage::default());
        }
        let paged = self
            .queries
            .page_by_ids(&ids, &filter, page.clamped(self.max_page_size))
            .await?;
        Ok(into_page(paged))
    }

    #[instrument(name = "query.list_feeds", skip(self))]
    pub async fn list_feeds(
        &self,
        recipient: &str,
        page: PageRequest,
        include_hidden: bool,
    ) -> Result<FeedPage, FeedError> {
        let filter = IdFilter {
            include_hidden,
            ..IdFilter::default()
        };
        self.recipient_page(recipient, false, filter, page).await
    }

    #[instrument(name = "query.list_spam_feeds", skip(self))]
    pub async fn list_spam_feeds(
        &self,
        recipient: &str,
        page: PageRequest,
        include_hidden: bool,
    ) -> Result<FeedPage, FeedError> {
        let filter = IdFilter {
            include_hidden,
            ..IdFilter::default()
        };
        self.recipient_page(recipient, true, filter, page).await
    }

    /// Non-hidden normal feeds a recipient got from one channel.
    #[instrument(name = "query.list_channel_feeds", skip(self))]
    pub async fn list_channel_feeds(
        &self,
        recipient: &str,
        channel: &str,
        page: PageRequest,
    ) -> Result<FeedPage, FeedError> {
        let filter = IdFilter {
            include_hidden: false,
            sender: Some(channel.to_string()),
            is_spam: Some(false),
        };
        self.recipient_page(recipient, false, filter, page).await
    }

    /// Non-hidden spam feeds a recipient got from one channel.
    #[instrument(name = "query.list_channel_spam_feeds", skip(self))]
    pub async fn list_channel_spam_feeds(
        &self,
        recipient: &str,
        channel: &str,
        page: PageRequest,
    ) -> Result<FeedPage, FeedError> {
        let filter = IdFilter {
            include_hidden: false,
            sender: Some(channel.to_string()),
            is_spam: Some(true),
        };
        self.recipient_page(recipient, true, filter, page).await
    }

    /// Senders that have spammed this recipient.
    #[instrument(name = "query.unique_spam_senders", skip(self))]
    pub async fn unique_spam_senders(&self, recipient: &str) -> Result<Vec<String>, FeedError> {
        let recipient = recipient_key(recipient)?;
        let ids = self.index.list_feed_ids(&recipient, true).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.queries.distinct_senders(&ids).await?)
    }

    #[instrument(name = "query.list_feeds_by_sender", skip(self))]
    pub async fn list_feeds_by_sender(
        &self,
        sender: &str,
        page: PageRequest,
        kind: Option<NotificationKind>,
    ) -> Result<FeedPage, FeedError> {
        let paged = self
            .queries
            .page_by_sender(sender, kind, page.clamped(self.max_page_size))
            .await?;
        Ok(into_page(paged))
    }

    #[instrument(
        name = "query.search",
        skip(self, request),
        fields(subscriber = %request.subscriber, is_spam = request.is_spam)
    )]
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResults, FeedError> {
        let date = request.filter.date_filter()?;
        let senders = match request.filter.channels {
            Some(channels) if !channels.is_empty() => channels,
            _ => {
                let subscriber = recipient_key(&request.subscriber)?;
                self.subscriptions.channels_for(&subscriber).await?
            }
        };
        if senders.is_empty() {
            return Ok(SearchResults::default());
        }

        let criteria = SearchCriteria {
            senders,
            term: request
                .term
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            is_spam: request.is_spam,
            date,
        };
        let paged = self
            .queries
            .search(&criteria, request.page.clamped(self.max_page_size))
            .await?;
        Ok(SearchResults {
            results: paged.feeds.into_iter().map(FeedView::from).collect(),
            count: paged.total,
        })
    }

    /// Non-spam feeds with epochs in `[start, end]`, oldest first, for historical export.
    #[instrument(name = "query.list_feeds_between", skip(self))]
    pub async fn list_feeds_between(
        &self,
        start: i64,
        end: i64,
        page: PageRequest,
    ) -> Result<ExportPage, FeedError> {
        if start > end {
            return Err(FeedError::Validation(format!(
                "time range {start}..{end} is inverted"
            )));
        }
        let paged = self
            .queries
            .page_between(start, end, page.clamped(self.max_page_size))
            .await?;
        Ok(ExportPage {
            feeds: paged.feeds.into_iter().map(ExportFeed::from).collect(),
            count: paged.total,
        })
    }
}
