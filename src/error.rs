use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::io;

use crate::config::ConfigError;
use crate::feed::FeedId;

/// Failures raised by a storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("stored payload is not valid: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("feed {0} not found")]
    NotFound(FeedId),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures surfaced by ingestion, processing and queries.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// Request rejected before anything was stored
    #[error("invalid feed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// Recipient index append failed after the feed itself was stored
    #[error("recipient index update failed: {0}")]
    Index(#[source] StoreError),

    /// The broadcast watermark could not be consulted; the feed stays unprocessed
    #[error("feed {feed_id} left unprocessed: broadcast watermark unavailable")]
    WatermarkUnavailable { feed_id: FeedId },

    /// The processed flag could not be written; the attempt counter was bumped
    #[error("failed to complete feed {feed_id}: {source}")]
    Completion {
        feed_id: FeedId,
        #[source]
        source: StoreError,
    },
}

/// A single live target refused an event.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue for session {0} is full")]
    QueueFull(String),

    #[error("session {0} is closed")]
    Closed(String),
}

/// Broadcast publication failures. Logged, never retried.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("broadcast request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("broadcast endpoint rejected message: {0}")]
    Rejected(String),

    #[error("broadcast watermark unavailable: {0}")]
    Watermark(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("address {address} already has {limit} open connections")]
    TooManyConnections { address: String, limit: usize },

    #[error("invalid session address: {0}")]
    InvalidAddress(String),
}

/// Top-level error for the binary and the HTTP gateway.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Broadcast(#[from] PublishError),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::BadRequest(_)
            | AppError::Feed(FeedError::Validation(_))
            | AppError::Registry(RegistryError::InvalidAddress(_)) => {
                (StatusCode::BAD_REQUEST, self.to_string())
            }
            AppError::Registry(RegistryError::TooManyConnections { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, self.to_string())
            }
            AppError::Store(StoreError::Unavailable(_)) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "Store unavailable".to_string(),
            ),
            _ => {
                tracing::error!("Internal error: {:?}", self);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, message).into_response()
    }
}
