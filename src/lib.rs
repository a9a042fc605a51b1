//! feedrelay - notification store-and-fan-out relay
//!
//! Accepts verified notification feeds, stores them idempotently, indexes them per recipient,
//! and fans each new feed out to connected end-user sessions, delivery nodes and an external
//! broadcast topic. Feeds whose completion fails are retried up to an attempt cap.
//!
//! The library exposes every stage so upstream ingestion and HTTP layers can embed the relay;
//! the binary wires them together behind a WebSocket gateway.

pub mod broadcast;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod feed;
pub mod gateway;
pub mod middleware;
pub mod pipeline;
pub mod query;
pub mod state;
pub mod store;
pub mod subscriptions;

pub use error::{AppError, FeedError, StoreError};
pub use state::{AppState, Relay};
