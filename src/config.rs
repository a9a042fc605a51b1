//! Configuration loading and constants.
//!
//! Loads application configuration from TOML files and defines constants for
//! pipeline retry limits, outbox draining, session queues, paging bounds,
//! logging format, and default paths. `AppConfig` is the root configuration struct
//! containing all settings.

use const_format::formatcp;
use serde::Deserialize;
use std::path::Path;

// =============================================================================
// Pipeline Constants
// =============================================================================

/// Attempt cap after which an unprocessed feed is abandoned by the retry scheduler
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Number of feeds selected per retry pass
pub const DEFAULT_RETRY_BATCH_SIZE: usize = 50;

/// Seconds between retry passes
pub const DEFAULT_RETRY_INTERVAL_SECS: u64 = 60;

/// Number of outbox entries claimed per relay pass
pub const DEFAULT_RELAY_BATCH_SIZE: usize = 100;

/// Feeds processed concurrently by the outbox relay and the retry scheduler
pub const DEFAULT_PIPELINE_CONCURRENCY: usize = 16;

/// Seconds between outbox polls when no ingestion wake-up arrives
pub const DEFAULT_RELAY_POLL_SECS: u64 = 5;

/// Seconds between expiry sweeps
pub const DEFAULT_EXPIRY_SWEEP_SECS: u64 = 3600;

// =============================================================================
// Broadcast Constants
// =============================================================================

/// Key under which the broadcast watermark is persisted
pub const BROADCAST_WATERMARK_KEY: &str = "broadcastLatestEpoch";

/// Topic attached to every broadcast message
pub const DEFAULT_BROADCAST_TOPIC: &str = "Notification";

/// Subtopic attached to every broadcast message
pub const DEFAULT_BROADCAST_SUBTOPIC: &str = "Channel";

/// Request timeout for the broadcast webhook
pub const DEFAULT_BROADCAST_TIMEOUT_SECS: u64 = 10;

// =============================================================================
// Session Constants
// =============================================================================

/// Concurrent sessions allowed per end-user address
pub const DEFAULT_MAX_CONNECTIONS_PER_ADDRESS: usize = 10;

/// Capacity of each session's outbound event queue
pub const DEFAULT_SESSION_QUEUE_CAPACITY: usize = 64;

/// Page size of the snapshot sent to a freshly connected end-user session
pub const DEFAULT_INITIAL_PAGE_SIZE: usize = 10;

// =============================================================================
// Query Constants
// =============================================================================

/// Upper bound on any requested page size
pub const DEFAULT_MAX_PAGE_SIZE: usize = 100;

// =============================================================================
// Storage Constants
// =============================================================================

/// Postgres pool size
pub const DEFAULT_PG_MAX_CONNECTIONS: u32 = 10;

/// Milliseconds to wait for a pooled Postgres connection
pub const DEFAULT_PG_ACQUIRE_TIMEOUT_MS: u64 = 5000;

// =============================================================================
// Default Paths and Strings
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Crate name used as the log target prefix
pub const CRATE_TARGET: &str = "feedrelay";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = formatcp!("{}=debug,sqlx=warn", CRATE_TARGET);

/// Default log format (text or json)
pub const DEFAULT_LOG_FORMAT: &str = "text";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// WebSocket gateway listener
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub broadcast: BroadcastConfig,
    #[serde(default)]
    pub sessions: SessionConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Gateway listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
}

/// Which storage backend holds feeds, the recipient index and the watermark
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local maps; lost on restart
    #[default]
    Memory,
    /// Durable Postgres tables
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Postgres connection URL (required for the postgres backend)
    pub url: Option<String>,
    #[serde(default = "StoreConfig::default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "StoreConfig::default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: None,
            max_connections: Self::default_max_connections(),
            acquire_timeout_ms: Self::default_acquire_timeout_ms(),
        }
    }
}

impl StoreConfig {
    fn default_max_connections() -> u32 {
        DEFAULT_PG_MAX_CONNECTIONS
    }

    fn default_acquire_timeout_ms() -> u64 {
        DEFAULT_PG_ACQUIRE_TIMEOUT_MS
    }
}

/// Post-store pipeline settings
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Completion attempts before a feed is abandoned
    #[serde(default = "PipelineConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "PipelineConfig::default_retry_batch_size")]
    pub retry_batch_size: usize,
    #[serde(default = "PipelineConfig::default_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "PipelineConfig::default_relay_batch_size")]
    pub relay_batch_size: usize,
    #[serde(default = "PipelineConfig::default_relay_poll")]
    pub relay_poll_seconds: u64,
    /// Feeds processed at once by the relay and by each retry pass
    #[serde(default = "PipelineConfig::default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "PipelineConfig::default_expiry_sweep")]
    pub expiry_sweep_seconds: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            retry_batch_size: Self::default_retry_batch_size(),
            retry_interval_seconds: Self::default_retry_interval(),
            relay_batch_size: Self::default_relay_batch_size(),
            relay_poll_seconds: Self::default_relay_poll(),
            concurrency: Self::default_concurrency(),
            expiry_sweep_seconds: Self::default_expiry_sweep(),
        }
    }
}

impl PipelineConfig {
    fn default_max_attempts() -> u32 {
        DEFAULT_MAX_ATTEMPTS
    }
    fn default_retry_batch_size() -> usize {
        DEFAULT_RETRY_BATCH_SIZE
    }
    fn default_retry_interval() -> u64 {
        DEFAULT_RETRY_INTERVAL_SECS
    }
    fn default_relay_batch_size() -> usize {
        DEFAULT_RELAY_BATCH_SIZE
    }
    fn default_relay_poll() -> u64 {
        DEFAULT_RELAY_POLL_SECS
    }
    fn default_concurrency() -> usize {
        DEFAULT_PIPELINE_CONCURRENCY
    }
    fn default_expiry_sweep() -> u64 {
        DEFAULT_EXPIRY_SWEEP_SECS
    }
}

/// External broadcast topic settings
#[derive(Debug, Clone, Deserialize)]
pub struct BroadcastConfig {
    /// When false, feeds are never published and the watermark is left alone
    #[serde(default)]
    pub enabled: bool,
    /// Webhook URL that accepts broadcast messages
    pub endpoint: Option<String>,
    #[serde(default = "BroadcastConfig::default_topic")]
    pub topic: String,
    #[serde(default = "BroadcastConfig::default_subtopic")]
    pub subtopic: String,
    #[serde(default = "BroadcastConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: None,
            topic: Self::default_topic(),
            subtopic: Self::default_subtopic(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl BroadcastConfig {
    fn default_topic() -> String {
        DEFAULT_BROADCAST_TOPIC.to_string()
    }
    fn default_subtopic() -> String {
        DEFAULT_BROADCAST_SUBTOPIC.to_string()
    }
    fn default_timeout() -> u64 {
        DEFAULT_BROADCAST_TIMEOUT_SECS
    }
}

/// Live session settings
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "SessionConfig::default_max_connections_per_address")]
    pub max_connections_per_address: usize,
    #[serde(default = "SessionConfig::default_queue_capacity")]
    pub queue_capacity: usize,
    /// Feeds per snapshot event sent on connect
    #[serde(default = "SessionConfig::default_initial_page_size")]
    pub initial_page_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_connections_per_address: Self::default_max_connections_per_address(),
            queue_capacity: Self::default_queue_capacity(),
            initial_page_size: Self::default_initial_page_size(),
        }
    }
}

impl SessionConfig {
    fn default_max_connections_per_address() -> usize {
        DEFAULT_MAX_CONNECTIONS_PER_ADDRESS
    }
    fn default_queue_capacity() -> usize {
        DEFAULT_SESSION_QUEUE_CAPACITY
    }
    fn default_initial_page_size() -> usize {
        DEFAULT_INITIAL_PAGE_SIZE
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
    #[serde(default = "QueryConfig::default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_page_size: Self::default_max_page_size(),
        }
    }
}

impl QueryConfig {
    fn default_max_page_size() -> usize {
        DEFAULT_MAX_PAGE_SIZE
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// TTL for cached subscription lists in seconds (default: 5 minutes)
    #[serde(default = "CacheConfig::default_subscriptions_ttl")]
    pub subscriptions_ttl_seconds: u64,
    /// Maximum number of cached subscription lists (default: 10000)
    #[serde(default = "CacheConfig::default_max_subscribers")]
    pub max_subscribers: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            subscriptions_ttl_seconds: Self::default_subscriptions_ttl(),
            max_subscribers: Self::default_max_subscribers(),
        }
    }
}

impl CacheConfig {
    fn default_subscriptions_ttl() -> u64 {
        300 // 5 minutes
    }
    fn default_max_subscribers() -> u64 {
        10000
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "text" (human-readable, default) or "json" (structured)
    #[serde(default = "LoggingConfig::default_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: DEFAULT_LOG_FORMAT.to_string(),
        }
    }
}

impl LoggingConfig {
    fn default_format() -> String {
        DEFAULT_LOG_FORMAT.to_string()
    }

    pub fn is_json(&self) -> bool {
        self.format.eq_ignore_ascii_case("json")
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.store.backend == StoreBackend::Postgres && self.store.url.is_none() {
            return Err(ConfigError::Validation(
                "store.url is required when store.backend = \"postgres\"".to_string(),
            ));
        }

        if self.broadcast.enabled && self.broadcast.endpoint.is_none() {
            return Err(ConfigError::Validation(
                "broadcast.endpoint is required when broadcast.enabled = true".to_string(),
            ));
        }

        if self.pipeline.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "pipeline.max_attempts must be at least 1".to_string(),
            ));
        }

        if self.pipeline.retry_batch_size == 0
            || self.pipeline.relay_batch_size == 0
            || self.pipeline.concurrency == 0
        {
            return Err(ConfigError::Validation(
                "pipeline batch sizes and concurrency must be positive".to_string(),
            ));
        }

        if self.pipeline.retry_interval_seconds == 0
            || self.pipeline.relay_poll_seconds == 0
            || self.pipeline.expiry_sweep_seconds == 0
        {
            return Err(ConfigError::Validation(
                "pipeline intervals must be at least one second".to_string(),
            ));
        }

        if self.sessions.queue_capacity == 0 || self.sessions.max_connections_per_address == 0 {
            return Err(ConfigError::Validation(
                "sessions.queue_capacity and sessions.max_connections_per_address must be positive"
                    .to_string(),
            ));
        }

        if self.query.max_page_size == 0 {
            return Err(ConfigError::Validation(
                "query.max_page_size must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
