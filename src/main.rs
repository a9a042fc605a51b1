//! feedrelay: notification store-and-fan-out relay.
//!
//! Entry point. Initializes tracing, loads configuration from TOML, opens the configured
//! store, assembles the pipeline, starts its background loops and serves the gateway.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use feedrelay::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use feedrelay::gateway;
use feedrelay::store::Stores;
use feedrelay::Relay;

/// feedrelay: stores notification feeds and fans them out to live sessions
#[derive(Parser, Debug)]
#[command(name = "feedrelay", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "feedrelay=debug,sqlx=warn")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load before tracing so the log format can come from the file.
    let config = AppConfig::load(&args.config)?;

    // Priority: CLI > env > default
    let log_filter = args
        .log_level
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    let filter = tracing_subscriber::EnvFilter::new(&log_filter);

    if config.logging.is_json() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!(
        backend = ?config.store.backend,
        broadcast = config.broadcast.enabled,
        max_attempts = config.pipeline.max_attempts,
        "Loaded configuration"
    );

    let stores = Stores::open(&config.store).await?;
    let relay = Relay::assemble(config, stores)?;
    let background = relay.spawn_background();
    tracing::info!(tasks = background.len(), "Started pipeline background tasks");

    gateway::serve(relay.state.clone()).await?;

    for task in background {
        task.abort();
    }
    tracing::info!("Shutdown complete");
    Ok(())
}
