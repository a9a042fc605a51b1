//! HTTP surface of the relay: the live-session socket and a liveness check.

pub mod shutdown;
pub mod socket;

pub use shutdown::shutdown_signal;

use std::net::SocketAddr;

use axum::{middleware, routing::get, Router};

use crate::config::ConfigError;
use crate::error::AppError;
use crate::middleware::request_id_layer;
use crate::state::AppState;

/// Liveness check; only checks that the process can answer HTTP.
pub async fn health() -> &'static str {
    "ok"
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/socket", get(socket::socket_handler))
        .layer(middleware::from_fn(request_id_layer))
        .with_state(state)
}

/// Bind the gateway and serve until a shutdown signal arrives.
pub async fn serve(state: AppState) -> Result<(), AppError> {
    let addr: SocketAddr = format!("{}:{}", state.config.gateway.host, state.config.gateway.port)
        .parse()
        .map_err(|e| {
            ConfigError::Validation(format!("invalid gateway.host or gateway.port: {e}"))
        })?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Gateway listening on {}", addr);

    axum::serve(
        listener,
        create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    Ok(())
}
