//! Request ID middleware for correlating logs with gateway requests.
//!
//! Every request, including WebSocket upgrades, runs inside a span carrying a fresh UUID.

use std::time::Instant;

use axum::{extract::Request, middleware::Next, response::Response};
use tracing::Instrument;
use uuid::Uuid;

/// Outermost layer: wraps the request in a `request` span and logs completion.
pub async fn request_id_layer(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %request.method(),
        path = %request.uri().path(),
        duration_ms = tracing::field::Empty,
    );
    let start = Instant::now();

    async move {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;
        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::debug!(status = response.status().as_u16(), duration_ms, "Request completed");
        response
    }
    .instrument(span)
    .await
}
