//! WebSocket sessions for end-user clients and delivery nodes.
//!
//! `GET /socket?mode=client&address=<addr>` or `GET /socket?mode=delivery`.
//!
//! Admission happens before the upgrade so a refused connection gets a plain HTTP error.
//! Each admitted session owns a bounded event queue drained by a writer task; the dispatcher
//! only ever `try_send`s into it.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dispatch::{ChannelTarget, LiveEvent, NodeRequest, SessionMode, SessionRegistry};
use crate::error::{AppError, RegistryError};
use crate::feed::{normalize_address, PageRequest};
use crate::query::QueryService;
use crate::state::AppState;

#[derive(Debug, Clone, Deserialize)]
pub struct SocketParams {
    pub mode: SessionMode,
    #[serde(default)]
    pub address: Option<String>,
}

/// A registered session waiting for its socket.
pub struct Admission {
    pub id: Uuid,
    pub mode: SessionMode,
    pub tx: async_channel::Sender<LiveEvent>,
    pub rx: async_channel::Receiver<LiveEvent>,
}

/// Register a session and queue its connect snapshot.
#[instrument(name = "gateway.admit", skip(state), fields(session_id))]
pub async fn admit(state: &AppState, params: &SocketParams) -> Result<Admission, AppError> {
    let (tx, rx) = async_channel::bounded(state.config.sessions.queue_capacity);
    let target = Arc::new(ChannelTarget::new(tx.clone()));

    let id = match params.mode {
        SessionMode::Client => {
            let raw = params.address.as_deref().unwrap_or_default();
            let address = normalize_address(raw)
                .ok_or_else(|| RegistryError::InvalidAddress(raw.to_string()))?;
            let id = state.sessions.register_client(&address, target).await?;
            queue_snapshot(&state.queries, &address, state.config.sessions.initial_page_size, &tx)
                .await;
            id
        }
        SessionMode::Delivery => state.sessions.register_node(target).await,
    };
    tracing::Span::current().record("session_id", tracing::field::display(id));
    info!(mode = %params.mode, "Session admitted");

    Ok(Admission {
        id,
        mode: params.mode,
        tx,
        rx,
    })
}

/// First page of normal and spam feeds for a new client.
async fn queue_snapshot(
    queries: &QueryService,
    address: &str,
    page_size: usize,
    tx: &async_channel::Sender<LiveEvent>,
) {
    let page = PageRequest::new(1, page_size);
    match queries.list_feeds(address, page, false).await {
        Ok(feeds) => {
            if let Err(e) = tx.try_send(LiveEvent::Feed(feeds)) {
                warn!(error = %e, "Dropped feed snapshot");
            }
        }
        Err(e) => warn!(error = %e, "Failed to load feed snapshot"),
    }
    match queries.list_spam_feeds(address, page, false).await {
        Ok(spam) => {
            if let Err(e) = tx.try_send(LiveEvent::Spam(spam)) {
                warn!(error = %e, "Dropped spam snapshot");
            }
        }
        Err(e) => warn!(error = %e, "Failed to load spam snapshot"),
    }
}

/// Answer one text frame from a delivery node.
pub async fn handle_node_message(
    queries: &QueryService,
    text: &str,
    tx: &async_channel::Sender<LiveEvent>,
) {
    let request: NodeRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Ignoring unrecognized node message");
            return;
        }
    };
    match request {
        NodeRequest::HistoricalFeeds {
            start_time,
            end_time,
            page,
            page_size,
        } => {
            let page = PageRequest::new(page, page_size);
            match queries.list_feeds_between(start_time, end_time, page).await {
                Ok(export) => {
                    if let Err(e) = tx.try_send(LiveEvent::HistoricalFeeds(export)) {
                        warn!(error = %e, "Dropped historical export reply");
                    }
                }
                Err(e) => warn!(error = %e, "Historical export failed"),
            }
        }
    }
}

pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<SocketParams>,
) -> Result<Response, AppError> {
    let admission = admit(&state, &params).await?;
    let id = admission.id;
    let sessions = state.sessions.clone();

    Ok(ws
        .on_failed_upgrade(move |e| {
            warn!(session = %id, error = %e, "WebSocket upgrade failed");
            tokio::spawn(async move { sessions.unregister(id).await });
        })
        .on_upgrade(move |socket| run_session(socket, state, admission)))
}

#[instrument(name = "gateway.session", skip_all, fields(session = %admission.id, mode = %admission.mode))]
async fn run_session(socket: WebSocket, state: AppState, admission: Admission) {
    let Admission { id, mode, tx, rx } = admission;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(event = event.name(), error = %e, "Failed to encode event");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) if mode == SessionMode::Delivery => {
                handle_node_message(&state.queries, text.as_str(), &tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(error = %e, "Socket read failed");
                break;
            }
        }
    }

    close_session(&state.sessions, id).await;
    writer.abort();
}

async fn close_session(sessions: &SessionRegistry, id: Uuid) {
    sessions.unregister(id).await;
    info!("Session closed");
}
