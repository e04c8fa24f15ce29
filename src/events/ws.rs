//! WebSocket fan-out of session events, one tenant per connection.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::{BroadcastPublisher, SessionEvent};
use crate::manager::{SessionManager, SessionStatusView};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub publisher: Arc<BroadcastPublisher>,
}

/// First frame on connect, and again after the client lagged.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename = "session_sync")]
struct SessionSync {
    session: SessionStatusView,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub tenant_id: String,
}

/// Build the Axum router with the event WebSocket and health routes.
pub fn event_routes(manager: Arc<SessionManager>, publisher: Arc<BroadcastPublisher>) -> Router {
    let state = AppState { manager, publisher };

    Router::new()
        .route("/ws/events", get(ws_handler))
        .route("/health", get(health))
        .with_state(state)
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "crm-messaging"
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    if query.tenant_id.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "tenant_id is required"})),
        )
            .into_response();
    }
    info!(tenant_id = %query.tenant_id, "Event stream client connecting");
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.tenant_id))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, tenant_id: String) {
    // Subscribe before the snapshot so nothing falls in between.
    let mut rx = state.publisher.subscribe();

    if !send_sync(&mut socket, &state.manager, &tenant_id).await {
        warn!(tenant_id = %tenant_id, "Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) if event.tenant_id() == tenant_id => {
                        if !send_event(&mut socket, &event).await {
                            debug!("Client disconnected during send");
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => {
                        warn!(tenant_id = %tenant_id, missed = n, "Event client lagged behind broadcast");
                        if !send_sync(&mut socket, &state.manager, &tenant_id).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!(tenant_id = %tenant_id, "Event stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // The stream is push-only.
                    _ => {}
                }
            }
        }
    }

    debug!(tenant_id = %tenant_id, "Event stream closed");
}

async fn send_event(socket: &mut WebSocket, event: &SessionEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            true
        }
    }
}

async fn send_sync(socket: &mut WebSocket, manager: &SessionManager, tenant_id: &str) -> bool {
    let session = match manager.get_session_status(tenant_id).await {
        Ok(session) => session,
        Err(e) => {
            warn!(tenant_id, error = %e, "Session snapshot unavailable");
            return true;
        }
    };
    match serde_json::to_string(&SessionSync { session }) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to serialize session snapshot");
            true
        }
    }
}
