//! Backend WebSocket endpoint
//!
//! `WS /backend?id=<string>` speaks the backend control protocol. The
//! registry's per-backend queue is the only path onto the socket; this loop
//! is its single writer. Operations from one backend are processed in
//! submission order. A reconnect under a live id evicts the stale
//! registration (evict-and-replace).

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{info, warn};

use crate::application::arbitration::ControlStatus;
use crate::application::registry::BackendRegistration;
use crate::backends::{ClientFrame, ServerFrame};
use crate::domain::BackendKind;
use crate::interfaces::http::AppState;

#[derive(Debug, Deserialize)]
pub struct BackendQuery {
    pub id: Option<String>,
}

/// `WS /backend?id=<string>`
pub async fn backend_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<BackendQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(backend_id) = query.id.filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": { "code": "HandshakeFailed", "message": "missing id query parameter" }
            })),
        )
            .into_response();
    };

    ws.on_upgrade(move |socket| run_backend_session(socket, backend_id, state))
}

async fn run_backend_session(socket: WebSocket, backend_id: String, state: AppState) {
    // register, evicting a stale connection under the same id
    let registration = match state.registry.register(&backend_id, BackendKind::Inbound) {
        Ok(registration) => registration,
        Err(_) => {
            state.registry.evict(&backend_id);
            state.arbiter.backend_gone(&backend_id).await;
            match state.registry.register(&backend_id, BackendKind::Inbound) {
                Ok(registration) => registration,
                Err(e) => {
                    warn!(backend_id = backend_id.as_str(), error = %e, "backend registration failed");
                    return;
                }
            }
        }
    };
    info!(backend_id = backend_id.as_str(), "backend connected");

    drive_backend(socket, &backend_id, registration, &state).await;

    state.arbiter.backend_gone(&backend_id).await;
    info!(backend_id = backend_id.as_str(), "backend disconnected");
}

async fn drive_backend(
    socket: WebSocket,
    backend_id: &str,
    mut registration: BackendRegistration,
    state: &AppState,
) {
    let (mut sink, mut source) = socket.split();

    loop {
        tokio::select! {
            // queued frames (events, control notifications, replies)
            frame = registration.frames.recv() => {
                // a closed stream means this registration was evicted
                let Some(frame) = frame else { break };
                if sink.send(Message::Text(frame.serialize().into())).await.is_err() {
                    break;
                }
            }

            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_text(backend_id, state, text.as_str()).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        warn!(backend_id, "binary frame ignored");
                    }
                    Some(Err(e)) => {
                        warn!(backend_id, error = %e, "backend socket error");
                        break;
                    }
                }
            }
        }
    }

    state.registry.unregister(backend_id, registration.conn_id);
}

/// Dispatch one client frame. Replies are queued through the registry so
/// they interleave correctly with fan-out and revocation frames.
async fn handle_client_text(backend_id: &str, state: &AppState, text: &str) {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            state.registry.send_frame(
                backend_id,
                ServerFrame::error("InvalidFrame", e.to_string(), None),
            );
            return;
        }
    };

    match frame {
        ClientFrame::Subscribe => {
            state.registry.set_subscribed(backend_id, true);
        }
        ClientFrame::Unsubscribe => {
            state.registry.set_subscribed(backend_id, false);
        }
        ClientFrame::RequestControl { .. } => {
            // a grant is announced by the engine itself so it can never
            // arrive after a later revocation
            if let Err(e) = state.arbiter.request_control(backend_id).await {
                state.registry.send_frame(
                    backend_id,
                    ServerFrame::control(ControlStatus::Denied, Some(e.code())),
                );
            }
        }
        ClientFrame::ReleaseControl { .. } => match state.arbiter.release_control(backend_id).await
        {
            Ok(()) => {
                state.registry.send_frame(
                    backend_id,
                    ServerFrame::control(ControlStatus::Revoked, Some("Released")),
                );
            }
            Err(e) => {
                state.registry.send_frame(
                    backend_id,
                    ServerFrame::error(e.code(), e.to_string(), None),
                );
            }
        },
        ClientFrame::Command {
            request_id,
            command,
        } => match state.arbiter.submit_command(backend_id, command).await {
            Ok(result) => {
                state.registry.send_frame(
                    backend_id,
                    ServerFrame::Result { request_id, result },
                );
            }
            Err(failure) => {
                state.registry.send_frame(
                    backend_id,
                    ServerFrame::error(failure.code(), failure.message(), request_id),
                );
            }
        },
    }
}
