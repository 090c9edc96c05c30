//! Live worker stream over WebSocket.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use tracing::{debug, info, warn};

use super::AppState;
use crate::exec::ExecCoordinator;

pub(super) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    info!("WebSocket subscriber connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.coordinator))
}

/// Forward every envelope as a JSON text frame until either side goes away.
async fn handle_socket(mut socket: WebSocket, coordinator: Arc<ExecCoordinator>) {
    let mut subscription = coordinator.subscribe().await;
    info!("WebSocket subscriber connected");

    loop {
        tokio::select! {
            envelope = subscription.recv() => {
                let Some(envelope) = envelope else {
                    debug!("Live feed closed");
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                };
                match serde_json::to_string(&envelope) {
                    Ok(json) => {
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            debug!("Subscriber disconnected during send");
                            break;
                        }
                    }
                    Err(e) => warn!(error = %e, kind = %envelope.kind, "Could not serialize envelope"),
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
                        info!("WebSocket subscriber disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    // Subscribers are read-only; anything they send is ignored.
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}
