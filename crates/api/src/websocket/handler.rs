//! WebSocket handler for Axum

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{stream::StreamExt, SinkExt};
use huddle_coordination::{ClientCommand, Coordinator, Outbound, ServerEvent};
use huddle_shared::{Actor, ConnectionId, HuddleError};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Identity of the connecting actor, already validated upstream
#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    actor_id: String,
    actor_name: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> ApiResult<Response> {
    let actor_id = params.actor_id.trim();
    if actor_id.is_empty() {
        return Err(ApiError::Validation("actor_id must not be empty".to_string()));
    }
    if state.coordinator.is_shut_down() {
        return Err(ApiError::ServiceUnavailable);
    }

    let actor_name = params
        .actor_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| actor_id.to_string());
    let actor = Actor::new(actor_id, actor_name);

    tracing::info!(actor_id = %actor.id, "WebSocket connection upgrade requested");

    let coordinator = state.coordinator.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, actor, coordinator)))
}

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, actor: Actor, coordinator: Coordinator) {
    let (mut sender, mut receiver) = socket.split();

    // Create channel for sending events to this connection
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();

    let actor_id = actor.id.clone();
    let connection_id = match coordinator.register(actor, tx.clone()).await {
        Ok(connection_id) => connection_id,
        Err(e) => {
            tracing::warn!(error = %e, actor_id = %actor_id, "Refusing WebSocket connection");
            return;
        }
    };

    // Send connection acknowledgment
    let _ = tx.send(ServerEvent::Connected { connection_id });

    // Spawn task to send messages to client
    let send_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break; // Connection closed
                    }
                }
                Err(e) => {
                    tracing::error!(error = ?e, event = event.name(), "Failed to serialize WebSocket event");
                }
            }
        }
    });

    // Handle incoming messages
    while let Some(message) = receiver.next().await {
        let message = match message {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(error = %e, connection_id = %connection_id, "WebSocket receive failed");
                break;
            }
        };

        match message {
            Message::Text(text) => {
                if !handle_frame(&coordinator, connection_id, &tx, &text).await {
                    break;
                }
            }
            Message::Close(_) => {
                tracing::info!(connection_id = %connection_id, "WebSocket close frame received");
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // Axum handles ping/pong automatically
            }
            Message::Binary(_) => {
                let _ = tx.send(ServerEvent::Error {
                    message: "Binary frames are not supported".to_string(),
                });
            }
        }
    }

    // Cleanup on disconnect
    tracing::info!(connection_id = %connection_id, actor_id = %actor_id, "WebSocket connection closing");
    if let Err(e) = coordinator.disconnect(connection_id).await {
        tracing::debug!(error = %e, connection_id = %connection_id, "Disconnect cleanup skipped");
    }

    send_task.abort();
}

/// Decode and apply one text frame. Returns false once the coordinator no
/// longer accepts work and the socket should close.
async fn handle_frame(
    coordinator: &Coordinator,
    connection_id: ConnectionId,
    outbound: &Outbound,
    text: &str,
) -> bool {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            tracing::warn!(
                error = %e,
                connection_id = %connection_id,
                "Failed to parse client command"
            );
            let _ = outbound.send(ServerEvent::Error {
                message: format!("Invalid command: {e}"),
            });
            return true;
        }
    };

    match coordinator.dispatch(connection_id, command).await {
        Ok(()) => true,
        Err(HuddleError::ShuttingDown) => false,
        Err(e) => {
            let _ = outbound.send(ServerEvent::Error {
                message: e.to_string(),
            });
            true
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use huddle_coordination::CoordinatorConfig;

    async fn connected() -> (Coordinator, ConnectionId, Outbound, mpsc::UnboundedReceiver<ServerEvent>) {
        let coordinator = Coordinator::new(CoordinatorConfig::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = coordinator
            .register(Actor::new("alice", "Alice"), tx.clone())
            .await
            .unwrap();
        (coordinator, connection_id, tx, rx)
    }

    #[tokio::test]
    async fn test_malformed_frame_is_answered_with_error() {
        let (coordinator, connection_id, tx, mut rx) = connected().await;

        assert!(handle_frame(&coordinator, connection_id, &tx, "{not json").await);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Error { .. }));

        let unknown = r#"{"type":"teleport","resource":{"type":"ticket","id":"T1"}}"#;
        assert!(handle_frame(&coordinator, connection_id, &tx, unknown).await);
        assert!(matches!(rx.try_recv().unwrap(), ServerEvent::Error { .. }));
    }

    #[tokio::test]
    async fn test_frames_are_dispatched() {
        let (coordinator, connection_id, tx, mut rx) = connected().await;

        assert!(handle_frame(&coordinator, connection_id, &tx, r#"{"type":"ping"}"#).await);
        assert_eq!(rx.try_recv().unwrap(), ServerEvent::Pong);

        let join = r#"{"type":"join","resource":{"type":"ticket","id":"T1"}}"#;
        assert!(handle_frame(&coordinator, connection_id, &tx, join).await);

        let roster = coordinator
            .roster(&huddle_shared::ResourceKey::new("ticket", "T1").unwrap())
            .await
            .unwrap();
        assert_eq!(roster.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_the_socket_loop() {
        let (coordinator, connection_id, tx, _rx) = connected().await;
        coordinator.shutdown().await;

        let subscribe = r#"{"type":"subscribe","resource":{"type":"ticket","id":"T1"}}"#;
        assert!(!handle_frame(&coordinator, connection_id, &tx, subscribe).await);
    }
}
