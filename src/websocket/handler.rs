use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::registry::{ConnectionEntry, DisconnectReason};
use crate::server::AppState;
use crate::service::ConnectionService;
use crate::transport::{ChannelTransport, Envelope};

use super::message::{ClientMessage, ServerMessage};

const CHANNEL_BUFFER_SIZE: usize = 32;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub tenant_id: String,
    /// Client-supplied id, kept stable across reconnects. Generated when
    /// absent.
    pub connection_id: Option<Uuid>,
}

/// WebSocket upgrade handler
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(tenant_id = %query.tenant_id)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    if query.tenant_id.is_empty() {
        return (StatusCode::BAD_REQUEST, "Missing tenant id").into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, query))
}

/// Handle an established WebSocket connection
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state, query),
    fields(tenant_id = %query.tenant_id)
)]
async fn handle_socket(socket: WebSocket, state: AppState, query: WsQuery) {
    let tenant_id = query.tenant_id;
    let connection_id = query.connection_id.unwrap_or_else(Uuid::new_v4);

    // Channel drained by the send pump below; the gateway sees it as the
    // connection's transport.
    let (tx, mut rx) = mpsc::channel::<Envelope>(CHANNEL_BUFFER_SIZE);
    let transport = Box::new(ChannelTransport::new(tx));

    let entry = match state
        .service
        .register(transport, &tenant_id, connection_id)
        .await
    {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(tenant_id = %tenant_id, error = %e, "Connection rejected");
            let (mut ws_sender, _) = socket.split();
            let error_msg = ServerMessage::error("ADMISSION_REJECTED", e.to_string());
            if let Ok(json) = serde_json::to_string(&error_msg) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    tracing::info!(
        connection_id = %connection_id,
        tenant_id = %tenant_id,
        "Push connection established"
    );

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Task for sending envelopes from the gateway to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            match envelope {
                Envelope::Ping => {
                    let Ok(text) = serde_json::to_string(&ServerMessage::Heartbeat) else {
                        continue;
                    };
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Envelope::Data(text) => {
                    if ws_sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Envelope::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Task for receiving messages from the WebSocket
    let service = state.service.clone();
    let entry_clone = entry.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &service, &entry_clone).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
        }
        _ = recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
        }
    }

    state
        .service
        .unregister(connection_id, DisconnectReason::ClientClosed)
        .await;

    tracing::info!(
        connection_id = %connection_id,
        tenant_id = %tenant_id,
        "Push connection closed"
    );
}

/// Process a received WebSocket message
/// Returns false if the connection should be closed
async fn process_message(
    msg: Message,
    service: &Arc<ConnectionService>,
    entry: &Arc<ConnectionEntry>,
) -> bool {
    match msg {
        Message::Text(text) => {
            service.record_activity(entry.id).await;

            let client_msg: ClientMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    let error = ServerMessage::error("INVALID_MESSAGE", e.to_string());
                    if let Ok(json) = serde_json::to_string(&error) {
                        let _ = entry.send(Envelope::Data(json)).await;
                    }
                    return true;
                }
            };

            handle_client_message(client_msg, service, entry).await;
            true
        }
        Message::Binary(_) => {
            let error = ServerMessage::error(
                "UNSUPPORTED_FORMAT",
                "Binary messages are not supported",
            );
            if let Ok(json) = serde_json::to_string(&error) {
                let _ = entry.send(Envelope::Data(json)).await;
            }
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            service.record_activity(entry.id).await;
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %entry.id, "Received close frame");
            false
        }
    }
}

/// Handle a parsed client message
async fn handle_client_message(
    msg: ClientMessage,
    service: &Arc<ConnectionService>,
    entry: &Arc<ConnectionEntry>,
) {
    match msg {
        ClientMessage::Ping => {
            if let Ok(json) = serde_json::to_string(&ServerMessage::Pong) {
                let _ = entry.send(Envelope::Data(json)).await;
            }
        }
        ClientMessage::Broadcast { payload } => {
            // Relayed to tenant peers; the sender never hears its own echo
            let event = ServerMessage::event(payload);
            if let Ok(json) = serde_json::to_string(&event) {
                service
                    .broadcast(&entry.tenant_id, &json, Some(entry.id))
                    .await;
            }
        }
    }
}
