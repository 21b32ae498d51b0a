//! Broadcast trigger endpoint for external callers.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::server::AppState;
use crate::websocket::ServerMessage;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub tenant_id: String,
    pub message: serde_json::Value,
    /// Connection id to skip, typically the originator.
    pub exclude: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub delivered: usize,
}

pub async fn broadcast_message(
    State(state): State<AppState>,
    Json(request): Json<BroadcastRequest>,
) -> Result<Json<BroadcastResponse>> {
    if request.tenant_id.is_empty() {
        return Err(AppError::Validation("tenant_id must not be empty".into()));
    }

    let event = ServerMessage::event(request.message);
    let payload =
        serde_json::to_string(&event).map_err(|e| AppError::Internal(e.to_string()))?;

    let delivered = state
        .service
        .broadcast(&request.tenant_id, &payload, request.exclude)
        .await;

    Ok(Json(BroadcastResponse { delivered }))
}
