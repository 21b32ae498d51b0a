use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::broadcast::broadcast_message;
use super::health::{health, stats};
use super::metrics::metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(metrics))
        // Broadcast trigger
        .nest(
            "/api/v1",
            Router::new().route("/broadcast", post(broadcast_message)),
        )
}
