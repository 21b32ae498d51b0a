//! Health check and statistics endpoints.

use axum::{extract::State, Json};
use serde::Serialize;
use std::collections::HashMap;

use crate::registry::{HealthStats, TenantCountersSnapshot};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub active: usize,
    pub healthy: usize,
    pub tenants: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    #[serde(flatten)]
    pub health: HealthStats,
    pub tenants: HashMap<String, TenantCountersSnapshot>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.service.health_stats().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            active: stats.active,
            healthy: stats.healthy,
            tenants: stats.per_tenant_counts.len(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let health = state.service.health_stats().await;
    let tenants = state.service.tenant_counters();

    Json(StatsResponse { health, tenants })
}
