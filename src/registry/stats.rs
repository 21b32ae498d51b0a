//! Aggregate counters and statistics snapshots.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters kept across connection lifetimes (thread-safe with
/// atomic counters).
#[derive(Default)]
pub struct ServiceCounters {
    /// Connections ever admitted.
    pub total_ever: AtomicU64,
    pub heartbeat_successes: AtomicU64,
    pub heartbeat_failures: AtomicU64,
    /// Connections removed for exhausting the heartbeat failure budget.
    pub auto_disconnects: AtomicU64,
    /// Connections removed involuntarily by the sweep or forced eviction.
    pub cleanup_operations: AtomicU64,
    pub broadcasts: AtomicU64,
    pub messages_delivered: AtomicU64,
    pub delivery_failures: AtomicU64,
    tenants: DashMap<String, TenantCounters>,
}

impl ServiceCounters {
    pub fn record_registered(&self, tenant_id: &str) {
        self.total_ever.fetch_add(1, Ordering::Relaxed);
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .total_connections
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broadcast(&self, tenant_id: &str, delivered: usize, failed: usize) {
        self.broadcasts.fetch_add(1, Ordering::Relaxed);
        self.messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        self.delivery_failures
            .fetch_add(failed as u64, Ordering::Relaxed);
        self.tenants
            .entry(tenant_id.to_string())
            .or_default()
            .messages_delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
    }

    /// Probe success rate; the +1 keeps the ratio defined before any probe
    /// has run.
    pub fn heartbeat_success_rate(&self) -> f64 {
        let successes = self.heartbeat_successes.load(Ordering::Relaxed);
        let failures = self.heartbeat_failures.load(Ordering::Relaxed);
        successes as f64 / (successes + failures + 1) as f64
    }

    pub fn tenant_snapshots(&self) -> HashMap<String, TenantCountersSnapshot> {
        self.tenants
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().snapshot()))
            .collect()
    }
}

/// Cumulative per-tenant counters.
#[derive(Default)]
pub struct TenantCounters {
    pub total_connections: AtomicU64,
    pub messages_delivered: AtomicU64,
}

impl TenantCounters {
    pub fn snapshot(&self) -> TenantCountersSnapshot {
        TenantCountersSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TenantCountersSnapshot {
    pub total_connections: u64,
    pub messages_delivered: u64,
}

/// Point-in-time health summary of the whole service.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStats {
    pub total_ever: u64,
    pub active: usize,
    pub healthy: usize,
    pub per_tenant_counts: HashMap<String, usize>,
    pub heartbeat_success_rate: f64,
    pub avg_connection_age_secs: f64,
    pub cleanup_operations: u64,
    pub auto_disconnects: u64,
}
