//! Prometheus metrics for the push gateway.
//!
//! Covers the health model end to end:
//! - Connection metrics (active, per-tenant, opened/closed/rejected)
//! - Heartbeat metrics (probe outcomes, round duration)
//! - Broadcast metrics (delivered, failed)
//! - Sweep metrics (stale removals)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    register_int_gauge_vec, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "pulse";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Currently registered connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Currently registered push connections"
    ).unwrap();

    /// Active connections per tenant
    pub static ref TENANT_CONNECTIONS: IntGaugeVec = register_int_gauge_vec!(
        format!("{}_tenant_connections", METRIC_PREFIX),
        "Active connections per tenant",
        &["tenant"]
    ).unwrap();

    /// Connections admitted since start
    pub static ref CONNECTIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections admitted"
    ).unwrap();

    /// Connections removed since start, by disconnect reason
    pub static ref CONNECTIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections removed",
        &["reason"]
    ).unwrap();

    /// Registrations rejected by capacity policy
    pub static ref CONNECTIONS_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_connections_rejected_total", METRIC_PREFIX),
        "Total registrations rejected by capacity policy"
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Probe outcomes (success / failure / timeout)
    pub static ref HEARTBEAT_PROBES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_heartbeat_probes_total", METRIC_PREFIX),
        "Total heartbeat probes by outcome",
        &["outcome"]
    ).unwrap();

    /// Duration of a full probe round
    pub static ref HEARTBEAT_ROUND_DURATION: Histogram = register_histogram!(
        format!("{}_heartbeat_round_duration_seconds", METRIC_PREFIX),
        "Duration of a heartbeat probe round in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Broadcast Metrics
    // ============================================================================

    /// Messages delivered to connections by broadcast
    pub static ref BROADCAST_DELIVERED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcast_delivered_total", METRIC_PREFIX),
        "Total broadcast messages delivered to connections"
    ).unwrap();

    /// Broadcast delivery failures
    pub static ref BROADCAST_FAILED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_broadcast_failed_total", METRIC_PREFIX),
        "Total broadcast delivery failures"
    ).unwrap();

    // ============================================================================
    // Sweep Metrics
    // ============================================================================

    /// Connections removed by the health sweep
    pub static ref SWEEP_REMOVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sweep_removed_total", METRIC_PREFIX),
        "Total stale connections removed by the health sweep"
    ).unwrap();
}

/// Encode all registered metrics in Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        CONNECTIONS_OPENED_TOTAL.inc();
        CONNECTIONS_ACTIVE.inc();
    }

    pub fn record_closed(reason: &str) {
        CONNECTIONS_CLOSED_TOTAL.with_label_values(&[reason]).inc();
        CONNECTIONS_ACTIVE.dec();
    }

    pub fn record_rejected() {
        CONNECTIONS_REJECTED_TOTAL.inc();
    }

    pub fn set_active(count: usize) {
        CONNECTIONS_ACTIVE.set(count as i64);
    }

    pub fn set_tenant_connections(tenant: &str, count: usize) {
        TENANT_CONNECTIONS
            .with_label_values(&[tenant])
            .set(count as i64);
    }
}

/// Helper struct for recording heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_success() {
        HEARTBEAT_PROBES_TOTAL.with_label_values(&["success"]).inc();
    }

    pub fn record_failure() {
        HEARTBEAT_PROBES_TOTAL.with_label_values(&["failure"]).inc();
    }

    pub fn record_timeout() {
        HEARTBEAT_PROBES_TOTAL.with_label_values(&["timeout"]).inc();
    }

    pub fn record_round_duration_secs(seconds: f64) {
        HEARTBEAT_ROUND_DURATION.observe(seconds);
    }
}

/// Helper struct for recording broadcast metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn record_delivered(count: u64) {
        if count > 0 {
            BROADCAST_DELIVERED_TOTAL.inc_by(count);
        }
    }

    pub fn record_failed(count: u64) {
        if count > 0 {
            BROADCAST_FAILED_TOTAL.inc_by(count);
        }
    }
}

/// Helper struct for recording sweep metrics
pub struct SweepMetrics;

impl SweepMetrics {
    pub fn record_removed(count: u64) {
        if count > 0 {
            SWEEP_REMOVED_TOTAL.inc_by(count);
        }
    }
}
