//! Connection records, state machine, and admission types.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use thiserror::Error;
use uuid::Uuid;

use crate::transport::{Envelope, SendError, Transport};

/// Lifecycle state of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Admission in progress; not yet visible to broadcasts.
    Connecting,
    Connected,
    /// A liveness probe is in flight.
    HeartbeatPending,
    /// The last probe or send failed.
    Error,
    /// Terminal; the id has left both registry structures.
    Removed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Connected,
            2 => Self::HeartbeatPending,
            3 => Self::Error,
            _ => Self::Removed,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Connecting => 0,
            Self::Connected => 1,
            Self::HeartbeatPending => 2,
            Self::Error => 3,
            Self::Removed => 4,
        }
    }
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed its side or the receive loop ended.
    ClientClosed,
    /// Consecutive heartbeat probes exhausted the failure budget.
    HeartbeatFailure,
    /// Removed by the health sweep (idle or error-prone).
    Stale,
    /// A broadcast send to this peer failed.
    BroadcastFailure,
    /// Evicted to make room under the global connection cap.
    CapacityEviction,
    /// Superseded by a re-registration of the same id.
    Replaced,
    /// Service shutdown.
    Shutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::HeartbeatFailure => "heartbeat_failure",
            Self::Stale => "stale_connection",
            Self::BroadcastFailure => "broadcast_failure",
            Self::CapacityEviction => "capacity_eviction",
            Self::Replaced => "replaced",
            Self::Shutdown => "server_shutdown",
        }
    }

    pub fn close_code(&self) -> u16 {
        match self {
            Self::ClientClosed => crate::transport::close_code::NORMAL,
            _ => crate::transport::close_code::GOING_AWAY,
        }
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when admission is rejected.
///
/// This is the only per-connection failure surfaced to callers; the caller
/// of register owns the decision of how to terminate the rejected attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("total connection limit exceeded ({current}/{max})")]
    TotalLimitExceeded { current: usize, max: usize },

    #[error("tenant {tenant_id} connection limit exceeded ({current}/{max})")]
    TenantLimitExceeded {
        tenant_id: String,
        current: usize,
        max: usize,
    },
}

/// Capacity limits enforced at registration time.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_total_connections: usize,
    pub max_connections_per_tenant: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_total_connections: 10000,
            max_connections_per_tenant: 1000,
        }
    }
}

/// Thresholds for the staleness predicate and the health formula.
#[derive(Debug, Clone, Copy)]
pub struct StalePolicy {
    /// Seconds without activity before a connection is stale.
    pub idle_timeout_secs: i64,
    pub max_heartbeat_failures: u32,
    pub max_errors: u32,
}

/// One live connection: identity, exclusively-owned transport, and the
/// counters and timestamps the health model is built from.
///
/// Timestamps are Unix seconds in atomics so the probe and activity paths
/// never take a lock (the registry lock guards only the two maps).
pub struct ConnectionEntry {
    pub id: Uuid,
    pub tenant_id: String,
    transport: Box<dyn Transport>,
    pub connected_at: DateTime<Utc>,
    state: AtomicU8,
    last_heartbeat: AtomicI64,
    last_activity: AtomicI64,
    heartbeat_failures: AtomicU32,
    message_count: AtomicU64,
    error_count: AtomicU32,
    reconnect_count: AtomicU32,
}

impl ConnectionEntry {
    pub fn new(
        id: Uuid,
        tenant_id: String,
        transport: Box<dyn Transport>,
        reconnect_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            tenant_id,
            transport,
            connected_at: now,
            state: AtomicU8::new(ConnectionState::Connecting.as_u8()),
            last_heartbeat: AtomicI64::new(now.timestamp()),
            last_activity: AtomicI64::new(now.timestamp()),
            heartbeat_failures: AtomicU32::new(0),
            message_count: AtomicU64::new(0),
            error_count: AtomicU32::new(0),
            reconnect_count: AtomicU32::new(reconnect_count),
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    /// Activity from the peer: refresh the idle clock and count the message.
    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn last_heartbeat(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_heartbeat.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn idle_secs(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp() - self.last_activity.load(Ordering::Relaxed)
    }

    pub fn age_secs(&self, now: DateTime<Utc>) -> i64 {
        (now - self.connected_at).num_seconds()
    }

    pub fn heartbeat_failures(&self) -> u32 {
        self.heartbeat_failures.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::Relaxed)
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::Relaxed)
    }

    /// Whether a probe is due, given the heartbeat interval.
    pub fn probe_due(&self, now: DateTime<Utc>, interval_secs: u64) -> bool {
        now.timestamp() - self.last_heartbeat.load(Ordering::Relaxed) >= interval_secs as i64
    }

    pub(crate) fn begin_probe(&self) {
        self.set_state(ConnectionState::HeartbeatPending);
    }

    /// Probe succeeded: the peer is alive, the consecutive-failure budget
    /// starts over.
    pub(crate) fn record_probe_success(&self) {
        self.last_heartbeat
            .store(Utc::now().timestamp(), Ordering::Relaxed);
        self.heartbeat_failures.store(0, Ordering::Relaxed);
        self.set_state(ConnectionState::Connected);
    }

    /// Probe failed or timed out. Returns the new consecutive failure count.
    pub(crate) fn record_probe_failure(&self) -> u32 {
        self.error_count.fetch_add(1, Ordering::Relaxed);
        self.set_state(ConnectionState::Error);
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// A non-probe send (broadcast) failed.
    pub(crate) fn record_send_failure(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Eligible to receive traffic right now.
    pub fn is_healthy(&self, now: DateTime<Utc>, policy: &StalePolicy) -> bool {
        self.state() == ConnectionState::Connected
            && self.heartbeat_failures() < policy.max_heartbeat_failures
            && self.idle_secs(now) < policy.idle_timeout_secs
    }

    /// Eligible for removal by the health sweep.
    pub fn is_stale(&self, now: DateTime<Utc>, policy: &StalePolicy) -> bool {
        self.idle_secs(now) > policy.idle_timeout_secs
            || self.heartbeat_failures() >= policy.max_heartbeat_failures
            || self.error_count() > policy.max_errors
    }

    pub async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        self.transport.send(envelope).await
    }

    pub async fn close(&self, code: u16, reason: &str) {
        self.transport.close(code, reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use tokio::sync::mpsc;

    fn entry() -> (ConnectionEntry, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        let entry = ConnectionEntry::new(
            Uuid::new_v4(),
            "acme".to_string(),
            Box::new(ChannelTransport::new(tx)),
            0,
        );
        (entry, rx)
    }

    fn policy() -> StalePolicy {
        StalePolicy {
            idle_timeout_secs: 120,
            max_heartbeat_failures: 3,
            max_errors: 10,
        }
    }

    #[tokio::test]
    async fn test_new_entry_starts_connecting() {
        let (entry, _rx) = entry();
        assert_eq!(entry.state(), ConnectionState::Connecting);
        assert!(!entry.is_healthy(Utc::now(), &policy()));
    }

    #[tokio::test]
    async fn test_probe_failure_then_success_resets_budget() {
        let (entry, _rx) = entry();
        entry.set_state(ConnectionState::Connected);

        entry.begin_probe();
        assert_eq!(entry.state(), ConnectionState::HeartbeatPending);

        assert_eq!(entry.record_probe_failure(), 1);
        assert_eq!(entry.state(), ConnectionState::Error);
        assert_eq!(entry.error_count(), 1);
        assert_eq!(entry.record_probe_failure(), 2);

        entry.record_probe_success();
        assert_eq!(entry.state(), ConnectionState::Connected);
        assert_eq!(entry.heartbeat_failures(), 0);
        // error history is not forgiven by a single good probe
        assert_eq!(entry.error_count(), 2);
    }

    #[tokio::test]
    async fn test_healthiness_requires_connected_state() {
        let (entry, _rx) = entry();
        let now = Utc::now();

        entry.set_state(ConnectionState::Connected);
        assert!(entry.is_healthy(now, &policy()));

        entry.set_state(ConnectionState::Error);
        assert!(!entry.is_healthy(now, &policy()));
    }

    #[tokio::test]
    async fn test_exhausted_failure_budget_is_stale_and_unhealthy() {
        let (entry, _rx) = entry();
        entry.set_state(ConnectionState::Connected);
        let now = Utc::now();

        for _ in 0..3 {
            entry.record_probe_failure();
        }
        entry.set_state(ConnectionState::Connected);

        assert!(!entry.is_healthy(now, &policy()));
        assert!(entry.is_stale(now, &policy()));
    }

    #[tokio::test]
    async fn test_touch_counts_messages_and_refreshes_idle() {
        let (entry, _rx) = entry();
        entry.touch();
        entry.touch();

        assert_eq!(entry.message_count(), 2);
        assert!(entry.idle_secs(Utc::now()) <= 1);
    }

    #[test]
    fn test_disconnect_reason_close_codes() {
        assert_eq!(DisconnectReason::ClientClosed.close_code(), 1000);
        assert_eq!(DisconnectReason::Shutdown.close_code(), 1001);
        assert_eq!(DisconnectReason::Stale.as_str(), "stale_connection");
    }
}
