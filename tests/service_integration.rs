//! Cross-component integration tests for the connection service.
//!
//! These tests drive the real service (registry, admission, broadcast, and
//! the two background loops) through its boundary operations, with scripted
//! in-memory transports standing in for sockets.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use uuid::Uuid;

use pulse_gateway::config::ConnectionConfig;
use pulse_gateway::registry::DisconnectReason;
use pulse_gateway::service::ConnectionService;
use pulse_gateway::transport::{close_code, Envelope, SendError, Transport};

// =============================================================================
// Test transport
// =============================================================================

/// Shared observation point for one mock transport.
#[derive(Default)]
struct MockState {
    sent: Mutex<Vec<Envelope>>,
    closes: Mutex<Vec<(u16, String)>>,
    close_count: AtomicUsize,
    fail_sends: AtomicBool,
}

impl MockState {
    fn data_frames(&self) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|envelope| matches!(envelope, Envelope::Data(_)))
            .count()
    }

    fn last_close(&self) -> Option<(u16, String)> {
        self.closes.lock().unwrap().last().cloned()
    }
}

struct MockTransport(Arc<MockState>);

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, envelope: Envelope) -> Result<(), SendError> {
        if self.0.fail_sends.load(Ordering::Relaxed) {
            return Err(SendError::Closed);
        }
        self.0.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn close(&self, code: u16, reason: &str) {
        self.0.close_count.fetch_add(1, Ordering::Relaxed);
        self.0
            .closes
            .lock()
            .unwrap()
            .push((code, reason.to_string()));
    }
}

fn mock_transport() -> (Box<MockTransport>, Arc<MockState>) {
    let state = Arc::new(MockState::default());
    (Box::new(MockTransport(state.clone())), state)
}

/// Register a fresh connection, returning its id and observation state.
async fn connect(service: &ConnectionService, tenant: &str) -> (Uuid, Arc<MockState>) {
    let (transport, state) = mock_transport();
    let id = Uuid::new_v4();
    service
        .register(transport, tenant, id)
        .await
        .expect("registration should be admitted");
    (id, state)
}

// =============================================================================
// Admission & capacity
// =============================================================================

#[tokio::test]
async fn test_tenant_cap_rejects_third_connection() {
    let service = ConnectionService::new(ConnectionConfig {
        max_connections_per_tenant: 2,
        ..Default::default()
    });

    connect(&service, "tenant-a").await;
    connect(&service, "tenant-a").await;

    let (transport, rejected) = mock_transport();
    let result = service
        .register(transport, "tenant-a", Uuid::new_v4())
        .await;

    assert!(result.is_err());
    let stats = service.health_stats().await;
    assert_eq!(stats.per_tenant_counts["tenant-a"], 2);
    assert_eq!(stats.active, 2);

    // the rejected transport is told why
    let (code, _) = rejected.last_close().expect("rejected transport closed");
    assert_eq!(code, close_code::POLICY_VIOLATION);
}

#[tokio::test]
async fn test_global_cap_evicts_globally_oldest() {
    let service = ConnectionService::new(ConnectionConfig {
        max_total_connections: 3,
        ..Default::default()
    });

    let (_oldest, oldest_state) = connect(&service, "tenant-a").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    connect(&service, "tenant-a").await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    connect(&service, "tenant-b").await;

    connect(&service, "tenant-c").await;

    let stats = service.health_stats().await;
    assert_eq!(stats.active, 3);
    assert_eq!(stats.cleanup_operations, 1);

    let (code, reason) = oldest_state.last_close().expect("victim closed");
    assert_eq!(code, close_code::GOING_AWAY);
    assert_eq!(reason, "capacity_eviction");
    // exactly the single oldest connection was displaced
    assert_eq!(stats.per_tenant_counts.get("tenant-a"), Some(&1));
    assert_eq!(stats.per_tenant_counts.get("tenant-b"), Some(&1));
    assert_eq!(stats.per_tenant_counts.get("tenant-c"), Some(&1));
}

#[tokio::test]
async fn test_unregister_is_idempotent() {
    let service = ConnectionService::new(ConnectionConfig::default());
    let (id, state) = connect(&service, "tenant-a").await;

    service.unregister(id, DisconnectReason::ClientClosed).await;
    service.unregister(id, DisconnectReason::ClientClosed).await;
    service
        .unregister(Uuid::new_v4(), DisconnectReason::ClientClosed)
        .await;

    assert_eq!(service.health_stats().await.active, 0);
    assert_eq!(state.close_count.load(Ordering::Relaxed), 1);
}

// =============================================================================
// Heartbeat
// =============================================================================

#[tokio::test]
async fn test_failing_probes_auto_disconnect_connection() {
    let service = ConnectionService::new(ConnectionConfig {
        heartbeat_interval: 1,
        max_heartbeat_failures: 2,
        sweep_interval: 60,
        ..Default::default()
    });

    let (_, state) = connect(&service, "tenant-a").await;
    state.fail_sends.store(true, Ordering::Relaxed);

    service.start().await;

    // two failed probes at one-second spacing, plus a tick of slack
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if service.health_stats().await.active == 0 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "connection was not auto-disconnected"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = service.health_stats().await;
    assert_eq!(stats.auto_disconnects, 1);
    let (_, reason) = state.last_close().expect("failed connection closed");
    assert_eq!(reason, "heartbeat_failure");

    service.stop().await;
}

#[tokio::test]
async fn test_healthy_connection_receives_probes_and_survives() {
    let service = ConnectionService::new(ConnectionConfig {
        heartbeat_interval: 1,
        sweep_interval: 60,
        ..Default::default()
    });

    let (_, state) = connect(&service, "tenant-a").await;
    service.start().await;

    let deadline = Instant::now() + Duration::from_secs(4);
    loop {
        let pings = state
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Envelope::Ping))
            .count();
        if pings >= 2 {
            break;
        }
        assert!(Instant::now() < deadline, "expected at least two probes");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = service.health_stats().await;
    assert_eq!(stats.active, 1);
    assert!(stats.heartbeat_success_rate > 0.0);
    assert!(stats.per_tenant_counts.contains_key("tenant-a"));

    service.stop().await;
}

// =============================================================================
// Broadcast
// =============================================================================

#[tokio::test]
async fn test_broadcast_reaches_only_healthy_peers() {
    // idle_timeout of 1s lets the test age a connection into unhealthiness
    let service = ConnectionService::new(ConnectionConfig {
        idle_timeout: 1,
        ..Default::default()
    });

    let (a, state_a) = connect(&service, "tenant-t").await;
    let (b, state_b) = connect(&service, "tenant-t").await;
    let (_idle, state_idle) = connect(&service, "tenant-t").await;
    let (_other, state_other) = connect(&service, "tenant-u").await;

    tokio::time::sleep(Duration::from_secs(2)).await;
    service.record_activity(a).await;
    service.record_activity(b).await;

    let delivered = service.broadcast("tenant-t", r#"{"type":"event"}"#, None).await;

    assert_eq!(delivered, 2);
    assert_eq!(state_a.data_frames(), 1);
    assert_eq!(state_b.data_frames(), 1);
    // the idle peer is skipped without a send attempt
    assert_eq!(state_idle.data_frames(), 0);
    // another tenant's connections are never touched
    assert_eq!(state_other.data_frames(), 0);
}

#[tokio::test]
async fn test_broadcast_excludes_originator() {
    let service = ConnectionService::new(ConnectionConfig::default());

    let (sender, sender_state) = connect(&service, "tenant-t").await;
    let (_, peer_state) = connect(&service, "tenant-t").await;

    let delivered = service
        .broadcast("tenant-t", r#"{"type":"event"}"#, Some(sender))
        .await;

    assert_eq!(delivered, 1);
    assert_eq!(sender_state.data_frames(), 0);
    assert_eq!(peer_state.data_frames(), 1);
}

#[tokio::test]
async fn test_broadcast_failure_drops_peer_without_aborting_pass() {
    let service = ConnectionService::new(ConnectionConfig::default());

    let (_, ok_state) = connect(&service, "tenant-t").await;
    let (_dead, dead_state) = connect(&service, "tenant-t").await;
    dead_state.fail_sends.store(true, Ordering::Relaxed);

    let delivered = service.broadcast("tenant-t", r#"{"type":"event"}"#, None).await;

    assert_eq!(delivered, 1);
    assert_eq!(ok_state.data_frames(), 1);

    // the failed peer was unregistered after the pass
    let stats = service.health_stats().await;
    assert_eq!(stats.active, 1);
    let (_, reason) = dead_state.last_close().expect("dead peer closed");
    assert_eq!(reason, "broadcast_failure");
}

#[tokio::test]
async fn test_broadcast_to_unknown_tenant_delivers_nothing() {
    let service = ConnectionService::new(ConnectionConfig::default());
    connect(&service, "tenant-t").await;

    let delivered = service.broadcast("tenant-x", "msg", None).await;
    assert_eq!(delivered, 0);
}

// =============================================================================
// Sweep
// =============================================================================

#[tokio::test]
async fn test_sweep_removes_idle_connections() {
    let service = ConnectionService::new(ConnectionConfig {
        heartbeat_interval: 60,
        idle_timeout: 1,
        sweep_interval: 1,
        ..Default::default()
    });

    let (_, state) = connect(&service, "tenant-a").await;
    service.start().await;

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if service.health_stats().await.active == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "idle connection was not swept");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let stats = service.health_stats().await;
    assert!(stats.cleanup_operations >= 1);
    let (_, reason) = state.last_close().expect("stale connection closed");
    assert_eq!(reason, "stale_connection");

    service.stop().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_stop_closes_every_connection_exactly_once() {
    let service = ConnectionService::new(ConnectionConfig {
        heartbeat_interval: 60,
        sweep_interval: 60,
        ..Default::default()
    });

    let mut states = Vec::new();
    for _ in 0..4 {
        let (_, state) = connect(&service, "tenant-a").await;
        states.push(state);
    }

    service.start().await;
    service.stop().await;

    assert_eq!(service.health_stats().await.active, 0);
    for state in states {
        assert_eq!(state.close_count.load(Ordering::Relaxed), 1);
        let (code, reason) = state.last_close().unwrap();
        assert_eq!(code, close_code::GOING_AWAY);
        assert_eq!(reason, "server_shutdown");
    }
}

#[tokio::test]
async fn test_stop_without_start_is_a_noop() {
    let service = ConnectionService::new(ConnectionConfig::default());
    service.stop().await;
    assert!(!service.is_running());
}

#[tokio::test]
async fn test_stats_surface() {
    let service = ConnectionService::new(ConnectionConfig::default());

    let (a, _) = connect(&service, "tenant-a").await;
    connect(&service, "tenant-a").await;
    connect(&service, "tenant-b").await;
    service.record_activity(a).await;
    service.broadcast("tenant-a", "msg", None).await;

    let stats = service.health_stats().await;
    assert_eq!(stats.total_ever, 3);
    assert_eq!(stats.active, 3);
    assert_eq!(stats.healthy, 3);
    assert_eq!(stats.per_tenant_counts["tenant-a"], 2);
    assert_eq!(stats.per_tenant_counts["tenant-b"], 1);
    assert!(stats.avg_connection_age_secs >= 0.0);

    let tenants = service.tenant_counters();
    assert_eq!(tenants["tenant-a"].total_connections, 2);
    assert_eq!(tenants["tenant-a"].messages_delivered, 2);
}
