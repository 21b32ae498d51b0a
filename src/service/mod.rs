//! The connection service: boundary operations and lifecycle.
//!
//! One explicitly-constructed instance owns the registry, the monotonic
//! counters, and the two background loops. It is wired once at process
//! startup and passed by reference wherever needed; `start()` is called
//! exactly once by the top-level startup routine, after the runtime is up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::metrics::{BroadcastMetrics, ConnectionMetrics};
use crate::registry::{
    AdmissionError, ConnectionEntry, ConnectionRegistry, DisconnectReason, HealthStats,
    ServiceCounters,
};
use crate::tasks::{HeartbeatTask, SweepTask};
use crate::transport::{close_code, Envelope, Transport};

/// Timeout for individual broadcast send operations
const BROADCAST_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Maximum number of concurrent broadcast sends
const MAX_CONCURRENT_SENDS: usize = 100;

/// Timeout for the goodbye close of each connection during shutdown
const SHUTDOWN_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct ConnectionService {
    config: ConnectionConfig,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<ServiceCounters>,
    shutdown_tx: broadcast::Sender<()>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl ConnectionService {
    pub fn new(config: ConnectionConfig) -> Self {
        let registry = Arc::new(ConnectionRegistry::new(config.limits()));
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            registry,
            counters: Arc::new(ServiceCounters::default()),
            shutdown_tx,
            workers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Spawn the heartbeat and sweep loops. Idempotent; a second call is a
    /// logged no-op.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Connection service already started");
            return;
        }

        let heartbeat = HeartbeatTask::new(
            self.config.clone(),
            self.registry.clone(),
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        );
        let sweep = SweepTask::new(
            self.config.clone(),
            self.registry.clone(),
            self.counters.clone(),
            self.shutdown_tx.subscribe(),
        );

        let mut workers = self.workers.lock().await;
        workers.push(tokio::spawn(heartbeat.run()));
        workers.push(tokio::spawn(sweep.run()));

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            sweep_interval_secs = self.config.sweep_interval,
            "Connection service started"
        );
    }

    /// Stop both loops, then close and forget every registered connection.
    /// No connection remains registered once this returns.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.send(());
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }

        let remaining = self.registry.drain().await;
        let closed = remaining.len();

        let mut goodbyes = FuturesUnordered::new();
        for entry in remaining {
            goodbyes.push(async move {
                let _ = timeout(
                    SHUTDOWN_CLOSE_TIMEOUT,
                    entry.close(
                        close_code::GOING_AWAY,
                        DisconnectReason::Shutdown.as_str(),
                    ),
                )
                .await;
            });
        }
        while goodbyes.next().await.is_some() {}

        for _ in 0..closed {
            ConnectionMetrics::record_closed(DisconnectReason::Shutdown.as_str());
        }
        ConnectionMetrics::set_active(0);

        tracing::info!(closed = closed, "Connection service stopped");
    }

    /// Admit a connection for a tenant.
    ///
    /// Only admission rejection surfaces to the caller; the rejected
    /// transport has already been closed with a policy code.
    pub async fn register(
        &self,
        transport: Box<dyn Transport>,
        tenant_id: &str,
        connection_id: Uuid,
    ) -> Result<Arc<ConnectionEntry>, AdmissionError> {
        match self
            .registry
            .register(transport, tenant_id, connection_id)
            .await
        {
            Ok(admission) => {
                self.counters.record_registered(tenant_id);
                ConnectionMetrics::record_opened();
                if admission.reconnected {
                    ConnectionMetrics::record_closed(DisconnectReason::Replaced.as_str());
                }
                if admission.evicted > 0 {
                    self.counters
                        .cleanup_operations
                        .fetch_add(admission.evicted as u64, Ordering::Relaxed);
                    for _ in 0..admission.evicted {
                        ConnectionMetrics::record_closed(
                            DisconnectReason::CapacityEviction.as_str(),
                        );
                    }
                }
                Ok(admission.entry)
            }
            Err(e) => {
                ConnectionMetrics::record_rejected();
                Err(e)
            }
        }
    }

    /// Remove a connection. Idempotent; unknown ids are a no-op.
    pub async fn unregister(&self, connection_id: Uuid, reason: DisconnectReason) {
        if self.registry.unregister(connection_id, reason).await.is_some() {
            ConnectionMetrics::record_closed(reason.as_str());
        }
    }

    /// Activity from a connection's receive path. No-op on unknown ids.
    pub async fn record_activity(&self, connection_id: Uuid) {
        self.registry.record_activity(connection_id).await;
    }

    /// Best-effort multicast to one tenant's healthy connections.
    ///
    /// The tenant's connection set is snapshotted up front; peers that are
    /// unhealthy at call time and the excluded id are skipped without a send
    /// attempt. A failed or timed-out send marks that peer for removal but
    /// never aborts the pass. Returns the number of peers that received the
    /// message.
    pub async fn broadcast(
        &self,
        tenant_id: &str,
        message: &str,
        exclude: Option<Uuid>,
    ) -> usize {
        let now = Utc::now();
        let policy = self.config.stale_policy();
        let targets: Vec<_> = self
            .registry
            .tenant_connections(tenant_id)
            .await
            .into_iter()
            .filter(|entry| exclude != Some(entry.id))
            .filter(|entry| entry.is_healthy(now, &policy))
            .collect();

        if targets.is_empty() {
            return 0;
        }

        let mut delivered = 0usize;
        let mut failed: Vec<Uuid> = Vec::new();

        for batch in targets.chunks(MAX_CONCURRENT_SENDS) {
            let sends: Vec<_> = batch
                .iter()
                .map(|entry| {
                    let entry = entry.clone();
                    let envelope = Envelope::Data(message.to_string());
                    async move {
                        let outcome = timeout(BROADCAST_SEND_TIMEOUT, entry.send(envelope)).await;
                        (entry, matches!(outcome, Ok(Ok(()))))
                    }
                })
                .collect();

            for (entry, ok) in join_all(sends).await {
                if ok {
                    delivered += 1;
                } else {
                    tracing::debug!(
                        connection_id = %entry.id,
                        tenant_id = %tenant_id,
                        "Broadcast send failed, connection may be dead"
                    );
                    entry.record_send_failure();
                    failed.push(entry.id);
                }
            }
        }

        // failed peers are dropped, not retried
        for id in &failed {
            self.unregister(*id, DisconnectReason::BroadcastFailure).await;
        }

        self.counters
            .record_broadcast(tenant_id, delivered, failed.len());
        BroadcastMetrics::record_delivered(delivered as u64);
        BroadcastMetrics::record_failed(failed.len() as u64);

        tracing::debug!(
            tenant_id = %tenant_id,
            delivered = delivered,
            failed = failed.len(),
            "Broadcast completed"
        );

        delivered
    }

    /// Point-in-time health summary.
    pub async fn health_stats(&self) -> HealthStats {
        let now = Utc::now();
        let policy = self.config.stale_policy();
        let connections = self.registry.all_connections().await;

        let active = connections.len();
        let healthy = connections
            .iter()
            .filter(|entry| entry.is_healthy(now, &policy))
            .count();
        let avg_connection_age_secs = if active == 0 {
            0.0
        } else {
            connections
                .iter()
                .map(|entry| entry.age_secs(now) as f64)
                .sum::<f64>()
                / active as f64
        };

        HealthStats {
            total_ever: self.counters.total_ever.load(Ordering::Relaxed),
            active,
            healthy,
            per_tenant_counts: self.registry.per_tenant_counts().await,
            heartbeat_success_rate: self.counters.heartbeat_success_rate(),
            avg_connection_age_secs,
            cleanup_operations: self.counters.cleanup_operations.load(Ordering::Relaxed),
            auto_disconnects: self.counters.auto_disconnects.load(Ordering::Relaxed),
        }
    }

    /// Cumulative per-tenant counters for the stats surface.
    pub fn tenant_counters(
        &self,
    ) -> std::collections::HashMap<String, crate::registry::TenantCountersSnapshot> {
        self.counters.tenant_snapshots()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
