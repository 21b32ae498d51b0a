use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;

use crate::config::ConnectionConfig;
use crate::metrics::{ConnectionMetrics, SweepMetrics, TENANT_CONNECTIONS};
use crate::registry::{ConnectionRegistry, DisconnectReason, ServiceCounters};

/// Background task that removes stale connections and reports aggregate
/// connection health.
///
/// A connection is stale when it has been idle past the threshold, has
/// exhausted its heartbeat failure budget, or has accumulated too many
/// errors. Matching connections are removed in one pass.
pub struct SweepTask {
    config: ConnectionConfig,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<ServiceCounters>,
    shutdown: broadcast::Receiver<()>,
}

impl SweepTask {
    pub fn new(
        config: ConnectionConfig,
        registry: Arc<ConnectionRegistry>,
        counters: Arc<ServiceCounters>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            registry,
            counters,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(Duration::from_secs(self.config.sweep_interval));

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            sweep_interval_secs = self.config.sweep_interval,
            idle_timeout_secs = self.config.idle_timeout,
            max_errors = self.config.max_errors,
            "Sweep task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Sweep task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep_round().await;
                }
            }
        }

        tracing::info!("Sweep task stopped");
    }

    async fn sweep_round(&self) {
        let policy = self.config.stale_policy();
        let stale = self.registry.find_stale(&policy).await;

        let mut removed = 0u64;
        for id in stale {
            if self
                .registry
                .unregister(id, DisconnectReason::Stale)
                .await
                .is_some()
            {
                removed += 1;
                self.counters
                    .cleanup_operations
                    .fetch_add(1, Ordering::Relaxed);
                ConnectionMetrics::record_closed(DisconnectReason::Stale.as_str());
            }
        }

        if removed > 0 {
            SweepMetrics::record_removed(removed);
            tracing::info!(
                removed = removed,
                idle_timeout_secs = self.config.idle_timeout,
                "Removed stale connections"
            );
        }

        self.report_health().await;
    }

    /// Emit the aggregate statistics the operators watch.
    async fn report_health(&self) {
        let now = Utc::now();
        let policy = self.config.stale_policy();
        let connections = self.registry.all_connections().await;

        let total = connections.len();
        let healthy = connections
            .iter()
            .filter(|entry| entry.is_healthy(now, &policy))
            .count();
        let avg_age_secs = if total == 0 {
            0.0
        } else {
            connections
                .iter()
                .map(|entry| entry.age_secs(now) as f64)
                .sum::<f64>()
                / total as f64
        };
        let healthy_ratio = if total == 0 {
            1.0
        } else {
            healthy as f64 / total as f64
        };

        ConnectionMetrics::set_active(total);
        TENANT_CONNECTIONS.reset();
        for (tenant, count) in self.registry.per_tenant_counts().await {
            ConnectionMetrics::set_tenant_connections(&tenant, count);
        }

        tracing::debug!(
            total = total,
            healthy = healthy,
            healthy_ratio = healthy_ratio,
            avg_age_secs = avg_age_secs,
            heartbeat_success_rate = self.counters.heartbeat_success_rate(),
            "Connection health sweep completed"
        );
    }
}
