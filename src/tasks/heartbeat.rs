use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::config::ConnectionConfig;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::registry::{ConnectionEntry, ConnectionRegistry, DisconnectReason, ServiceCounters};
use crate::transport::Envelope;

/// Timeout for individual heartbeat probe sends
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum concurrent probes to avoid overwhelming the system
const MAX_CONCURRENT_PROBES: usize = 1000;

enum ProbeOutcome {
    Success,
    Failure(Arc<ConnectionEntry>, u32),
    Timeout(Arc<ConnectionEntry>, u32),
}

/// Background task that proactively probes every connection due for a
/// liveness check.
///
/// Probing detects silently-dead peers (half-open sockets) far faster than
/// waiting for an application message to fail.
pub struct HeartbeatTask {
    config: ConnectionConfig,
    registry: Arc<ConnectionRegistry>,
    counters: Arc<ServiceCounters>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
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
        let mut timer = tokio::time::interval(Duration::from_secs(self.config.heartbeat_interval));

        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            max_heartbeat_failures = self.config.max_heartbeat_failures,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.probe_round().await;
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Probe all due connections in parallel with batching.
    async fn probe_round(&self) {
        let due = self
            .registry
            .probe_candidates(self.config.heartbeat_interval)
            .await;
        if due.is_empty() {
            return;
        }

        let start = Instant::now();
        let total = due.len();
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        let mut timed_out = 0usize;
        let mut exhausted: Vec<Arc<ConnectionEntry>> = Vec::new();

        for batch in due.chunks(MAX_CONCURRENT_PROBES) {
            let probes: Vec<_> = batch
                .iter()
                .map(|entry| {
                    let entry = entry.clone();
                    async move {
                        entry.begin_probe();
                        match timeout(PROBE_TIMEOUT, entry.send(Envelope::Ping)).await {
                            Ok(Ok(())) => {
                                entry.record_probe_success();
                                ProbeOutcome::Success
                            }
                            Ok(Err(e)) => {
                                let failures = entry.record_probe_failure();
                                tracing::debug!(
                                    connection_id = %entry.id,
                                    error = %e,
                                    failures = failures,
                                    "Heartbeat probe failed"
                                );
                                ProbeOutcome::Failure(entry, failures)
                            }
                            Err(_) => {
                                let failures = entry.record_probe_failure();
                                tracing::debug!(
                                    connection_id = %entry.id,
                                    timeout_ms = PROBE_TIMEOUT.as_millis() as u64,
                                    failures = failures,
                                    "Heartbeat probe timed out"
                                );
                                ProbeOutcome::Timeout(entry, failures)
                            }
                        }
                    }
                })
                .collect();

            // Execute batch in parallel
            for outcome in join_all(probes).await {
                match outcome {
                    ProbeOutcome::Success => {
                        succeeded += 1;
                        self.counters
                            .heartbeat_successes
                            .fetch_add(1, Ordering::Relaxed);
                        HeartbeatMetrics::record_success();
                    }
                    ProbeOutcome::Failure(entry, failures) => {
                        failed += 1;
                        self.counters
                            .heartbeat_failures
                            .fetch_add(1, Ordering::Relaxed);
                        HeartbeatMetrics::record_failure();
                        if failures >= self.config.max_heartbeat_failures {
                            exhausted.push(entry);
                        }
                    }
                    ProbeOutcome::Timeout(entry, failures) => {
                        timed_out += 1;
                        self.counters
                            .heartbeat_failures
                            .fetch_add(1, Ordering::Relaxed);
                        HeartbeatMetrics::record_timeout();
                        if failures >= self.config.max_heartbeat_failures {
                            exhausted.push(entry);
                        }
                    }
                }
            }
        }

        // Connections out of failure budget are auto-disconnected
        for entry in exhausted {
            if self
                .registry
                .unregister(entry.id, DisconnectReason::HeartbeatFailure)
                .await
                .is_some()
            {
                self.counters
                    .auto_disconnects
                    .fetch_add(1, Ordering::Relaxed);
                ConnectionMetrics::record_closed(DisconnectReason::HeartbeatFailure.as_str());
                tracing::info!(
                    connection_id = %entry.id,
                    tenant_id = %entry.tenant_id,
                    "Connection auto-disconnected after exhausting heartbeat failures"
                );
            }
        }

        let elapsed = start.elapsed();
        HeartbeatMetrics::record_round_duration_secs(elapsed.as_secs_f64());

        tracing::debug!(
            total = total,
            succeeded = succeeded,
            failed = failed,
            timed_out = timed_out,
            elapsed_ms = elapsed.as_millis() as u64,
            "Heartbeat round completed"
        );

        // Warn if a probe round is taking too long
        if elapsed.as_millis() as u64 > self.config.heartbeat_interval * 1000 / 2 {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                heartbeat_interval_ms = self.config.heartbeat_interval * 1000,
                connections = total,
                "Heartbeat round took more than 50% of interval"
            );
        }
    }
}
