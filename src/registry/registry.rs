//! Source of truth for live connections.
//!
//! The connection map and the tenant index are one consistency unit: both
//! live behind a single `RwLock` and every mutation updates them together.
//! Transports are only awaited after the lock is released; snapshots hand
//! out `Arc`s so probe and broadcast I/O never runs inside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tokio::time::timeout;
use uuid::Uuid;

use crate::transport::{close_code, Transport};

use super::types::{
    AdmissionError, ConnectionEntry, ConnectionLimits, ConnectionState, DisconnectReason,
    StalePolicy,
};

/// Budget for telling a peer goodbye before giving up on it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Result of a successful registration.
pub struct Admission {
    pub entry: Arc<ConnectionEntry>,
    /// Connections force-evicted to make room under the global cap.
    pub evicted: usize,
    /// Whether this registration replaced a live entry with the same id.
    pub reconnected: bool,
}

#[derive(Default)]
struct RegistryIndex {
    /// connection_id -> entry
    connections: HashMap<Uuid, Arc<ConnectionEntry>>,
    /// tenant_id -> set of connection ids
    tenants: HashMap<String, HashSet<Uuid>>,
}

impl RegistryIndex {
    fn insert(&mut self, entry: Arc<ConnectionEntry>) {
        self.tenants
            .entry(entry.tenant_id.clone())
            .or_default()
            .insert(entry.id);
        self.connections.insert(entry.id, entry);
    }

    fn remove(&mut self, connection_id: &Uuid) -> Option<Arc<ConnectionEntry>> {
        let entry = self.connections.remove(connection_id)?;
        if let Some(ids) = self.tenants.get_mut(&entry.tenant_id) {
            ids.remove(connection_id);
            if ids.is_empty() {
                self.tenants.remove(&entry.tenant_id);
            }
        }
        Some(entry)
    }

    fn tenant_len(&self, tenant_id: &str) -> usize {
        self.tenants.get(tenant_id).map_or(0, |ids| ids.len())
    }

    fn oldest(&self, n: usize) -> Vec<Arc<ConnectionEntry>> {
        let mut all: Vec<_> = self.connections.values().cloned().collect();
        all.sort_by_key(|entry| entry.connected_at);
        all.truncate(n);
        all
    }
}

/// Manages all live push connections and enforces capacity at admission.
pub struct ConnectionRegistry {
    limits: ConnectionLimits,
    index: RwLock<RegistryIndex>,
}

impl ConnectionRegistry {
    pub fn new(limits: ConnectionLimits) -> Self {
        Self {
            limits,
            index: RwLock::new(RegistryIndex::default()),
        }
    }

    /// Admit a new connection.
    ///
    /// At the global cap, the globally-oldest connections are force-evicted
    /// first; if the cap still holds, or the tenant's own cap is reached,
    /// the registration is rejected and the transport closed with a policy
    /// code. A rejected tenant never displaces another tenant's connections.
    pub async fn register(
        &self,
        transport: Box<dyn Transport>,
        tenant_id: &str,
        connection_id: Uuid,
    ) -> Result<Admission, AdmissionError> {
        let mut evicted: Vec<Arc<ConnectionEntry>> = Vec::new();
        let mut replaced: Option<Arc<ConnectionEntry>> = None;
        let mut rejected: Option<Box<dyn Transport>> = None;

        let outcome = {
            let mut index = self.index.write().await;

            // A live id registering again is a reconnect: the old entry
            // leaves both structures now, its transport is closed below.
            let prior_reconnects = match index.remove(&connection_id) {
                Some(old) => {
                    old.set_state(ConnectionState::Removed);
                    let count = old.reconnect_count() + 1;
                    replaced = Some(old);
                    count
                }
                None => 0,
            };

            if index.connections.len() >= self.limits.max_total_connections {
                let overflow = index.connections.len() + 1 - self.limits.max_total_connections;
                for victim in index.oldest(overflow) {
                    index.remove(&victim.id);
                    victim.set_state(ConnectionState::Removed);
                    evicted.push(victim);
                }
            }

            let total = index.connections.len();
            let tenant_count = index.tenant_len(tenant_id);

            if total >= self.limits.max_total_connections {
                rejected = Some(transport);
                Err(AdmissionError::TotalLimitExceeded {
                    current: total,
                    max: self.limits.max_total_connections,
                })
            } else if tenant_count >= self.limits.max_connections_per_tenant {
                rejected = Some(transport);
                Err(AdmissionError::TenantLimitExceeded {
                    tenant_id: tenant_id.to_string(),
                    current: tenant_count,
                    max: self.limits.max_connections_per_tenant,
                })
            } else {
                let entry = Arc::new(ConnectionEntry::new(
                    connection_id,
                    tenant_id.to_string(),
                    transport,
                    prior_reconnects,
                ));
                entry.set_state(ConnectionState::Connected);
                index.insert(entry.clone());
                Ok(entry)
            }
        };

        let reconnected = replaced.is_some();
        if let Some(old) = replaced {
            tracing::info!(
                connection_id = %connection_id,
                tenant_id = %old.tenant_id,
                "Connection replaced by reconnect"
            );
            let _ = timeout(
                CLOSE_TIMEOUT,
                old.close(
                    DisconnectReason::Replaced.close_code(),
                    DisconnectReason::Replaced.as_str(),
                ),
            )
            .await;
        }

        for victim in &evicted {
            tracing::info!(
                connection_id = %victim.id,
                tenant_id = %victim.tenant_id,
                age_secs = victim.age_secs(Utc::now()),
                "Evicting oldest connection to enforce global cap"
            );
            if timeout(
                CLOSE_TIMEOUT,
                victim.close(
                    close_code::GOING_AWAY,
                    DisconnectReason::CapacityEviction.as_str(),
                ),
            )
            .await
            .is_err()
            {
                // the victim already left the maps; eviction moves on
                tracing::warn!(
                    connection_id = %victim.id,
                    "Timed out closing evicted connection"
                );
            }
        }

        match outcome {
            Ok(entry) => {
                tracing::info!(
                    connection_id = %entry.id,
                    tenant_id = %entry.tenant_id,
                    "Connection registered"
                );
                Ok(Admission {
                    entry,
                    evicted: evicted.len(),
                    reconnected,
                })
            }
            Err(e) => {
                tracing::warn!(tenant_id = %tenant_id, error = %e, "Connection rejected");
                if let Some(transport) = rejected {
                    transport
                        .close(close_code::POLICY_VIOLATION, "admission_rejected")
                        .await;
                }
                Err(e)
            }
        }
    }

    /// Remove a connection and close its transport.
    ///
    /// Unknown ids are a silent no-op: unregister races with the sweep, the
    /// heartbeat loop, and broadcast cleanup are expected. Returns the
    /// removed entry when this call was the one that removed it.
    pub async fn unregister(
        &self,
        connection_id: Uuid,
        reason: DisconnectReason,
    ) -> Option<Arc<ConnectionEntry>> {
        let removed = { self.index.write().await.remove(&connection_id) };

        let entry = removed?;
        entry.set_state(ConnectionState::Removed);
        tracing::info!(
            connection_id = %connection_id,
            tenant_id = %entry.tenant_id,
            reason = %reason,
            "Connection unregistered"
        );
        let _ = timeout(
            CLOSE_TIMEOUT,
            entry.close(reason.close_code(), reason.as_str()),
        )
        .await;
        Some(entry)
    }

    /// Refresh the activity clock of a connection. No-op on unknown ids.
    pub async fn record_activity(&self, connection_id: Uuid) {
        if let Some(entry) = self.get(connection_id).await {
            entry.touch();
        }
    }

    pub async fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionEntry>> {
        self.index
            .read()
            .await
            .connections
            .get(&connection_id)
            .cloned()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.connections.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.index.read().await.connections.is_empty()
    }

    pub async fn tenant_len(&self, tenant_id: &str) -> usize {
        self.index.read().await.tenant_len(tenant_id)
    }

    pub async fn per_tenant_counts(&self) -> HashMap<String, usize> {
        self.index
            .read()
            .await
            .tenants
            .iter()
            .map(|(tenant, ids)| (tenant.clone(), ids.len()))
            .collect()
    }

    /// Snapshot of one tenant's connections.
    pub async fn tenant_connections(&self, tenant_id: &str) -> Vec<Arc<ConnectionEntry>> {
        let index = self.index.read().await;
        index
            .tenants
            .get(tenant_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| index.connections.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub async fn all_connections(&self) -> Vec<Arc<ConnectionEntry>> {
        self.index
            .read()
            .await
            .connections
            .values()
            .cloned()
            .collect()
    }

    /// Connections whose heartbeat is due.
    pub async fn probe_candidates(&self, interval_secs: u64) -> Vec<Arc<ConnectionEntry>> {
        let now = Utc::now();
        self.index
            .read()
            .await
            .connections
            .values()
            .filter(|entry| entry.probe_due(now, interval_secs))
            .cloned()
            .collect()
    }

    /// Ids matching the staleness predicate.
    pub async fn find_stale(&self, policy: &StalePolicy) -> Vec<Uuid> {
        let now = Utc::now();
        self.index
            .read()
            .await
            .connections
            .values()
            .filter(|entry| entry.is_stale(now, policy))
            .map(|entry| entry.id)
            .collect()
    }

    /// Empty both structures, returning every entry that was registered.
    /// Used by shutdown; callers own the goodbye sends.
    pub async fn drain(&self) -> Vec<Arc<ConnectionEntry>> {
        let mut index = self.index.write().await;
        index.tenants.clear();
        let drained: Vec<_> = index.connections.drain().map(|(_, entry)| entry).collect();
        for entry in &drained {
            entry.set_state(ConnectionState::Removed);
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, Envelope};
    use tokio::sync::mpsc;

    fn registry(max_total: usize, max_per_tenant: usize) -> ConnectionRegistry {
        ConnectionRegistry::new(ConnectionLimits {
            max_total_connections: max_total,
            max_connections_per_tenant: max_per_tenant,
        })
    }

    fn channel_transport() -> (Box<ChannelTransport>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(8);
        (Box::new(ChannelTransport::new(tx)), rx)
    }

    async fn admit(registry: &ConnectionRegistry, tenant: &str) -> Uuid {
        let (transport, _rx) = channel_transport();
        let id = Uuid::new_v4();
        registry.register(transport, tenant, id).await.unwrap();
        id
    }

    async fn assert_index_consistent(registry: &ConnectionRegistry) {
        let connections = registry.all_connections().await;
        let counts = registry.per_tenant_counts().await;
        assert_eq!(connections.len(), counts.values().sum::<usize>());
        for entry in connections {
            let peers = registry.tenant_connections(&entry.tenant_id).await;
            assert!(peers.iter().any(|peer| peer.id == entry.id));
        }
    }

    #[tokio::test]
    async fn test_tenant_cap_rejects_third_connection() {
        let registry = registry(100, 2);
        admit(&registry, "tenant-a").await;
        admit(&registry, "tenant-a").await;

        let (transport, _rx) = channel_transport();
        let err = registry
            .register(transport, "tenant-a", Uuid::new_v4())
            .await
            .err()
            .expect("third registration should be rejected");

        assert!(matches!(err, AdmissionError::TenantLimitExceeded { .. }));
        assert_eq!(registry.tenant_len("tenant-a").await, 2);
        assert_index_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_tenant_cap_never_touches_other_tenants() {
        let registry = registry(100, 1);
        admit(&registry, "tenant-a").await;
        admit(&registry, "tenant-b").await;

        let (transport, _rx) = channel_transport();
        assert!(registry
            .register(transport, "tenant-a", Uuid::new_v4())
            .await
            .is_err());

        assert_eq!(registry.tenant_len("tenant-a").await, 1);
        assert_eq!(registry.tenant_len("tenant-b").await, 1);
    }

    #[tokio::test]
    async fn test_rejected_transport_closed_with_policy_code() {
        let registry = registry(100, 1);
        admit(&registry, "tenant-a").await;

        let (transport, mut rx) = channel_transport();
        let _ = registry
            .register(transport, "tenant-a", Uuid::new_v4())
            .await;

        match rx.recv().await {
            Some(Envelope::Close { code, .. }) => assert_eq!(code, close_code::POLICY_VIOLATION),
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_global_cap_evicts_oldest_connection() {
        let registry = registry(3, 100);
        let first = admit(&registry, "tenant-a").await;
        admit(&registry, "tenant-a").await;
        admit(&registry, "tenant-b").await;

        let (transport, _rx) = channel_transport();
        let newest = Uuid::new_v4();
        let admission = registry
            .register(transport, "tenant-c", newest)
            .await
            .unwrap();

        assert_eq!(admission.evicted, 1);
        assert_eq!(registry.len().await, 3);
        assert!(registry.get(first).await.is_none());
        assert!(registry.get(newest).await.is_some());
        assert_index_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_evicted_connection_receives_going_away() {
        let registry = registry(1, 100);
        let (transport, mut victim_rx) = channel_transport();
        registry
            .register(transport, "tenant-a", Uuid::new_v4())
            .await
            .unwrap();

        admit(&registry, "tenant-b").await;

        match victim_rx.recv().await {
            Some(Envelope::Close { code, reason }) => {
                assert_eq!(code, close_code::GOING_AWAY);
                assert_eq!(reason, "capacity_eviction");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = registry(10, 10);
        let id = admit(&registry, "tenant-a").await;

        assert!(registry
            .unregister(id, DisconnectReason::ClientClosed)
            .await
            .is_some());
        assert!(registry
            .unregister(id, DisconnectReason::ClientClosed)
            .await
            .is_none());
        assert!(registry
            .unregister(Uuid::new_v4(), DisconnectReason::Stale)
            .await
            .is_none());
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_record_activity_unknown_id_is_noop() {
        let registry = registry(10, 10);
        registry.record_activity(Uuid::new_v4()).await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_reregistering_live_id_is_a_reconnect() {
        let registry = registry(10, 10);
        let id = Uuid::new_v4();

        let (first, mut first_rx) = channel_transport();
        registry.register(first, "tenant-a", id).await.unwrap();

        let (second, _second_rx) = channel_transport();
        let admission = registry.register(second, "tenant-a", id).await.unwrap();

        assert!(admission.reconnected);
        assert_eq!(admission.entry.reconnect_count(), 1);
        assert_eq!(registry.len().await, 1);
        assert!(matches!(
            first_rx.recv().await,
            Some(Envelope::Close { .. })
        ));
        assert_index_consistent(&registry).await;
    }

    #[tokio::test]
    async fn test_drain_empties_both_structures() {
        let registry = registry(10, 10);
        admit(&registry, "tenant-a").await;
        admit(&registry, "tenant-b").await;

        let drained = registry.drain().await;

        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty().await);
        assert!(registry.per_tenant_counts().await.is_empty());
        for entry in drained {
            assert_eq!(entry.state(), ConnectionState::Removed);
        }
    }
}
