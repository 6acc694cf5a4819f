//! Connection Manager: live client handles keyed by connection id.
//!
//! - One handle per id, built lazily and reused until evicted.
//! - Handles idle past the threshold are dropped by a background sweep.
//! - Borrowers hold an `Arc` so eviction never pulls a client out from under
//!   an in-flight operation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::cluster::{ClientFactory, ClusterClient};
use crate::config::ConnectionsConfig;
use crate::error::{KafdeskError, Result};
use crate::models::{ConnectionConfig, ConnectionTestResult};
use crate::storage::{ConnectionRegistry, CredentialVault};

// ==========================================
// HANDLE
// ==========================================

pub struct ConnectionHandle {
    pub connection_id: String,
    client: Arc<dyn ClusterClient>,
    created_at: Instant,
    last_used: Mutex<Instant>,
}

impl ConnectionHandle {
    fn new(connection_id: String, client: Arc<dyn ClusterClient>) -> Self {
        let now = Instant::now();
        Self {
            connection_id,
            client,
            created_at: now,
            last_used: Mutex::new(now),
        }
    }

    pub fn client(&self) -> Arc<dyn ClusterClient> {
        self.client.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        *self.last_used.lock()
    }

    /// Marks the handle as used. Successive calls return strictly increasing instants.
    fn touch(&self) -> Instant {
        let mut last = self.last_used.lock();
        let now = Instant::now();
        *last = if now > *last { now } else { *last + Duration::from_nanos(1) };
        *last
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock())
    }
}

// ==========================================
// CONNECTION MANAGER
// ==========================================

pub struct ConnectionManager {
    handles: DashMap<String, Arc<ConnectionHandle>>,
    factory: Arc<dyn ClientFactory>,
    registry: Arc<ConnectionRegistry>,
    vault: Arc<CredentialVault>,
    config: ConnectionsConfig,
}

impl ConnectionManager {
    pub fn new(
        factory: Arc<dyn ClientFactory>,
        registry: Arc<ConnectionRegistry>,
        vault: Arc<CredentialVault>,
        config: ConnectionsConfig,
    ) -> Self {
        Self {
            handles: DashMap::new(),
            factory,
            registry,
            vault,
            config,
        }
    }

    /// Starts the periodic idle sweep. The first tick is skipped.
    pub fn start_idle_sweep(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.config.sweep_interval().max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = manager.cleanup_idle_connections().await;
                if evicted > 0 {
                    info!("[ConnectionManager] Idle sweep evicted {} connection(s)", evicted);
                }
            }
        })
    }

    /// Reuses the cached handle for `config.id` or builds a new one. No network I/O.
    pub fn get_connection(&self, config: &ConnectionConfig) -> Result<Arc<ConnectionHandle>> {
        match self.handles.entry(config.id.clone()) {
            Entry::Occupied(entry) => {
                let handle = entry.get().clone();
                handle.touch();
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                let client = self.factory.create(&self.with_defaults(config))?;
                let handle = Arc::new(ConnectionHandle::new(config.id.clone(), client));
                entry.insert(handle.clone());
                info!("[ConnectionManager] Created client for connection '{}' ({})", config.name, config.id);
                Ok(handle)
            }
        }
    }

    /// Handle for a stored connection, with its secret injected from the vault.
    pub fn acquire(&self, connection_id: &str) -> Result<Arc<ConnectionHandle>> {
        if let Some(handle) = self.handles.get(connection_id).map(|h| h.value().clone()) {
            handle.touch();
            return Ok(handle);
        }

        let config = self
            .registry
            .get(connection_id)?
            .ok_or_else(|| KafdeskError::not_found("Connection", connection_id))?;
        let resolved = config.with_secret(self.vault.get_secret(connection_id));
        self.get_connection(&resolved)
    }

    /// Connects with a throwaway client and fetches cluster metadata. Never
    /// touches the cache and never fails; the outcome is in the result.
    pub async fn test_connection(&self, config: &ConnectionConfig) -> ConnectionTestResult {
        let resolved = self.with_defaults(config);
        let budget = Duration::from_millis(
            resolved.connection_timeout.unwrap_or(self.config.default_connection_timeout_ms)
                + resolved.request_timeout.unwrap_or(self.config.default_request_timeout_ms),
        );
        let start = Instant::now();

        let outcome = match time::timeout(budget, self.probe(&resolved)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(KafdeskError::Timeout(format!(
                "No response from the cluster within {} ms",
                budget.as_millis()
            ))),
        };
        let response_time_ms = start.elapsed().as_millis() as u64;

        match outcome {
            Ok(info) => {
                info!(
                    "[ConnectionManager] Test of '{}' succeeded: {} broker(s) in {} ms",
                    config.name,
                    info.brokers.len(),
                    response_time_ms
                );
                ConnectionTestResult {
                    success: true,
                    message: format!("Connected to {} broker(s)", info.brokers.len()),
                    broker_count: Some(info.brokers.len()),
                    controller_id: info.controller_id,
                    cluster_id: info.cluster_id,
                    response_time_ms,
                }
            }
            Err(e) => {
                warn!("[ConnectionManager] Test of '{}' failed: {}", config.name, e);
                ConnectionTestResult {
                    success: false,
                    message: e.to_string(),
                    broker_count: None,
                    controller_id: None,
                    cluster_id: None,
                    response_time_ms,
                }
            }
        }
    }

    async fn probe(&self, config: &ConnectionConfig) -> Result<crate::models::ClusterInfo> {
        let client = self.factory.create(config)?;
        let result = async {
            let admin = client.admin().await?;
            let info = admin.describe_cluster().await;
            if let Err(e) = admin.close().await {
                debug!("[ConnectionManager] Closing test admin failed: {}", e);
            }
            info
        }
        .await;

        if let Err(e) = client.close().await {
            debug!("[ConnectionManager] Closing test client failed: {}", e);
        }
        result
    }

    /// Removes and closes the handle. In-flight borrowers keep their reference.
    pub async fn close_connection(&self, connection_id: &str) {
        if let Some((_, handle)) = self.handles.remove(connection_id) {
            release(handle).await;
        }
    }

    pub async fn close_all_connections(&self) {
        let ids: Vec<String> = self.handles.iter().map(|e| e.key().clone()).collect();
        let handles: Vec<Arc<ConnectionHandle>> = ids
            .iter()
            .filter_map(|id| self.handles.remove(id).map(|(_, h)| h))
            .collect();

        if !handles.is_empty() {
            info!("[ConnectionManager] Closing {} connection(s)", handles.len());
        }
        join_all(handles.into_iter().map(release)).await;
    }

    /// Evicts handles idle longer than the configured threshold. Returns how many.
    pub async fn cleanup_idle_connections(&self) -> usize {
        let threshold = self.config.idle_timeout();
        let now = Instant::now();

        let idle: Vec<String> = self
            .handles
            .iter()
            .filter(|e| e.value().idle_for(now) > threshold)
            .map(|e| e.key().clone())
            .collect();

        let mut evicted = Vec::new();
        for id in idle {
            // Re-checked under the shard lock: a borrow may have just refreshed it
            if let Some((_, handle)) = self.handles.remove_if(&id, |_, h| h.idle_for(Instant::now()) > threshold) {
                debug!(
                    "[ConnectionManager] Evicting idle connection {} (open for {}s)",
                    id,
                    handle.created_at().elapsed().as_secs()
                );
                evicted.push(handle);
            }
        }

        let count = evicted.len();
        join_all(evicted.into_iter().map(release)).await;
        count
    }

    pub fn has_connection(&self, connection_id: &str) -> bool {
        self.handles.contains_key(connection_id)
    }

    pub fn get_active_count(&self) -> usize {
        self.handles.len()
    }

    fn with_defaults(&self, config: &ConnectionConfig) -> ConnectionConfig {
        let mut resolved = config.clone();
        resolved
            .connection_timeout
            .get_or_insert(self.config.default_connection_timeout_ms);
        resolved
            .request_timeout
            .get_or_insert(self.config.default_request_timeout_ms);
        resolved
    }
}

async fn release(handle: Arc<ConnectionHandle>) {
    if let Err(e) = handle.client.close().await {
        warn!("[ConnectionManager] Error closing connection {}: {}", handle.connection_id, e);
    }
}
