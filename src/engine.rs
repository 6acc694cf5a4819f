use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::ClientFactory;
use crate::config::Config;
use crate::error::{KafdeskError, Result};
use crate::managers::admin::AdminManager;
use crate::managers::connection::ConnectionManager;
use crate::managers::consumer::SessionManager;
use crate::managers::groups::GroupManager;
use crate::managers::producer::ProducerManager;
use crate::models::{ConnectionConfig, ConnectionDraft, ConnectionPatch, ConnectionTestResult};
use crate::storage::{ConnectionRegistry, CredentialVault};

const MASKED_SECRET: &str = "***";

// ========================================
// ENGINE
// ========================================

/// Owns every cache and store. Cheap to clone (all fields are Arcs).
#[derive(Clone)]
pub struct KafdeskEngine {
    pub registry: Arc<ConnectionRegistry>,
    pub vault: Arc<CredentialVault>,
    pub connections: Arc<ConnectionManager>,
    pub admin: Arc<AdminManager>,
    pub producers: Arc<ProducerManager>,
    pub sessions: Arc<SessionManager>,
    pub groups: Arc<GroupManager>,
    idle_sweep: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl KafdeskEngine {
    /// Opens both stores under the data directory and starts the idle sweep.
    /// Must be called inside a Tokio runtime.
    pub fn new(config: &Config, factory: Arc<dyn ClientFactory>) -> Result<Self> {
        std::fs::create_dir_all(&config.storage.data_dir)?;
        let registry = Arc::new(ConnectionRegistry::open(&config.storage.connections_db())?);
        let vault = Arc::new(CredentialVault::open(
            &config.storage.secure_db(),
            &config.storage.key_file(),
        )?);

        let connections = Arc::new(ConnectionManager::new(
            factory,
            registry.clone(),
            vault.clone(),
            config.connections.clone(),
        ));
        let idle_sweep = connections.start_idle_sweep();
        info!(
            "[Engine] Stores open in {} (secrets {})",
            config.storage.data_dir.display(),
            if vault.is_encryption_enabled() { "encrypted" } else { "NOT encrypted" }
        );

        Ok(Self {
            admin: Arc::new(AdminManager::new(connections.clone(), config.admin.clone())),
            producers: Arc::new(ProducerManager::new(connections.clone())),
            sessions: Arc::new(SessionManager::new(connections.clone(), config.consumer.clone())),
            groups: Arc::new(GroupManager::new(connections.clone(), config.consumer.clone())),
            registry,
            vault,
            connections,
            idle_sweep: Arc::new(Mutex::new(Some(idle_sweep))),
        })
    }

    // ========================================
    // CONNECTION LIFECYCLE
    // ========================================

    /// Persists a new connection; the password goes to the vault only. Returns the id.
    pub fn create_connection(&self, draft: ConnectionDraft) -> Result<String> {
        draft.validate()?;
        if self.registry.is_name_taken(&draft.name, None)? {
            return Err(KafdeskError::Validation(format!(
                "A connection named '{}' already exists",
                draft.name
            )));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let config = draft.into_config(id.clone(), Utc::now());
        let password = config.sasl.as_ref().map(|s| s.password.clone()).unwrap_or_default();

        self.registry.add(&config)?;
        if let Err(e) = self.vault.set_secret(&id, &password) {
            // Do not leave a config behind whose secret was lost
            if let Err(rollback) = self.registry.delete(&id) {
                warn!("[Engine] Rollback of connection {} failed: {}", id, rollback);
            }
            return Err(e);
        }

        info!("[Engine] Created connection '{}' ({})", config.name, id);
        Ok(id)
    }

    /// Merges the patch. The cached handle and producer are closed so the
    /// next borrow picks up the new settings.
    pub async fn update_connection(&self, id: &str, mut patch: ConnectionPatch) -> Result<()> {
        patch.validate()?;
        if self.registry.get(id)?.is_none() {
            return Err(KafdeskError::not_found("Connection", id));
        }

        let mut new_secret = None;
        let mut clear_secret = false;
        match patch.sasl.as_mut() {
            Some(Some(sasl)) if !sasl.password.is_empty() => {
                new_secret = Some(std::mem::take(&mut sasl.password));
            }
            Some(None) => clear_secret = true,
            _ => {}
        }

        if let Some(name) = &patch.name {
            if self.registry.is_name_taken(name, Some(id))? {
                return Err(KafdeskError::Validation(format!(
                    "A connection named '{}' already exists",
                    name
                )));
            }
        }

        if !self.registry.update(id, patch)? {
            return Err(KafdeskError::not_found("Connection", id));
        }
        let stored = match new_secret {
            Some(secret) => self.vault.set_secret(id, &secret),
            None if clear_secret => self.vault.delete_secret(id),
            None => Ok(()),
        };

        // The stored config already changed: drop the live clients either way
        self.producers.close_producer(id).await;
        self.connections.close_connection(id).await;
        if let Err(e) = stored {
            warn!("[Engine] Updated connection {} but its secret was not stored: {}", id, e);
            return Err(e);
        }
        info!("[Engine] Updated connection {}", id);
        Ok(())
    }

    /// Stops the connection's sessions, closes its clients and forgets it.
    pub async fn delete_connection(&self, id: &str) -> Result<()> {
        if self.registry.get(id)?.is_none() {
            return Err(KafdeskError::not_found("Connection", id));
        }

        self.sessions.stop_sessions_for_connection(id).await;
        self.producers.close_producer(id).await;
        self.connections.close_connection(id).await;
        self.vault.delete_secret(id)?;
        self.registry.delete(id)?;

        if self.registry.get_active_id()?.as_deref() == Some(id) {
            self.registry.set_active_id(None)?;
        }
        info!("[Engine] Deleted connection {}", id);
        Ok(())
    }

    /// Stored configs; passwords show as `***` when a secret exists.
    pub fn list_connections(&self) -> Result<Vec<ConnectionConfig>> {
        Ok(self
            .registry
            .list()?
            .into_iter()
            .map(|config| self.masked(config))
            .collect())
    }

    pub fn get_connection(&self, id: &str) -> Result<ConnectionConfig> {
        self.registry
            .get(id)?
            .map(|config| self.masked(config))
            .ok_or_else(|| KafdeskError::not_found("Connection", id))
    }

    /// Never fails. A draft naming a stored connection without a password
    /// is tested with the stored secret.
    pub async fn test_connection(&self, draft: ConnectionDraft) -> ConnectionTestResult {
        if let Err(e) = draft.validate() {
            return ConnectionTestResult {
                success: false,
                message: e.to_string(),
                broker_count: None,
                controller_id: None,
                cluster_id: None,
                response_time_ms: 0,
            };
        }

        let stored_secret = match (&draft.id, &draft.sasl) {
            (Some(id), Some(sasl)) if sasl.password.is_empty() => self.vault.get_secret(id),
            _ => None,
        };
        let id = draft
            .id
            .clone()
            .unwrap_or_else(|| format!("test-{}", uuid::Uuid::new_v4()));
        let config = draft.into_config(id, Utc::now()).with_secret(stored_secret);

        self.connections.test_connection(&config).await
    }

    /// Builds (or reuses) the handle and marks the connection active.
    pub fn connect(&self, id: &str) -> Result<ConnectionConfig> {
        let config = self.get_connection(id)?;
        self.connections.acquire(id)?;
        self.registry.set_active_id(Some(id))?;
        info!("[Engine] Connected to '{}' ({})", config.name, id);
        Ok(config)
    }

    pub async fn disconnect(&self, id: &str) -> Result<()> {
        self.producers.close_producer(id).await;
        self.connections.close_connection(id).await;
        if self.registry.get_active_id()?.as_deref() == Some(id) {
            self.registry.set_active_id(None)?;
        }
        info!("[Engine] Disconnected {}", id);
        Ok(())
    }

    pub fn get_active_connection(&self) -> Result<Option<ConnectionConfig>> {
        Ok(self.registry.get_active()?.map(|config| self.masked(config)))
    }

    fn masked(&self, mut config: ConnectionConfig) -> ConnectionConfig {
        let has_secret = self.vault.has_secret(&config.id);
        if let Some(sasl) = config.sasl.as_mut() {
            sasl.password = if has_secret { MASKED_SECRET.to_string() } else { String::new() };
        }
        config
    }

    // ========================================
    // SHUTDOWN
    // ========================================

    pub async fn shutdown(&self) {
        info!("[Engine] Shutting down ({} active sessions)", self.sessions.session_count());
        self.sessions.stop_all_sessions().await;
        self.producers.close_all_producers().await;
        self.connections.close_all_connections().await;
        if let Some(sweep) = self.idle_sweep.lock().take() {
            sweep.abort();
        }
    }
}
