use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::info;

use crate::error::{KafdeskError, Result};
use crate::models::{ConnectionConfig, ConnectionPatch};
use crate::storage::sqlite::open_connection_store;

const ACTIVE_CONNECTION_KEY: &str = "active_connection_id";

/// Durable store of connection configs. Passwords are never written here.
pub struct ConnectionRegistry {
    db: Mutex<Connection>,
}

impl ConnectionRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        let db = open_connection_store(path)?;
        info!("[Registry] Connection store opened at {:?}", path);
        Ok(Self { db: Mutex::new(db) })
    }

    /// Ordered by creation time.
    pub fn list(&self) -> Result<Vec<ConnectionConfig>> {
        let db = self.db.lock();
        let mut stmt = db.prepare("SELECT body FROM connections ORDER BY created_at ASC, id ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut out = Vec::new();
        for body in rows {
            out.push(serde_json::from_str(&body?)?);
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Result<Option<ConnectionConfig>> {
        let body: Option<String> = self
            .db
            .lock()
            .query_row("SELECT body FROM connections WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;

        match body {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    pub fn add(&self, config: &ConnectionConfig) -> Result<()> {
        let db = self.db.lock();
        if name_taken(&db, &config.name, None)? {
            return Err(duplicate_name(&config.name));
        }

        let stored = config.without_secret();
        db.execute(
            "INSERT INTO connections (id, name, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                stored.id,
                stored.name,
                serde_json::to_string(&stored)?,
                stored.created_at.timestamp_millis(),
                stored.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Merges `patch` into the stored config. `Ok(false)` if the id is unknown.
    pub fn update(&self, id: &str, patch: ConnectionPatch) -> Result<bool> {
        let db = self.db.lock();
        let body: Option<String> = db
            .query_row("SELECT body FROM connections WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let Some(body) = body else {
            return Ok(false);
        };

        if let Some(name) = &patch.name {
            if name_taken(&db, name, Some(id))? {
                return Err(duplicate_name(name));
            }
        }

        let mut config: ConnectionConfig = serde_json::from_str(&body)?;
        patch.apply(&mut config, Utc::now());
        let stored = config.without_secret();

        db.execute(
            "UPDATE connections SET name = ?2, body = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                id,
                stored.name,
                serde_json::to_string(&stored)?,
                stored.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(true)
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let affected = self.db.lock().execute("DELETE FROM connections WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    /// Case-sensitive name check, optionally ignoring one id (the one being renamed).
    pub fn is_name_taken(&self, name: &str, exclude_id: Option<&str>) -> Result<bool> {
        name_taken(&self.db.lock(), name, exclude_id)
    }

    // ==========================================
    // ACTIVE CONNECTION (advisory)
    // ==========================================

    pub fn get_active_id(&self) -> Result<Option<String>> {
        let value: Option<Option<String>> = self
            .db
            .lock()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![ACTIVE_CONNECTION_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    pub fn set_active_id(&self, id: Option<&str>) -> Result<()> {
        let db = self.db.lock();
        match id {
            Some(id) => {
                db.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                    params![ACTIVE_CONNECTION_KEY, id],
                )?;
            }
            None => {
                db.execute("DELETE FROM settings WHERE key = ?1", params![ACTIVE_CONNECTION_KEY])?;
            }
        }
        Ok(())
    }

    pub fn get_active(&self) -> Result<Option<ConnectionConfig>> {
        match self.get_active_id()? {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }
}

fn name_taken(db: &Connection, name: &str, exclude_id: Option<&str>) -> Result<bool> {
    let found: Option<String> = db
        .query_row("SELECT id FROM connections WHERE name = ?1", params![name], |row| row.get(0))
        .optional()?;
    Ok(match (found, exclude_id) {
        (Some(found), Some(exclude)) => found != exclude,
        (Some(_), None) => true,
        (None, _) => false,
    })
}

fn duplicate_name(name: &str) -> KafdeskError {
    KafdeskError::Validation(format!("A connection named '{}' already exists", name))
}
