use std::path::Path;

use rusqlite::{Connection, Result};

fn open_with_pragmas(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = FULL;
         PRAGMA foreign_keys = ON;",
    )?;
    Ok(conn)
}

/// Connection store: configs + the advisory "active connection" pointer.
pub fn open_connection_store(path: &Path) -> Result<Connection> {
    let conn = open_with_pragmas(path)?;

    // `name` uses the default BINARY collation, so uniqueness is case-sensitive
    conn.execute(
        "CREATE TABLE IF NOT EXISTS connections (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            body TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT
        )",
        [],
    )?;

    Ok(conn)
}

/// Secure store: connection id -> sealed secret.
pub fn open_secure_store(path: &Path) -> Result<Connection> {
    let conn = open_with_pragmas(path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS secrets (
            connection_id TEXT PRIMARY KEY,
            scheme TEXT NOT NULL,
            blob BLOB NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}
