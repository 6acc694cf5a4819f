use std::path::Path;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{info, warn};

use crate::error::Result;
use crate::storage::crypto::SecretCipher;
use crate::storage::sqlite::open_secure_store;

/// Per-connection secret storage. Keyed purely by connection id.
pub struct CredentialVault {
    db: Mutex<Connection>,
    cipher: SecretCipher,
}

impl CredentialVault {
    pub fn open(db_path: &Path, key_file: &Path) -> Result<Self> {
        let db = open_secure_store(db_path)?;
        let cipher = SecretCipher::from_key_file(key_file);
        info!(
            "[Vault] Secure store opened at {:?} (scheme: {})",
            db_path,
            cipher.scheme()
        );
        Ok(Self::with_cipher(db, cipher))
    }

    pub fn with_cipher(db: Connection, cipher: SecretCipher) -> Self {
        if !cipher.is_encrypting() {
            warn!("[Vault] Secrets are NOT encrypted; reversible encoding in use");
        }
        Self {
            db: Mutex::new(db),
            cipher,
        }
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.cipher.is_encrypting()
    }

    /// Stores (or overwrites) the secret. An empty secret deletes the entry.
    pub fn set_secret(&self, connection_id: &str, secret: &str) -> Result<()> {
        if secret.is_empty() {
            return self.delete_secret(connection_id);
        }

        let blob = self.cipher.seal(secret)?;
        self.db.lock().execute(
            "INSERT INTO secrets (connection_id, scheme, blob) VALUES (?1, ?2, ?3)
             ON CONFLICT(connection_id) DO UPDATE SET scheme = excluded.scheme, blob = excluded.blob",
            params![connection_id, self.cipher.scheme(), blob],
        )?;
        Ok(())
    }

    /// `None` when no entry exists or the entry cannot be decrypted.
    pub fn get_secret(&self, connection_id: &str) -> Option<String> {
        let row: Option<(String, Vec<u8>)> = {
            let db = self.db.lock();
            match db
                .query_row(
                    "SELECT scheme, blob FROM secrets WHERE connection_id = ?1",
                    params![connection_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
            {
                Ok(row) => row,
                Err(e) => {
                    warn!("[Vault] Failed to read secret for {}: {}", connection_id, e);
                    return None;
                }
            }
        };

        let (scheme, blob) = row?;
        match self.cipher.open(&scheme, &blob) {
            Ok(secret) => Some(secret),
            Err(e) => {
                warn!("[Vault] Could not decrypt secret for {}: {}", connection_id, e);
                None
            }
        }
    }

    pub fn delete_secret(&self, connection_id: &str) -> Result<()> {
        self.db
            .lock()
            .execute("DELETE FROM secrets WHERE connection_id = ?1", params![connection_id])?;
        Ok(())
    }

    pub fn has_secret(&self, connection_id: &str) -> bool {
        self.db
            .lock()
            .query_row(
                "SELECT 1 FROM secrets WHERE connection_id = ?1",
                params![connection_id],
                |_| Ok(()),
            )
            .optional()
            .map(|found| found.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::crypto::{VaultKey, KEY_SIZE};

    fn vault() -> CredentialVault {
        let db = Connection::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE secrets (connection_id TEXT PRIMARY KEY, scheme TEXT NOT NULL, blob BLOB NOT NULL)",
            [],
        )
        .unwrap();
        CredentialVault::with_cipher(db, SecretCipher::Sealed(VaultKey::from_bytes([9u8; KEY_SIZE])))
    }

    #[test]
    fn test_absent_is_distinct_from_set() {
        let vault = vault();
        assert!(!vault.has_secret("c1"));
        assert_eq!(vault.get_secret("c1"), None);

        vault.set_secret("c1", "pw").unwrap();
        assert!(vault.has_secret("c1"));
        assert_eq!(vault.get_secret("c1").as_deref(), Some("pw"));
    }

    #[test]
    fn test_empty_secret_deletes() {
        let vault = vault();
        vault.set_secret("c1", "pw").unwrap();
        vault.set_secret("c1", "").unwrap();
        assert!(!vault.has_secret("c1"));
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let vault = vault();
        vault.set_secret("c1", "old").unwrap();
        vault.set_secret("c1", "new").unwrap();
        assert_eq!(vault.get_secret("c1").as_deref(), Some("new"));
    }

    #[test]
    fn test_reports_whether_secrets_are_encrypted() {
        assert!(vault().is_encryption_enabled());

        let db = Connection::open_in_memory().unwrap();
        let plain = CredentialVault::with_cipher(db, SecretCipher::Plain);
        assert!(!plain.is_encryption_enabled());
    }

    #[test]
    fn test_undecryptable_entry_reads_as_absent() {
        let vault = vault();
        vault
            .db
            .lock()
            .execute(
                "INSERT INTO secrets (connection_id, scheme, blob) VALUES ('c1', 'chacha20poly1305', x'00')",
                [],
            )
            .unwrap();
        assert!(vault.has_secret("c1"));
        assert_eq!(vault.get_secret("c1"), None);
    }
}
