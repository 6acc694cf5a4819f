//! Sealing of vault secrets at rest.
//!
//! Sealed blob layout:
//! - 8 bytes: magic `KDSK_ENC`
//! - 12 bytes: nonce
//! - N bytes: ciphertext with authentication tag
//!
//! The key is 256 bits of OS randomness kept in a key file next to the secure
//! store. When no key can be loaded or created the cipher degrades to a
//! reversible hex encoding, tagged with its own scheme so the two are never
//! confused on read.

use std::fs;
use std::io::Write;
use std::path::Path;

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use tracing::{info, warn};

use crate::error::{KafdeskError, Result};

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SEALED_MAGIC: &[u8; 8] = b"KDSK_ENC";

pub const SCHEME_SEALED: &str = "chacha20poly1305";
pub const SCHEME_PLAIN: &str = "plain-hex";

#[derive(Clone)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Loads the key file, creating it (owner-only) on first use.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let raw = fs::read(path)?;
            let decoded = hex::decode(raw.trim_ascii())
                .map_err(|e| KafdeskError::Storage(format!("Vault key file {:?} is corrupt: {}", path, e)))?;
            let bytes: [u8; KEY_SIZE] = decoded
                .try_into()
                .map_err(|_| KafdeskError::Storage(format!("Vault key file {:?} has the wrong length", path)))?;
            return Ok(Self { bytes });
        }

        let key = Self::generate();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = create_private(path)?;
        file.write_all(hex::encode(key.bytes).as_bytes())?;
        file.sync_all()?;
        info!("[Vault] Generated new vault key at {:?}", path);
        Ok(key)
    }
}

impl Drop for VaultKey {
    fn drop(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "VaultKey([REDACTED])")
    }
}

#[cfg(unix)]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new().write(true).create_new(true).mode(0o600).open(path)
}

#[cfg(not(unix))]
fn create_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new().write(true).create_new(true).open(path)
}

pub enum SecretCipher {
    Sealed(VaultKey),
    /// Fallback when no key material is available. Not encryption.
    Plain,
}

impl SecretCipher {
    pub fn from_key_file(path: &Path) -> Self {
        match VaultKey::load_or_create(path) {
            Ok(key) => SecretCipher::Sealed(key),
            Err(e) => {
                warn!(
                    "[Vault] Encryption unavailable ({}); secrets will be stored with a reversible encoding",
                    e
                );
                SecretCipher::Plain
            }
        }
    }

    pub fn is_encrypting(&self) -> bool {
        matches!(self, SecretCipher::Sealed(_))
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SecretCipher::Sealed(_) => SCHEME_SEALED,
            SecretCipher::Plain => SCHEME_PLAIN,
        }
    }

    pub fn seal(&self, plaintext: &str) -> Result<Vec<u8>> {
        match self {
            SecretCipher::Sealed(key) => {
                let mut nonce_bytes = [0u8; NONCE_SIZE];
                OsRng.fill_bytes(&mut nonce_bytes);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.bytes));
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
                    .map_err(|e| KafdeskError::Storage(format!("Secret encryption failed: {}", e)))?;

                let mut out = Vec::with_capacity(SEALED_MAGIC.len() + NONCE_SIZE + ciphertext.len());
                out.extend_from_slice(SEALED_MAGIC);
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&ciphertext);
                Ok(out)
            }
            SecretCipher::Plain => Ok(hex::encode(plaintext).into_bytes()),
        }
    }

    /// Reverses `seal` for a blob stored under `scheme`.
    pub fn open(&self, scheme: &str, blob: &[u8]) -> Result<String> {
        let bytes = match (scheme, self) {
            (SCHEME_PLAIN, _) => hex::decode(blob)
                .map_err(|e| KafdeskError::Storage(format!("Corrupt encoded secret: {}", e)))?,
            (SCHEME_SEALED, SecretCipher::Sealed(key)) => {
                let header = SEALED_MAGIC.len() + NONCE_SIZE;
                if blob.len() < header + TAG_SIZE || &blob[..SEALED_MAGIC.len()] != SEALED_MAGIC {
                    return Err(KafdeskError::Storage("Sealed secret has an invalid header".to_string()));
                }
                let nonce = Nonce::from_slice(&blob[SEALED_MAGIC.len()..header]);
                let cipher = ChaCha20Poly1305::new(Key::from_slice(&key.bytes));
                cipher
                    .decrypt(nonce, &blob[header..])
                    .map_err(|_| KafdeskError::Storage("Secret decryption failed (wrong key or corrupted data)".to_string()))?
            }
            (SCHEME_SEALED, SecretCipher::Plain) => {
                return Err(KafdeskError::Storage("Sealed secret but no vault key is available".to_string()));
            }
            (other, _) => return Err(KafdeskError::Storage(format!("Unknown secret scheme '{}'", other))),
        };

        String::from_utf8(bytes).map_err(|e| KafdeskError::Storage(format!("Secret is not UTF-8: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealed() -> SecretCipher {
        SecretCipher::Sealed(VaultKey::from_bytes([0x42u8; KEY_SIZE]))
    }

    #[test]
    fn test_sealed_blob_hides_plaintext() {
        let cipher = sealed();
        let blob = cipher.seal("hunter2").unwrap();
        assert!(blob.starts_with(SEALED_MAGIC));
        assert!(!blob.windows(7).any(|w| w == b"hunter2"));
        assert_eq!(cipher.open(SCHEME_SEALED, &blob).unwrap(), "hunter2");
    }

    #[test]
    fn test_wrong_key_fails_to_open() {
        let blob = sealed().seal("secret").unwrap();
        let other = SecretCipher::Sealed(VaultKey::from_bytes([0x07u8; KEY_SIZE]));
        assert!(other.open(SCHEME_SEALED, &blob).is_err());
    }

    #[test]
    fn test_tampered_blob_fails_to_open() {
        let cipher = sealed();
        let mut blob = cipher.seal("secret").unwrap();
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(cipher.open(SCHEME_SEALED, &blob).is_err());
    }

    #[test]
    fn test_plain_fallback_is_flagged() {
        let cipher = SecretCipher::Plain;
        assert!(!cipher.is_encrypting());
        assert_eq!(cipher.scheme(), SCHEME_PLAIN);
        let blob = cipher.seal("pw").unwrap();
        assert_eq!(cipher.open(SCHEME_PLAIN, &blob).unwrap(), "pw");
    }

    #[test]
    fn test_key_file_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vault.key");

        let first = SecretCipher::from_key_file(&path);
        let blob = first.seal("persisted").unwrap();

        let second = SecretCipher::from_key_file(&path);
        assert_eq!(second.open(SCHEME_SEALED, &blob).unwrap(), "persisted");
    }
}
