//! Authenticated encryption of stored documents using ChaCha20-Poly1305

use crate::error::{Result, SyncError};
use crate::types::{Document, Scope, SettingsRecord};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce, Tag,
    aead::{AeadInPlace, KeyInit},
};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::info;

/// Key size for ChaCha20-Poly1305
pub const KEY_SIZE: usize = 32;

/// Nonce size for ChaCha20-Poly1305
pub const NONCE_SIZE: usize = 12;

/// Tag size for ChaCha20-Poly1305
pub const TAG_SIZE: usize = 16;

/// Process-wide document cipher. Read-only after startup.
pub struct SettingsCipher {
    cipher: ChaCha20Poly1305,
}

impl SettingsCipher {
    pub fn new(key: &[u8; KEY_SIZE]) -> Self {
        SettingsCipher {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_slice(key: &[u8]) -> Result<Self> {
        let key: &[u8; KEY_SIZE] = key.try_into().map_err(|_| {
            SyncError::FatalConfiguration(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            ))
        })?;
        Ok(Self::new(key))
    }

    /// Build from the base64 form used in configuration
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let key = STANDARD.decode(encoded.trim()).map_err(|e| {
            SyncError::FatalConfiguration(format!("encryption key is not valid base64: {}", e))
        })?;
        Self::from_slice(&key)
    }

    /// Fresh random key, for development servers and tests
    pub fn generate_key() -> [u8; KEY_SIZE] {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Base64 key kept in `path`, written there with a fresh key first if
    /// the file does not exist yet
    pub fn load_or_create_key_file(path: &Path) -> Result<String> {
        if path.exists() {
            let encoded = fs::read_to_string(path).map_err(|e| {
                SyncError::FatalConfiguration(format!("cannot read key file {:?}: {}", path, e))
            })?;
            let encoded = encoded.trim().to_string();
            Self::from_base64(&encoded)?;
            return Ok(encoded);
        }

        let encoded = STANDARD.encode(Self::generate_key());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, &encoded)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }
        info!("Generated a new encryption key at {:?}", path);
        Ok(encoded)
    }

    /// Encrypt a document into a record. The scope is bound as associated
    /// data so a record only opens under the scope it was written for.
    pub fn seal(
        &self,
        scope: &Scope,
        document: &Document,
        version: u64,
        updated_at: i64,
    ) -> Result<SettingsRecord> {
        let mut buffer = document.to_json()?;
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let aad = scope.to_string();
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad.as_bytes(), &mut buffer)
            .map_err(|_| SyncError::FatalConfiguration("document encryption failed".into()))?;

        Ok(SettingsRecord {
            version,
            updated_at,
            ciphertext: buffer,
            nonce: nonce.to_vec(),
            auth_tag: tag.to_vec(),
        })
    }

    /// Decrypt a record. Any failure means corrupt data or the wrong key.
    pub fn open(&self, scope: &Scope, record: &SettingsRecord) -> Result<Document> {
        if record.nonce.len() != NONCE_SIZE || record.auth_tag.len() != TAG_SIZE {
            return Err(SyncError::FatalConfiguration(format!(
                "record for {} has malformed nonce or tag",
                scope
            )));
        }

        let mut buffer = record.ciphertext.clone();
        let aad = scope.to_string();
        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&record.nonce),
                aad.as_bytes(),
                &mut buffer,
                Tag::from_slice(&record.auth_tag),
            )
            .map_err(|_| {
                SyncError::FatalConfiguration(format!(
                    "record for {} failed authentication (wrong key or corrupt data)",
                    scope
                ))
            })?;

        Document::from_json(&buffer).map_err(|e| {
            SyncError::FatalConfiguration(format!("record for {} is not a document: {}", scope, e))
        })
    }
}

impl fmt::Debug for SettingsCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettingsCipher").finish_non_exhaustive()
    }
}
