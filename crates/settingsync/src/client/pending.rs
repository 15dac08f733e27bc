use crate::error::{Result, SyncError};
use crate::types::Document;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

/// The latest local edit not yet accepted by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingWrite {
    pub document: Document,
    pub updated_at: i64,
    /// Server version the edit was made on top of
    #[serde(default)]
    pub base_version: Option<u64>,
}

/// Durable single-slot storage for the pending write
///
/// Saving replaces whatever was there: only the newest edit survives.
pub trait PendingStore: Send {
    fn load(&self) -> Result<Option<PendingWrite>>;

    fn save(&mut self, write: &PendingWrite) -> Result<()>;

    fn clear(&mut self) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryPendingStore {
    slot: Option<PendingWrite>,
}

impl MemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PendingStore for MemoryPendingStore {
    fn load(&self) -> Result<Option<PendingWrite>> {
        Ok(self.slot.clone())
    }

    fn save(&mut self, write: &PendingWrite) -> Result<()> {
        self.slot = Some(write.clone());
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.slot = None;
        Ok(())
    }
}

/// JSON file slot that survives restarts
///
/// Writes go to a sibling temp file which is then renamed over the slot, so
/// a crash mid-write leaves the previous edit intact.
#[derive(Debug)]
pub struct FilePendingStore {
    path: PathBuf,
}

impl FilePendingStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl PendingStore for FilePendingStore {
    fn load(&self) -> Result<Option<PendingWrite>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match serde_json::from_slice(&bytes) {
            Ok(write) => Ok(Some(write)),
            Err(e) => {
                warn!("Discarding unreadable pending write {:?}: {}", self.path, e);
                Ok(None)
            }
        }
    }

    fn save(&mut self, write: &PendingWrite) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(write)
            .map_err(|e| SyncError::TransientIo(format!("serialize pending write: {}", e)))?;
        let temp = self.temp_path();
        std::fs::write(&temp, bytes)?;
        std::fs::rename(&temp, &self.path)?;
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn write(theme: &str, updated_at: i64) -> PendingWrite {
        let mut document = Document::new();
        document.set_setting("theme", json!(theme));
        PendingWrite {
            document,
            updated_at,
            base_version: Some(2),
        }
    }

    #[test]
    fn test_file_slot_keeps_only_latest() {
        let temp = TempDir::new().unwrap();
        let mut store = FilePendingStore::new(temp.path().join("state/pending.json"));
        assert_eq!(store.load().unwrap(), None);

        store.save(&write("dark", 1)).unwrap();
        store.save(&write("light", 2)).unwrap();
        assert_eq!(store.load().unwrap(), Some(write("light", 2)));
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_file_slot_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pending.json");
        FilePendingStore::new(&path).save(&write("dark", 5)).unwrap();
        assert_eq!(
            FilePendingStore::new(&path).load().unwrap(),
            Some(write("dark", 5))
        );
    }

    #[test]
    fn test_clear_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mut store = FilePendingStore::new(temp.path().join("pending.json"));
        store.save(&write("dark", 1)).unwrap();
        store.clear().unwrap();
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }

    #[test]
    fn test_corrupt_slot_is_discarded() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("pending.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert_eq!(FilePendingStore::new(&path).load().unwrap(), None);
    }

    #[test]
    fn test_memory_slot() {
        let mut store = MemoryPendingStore::new();
        store.save(&write("dark", 1)).unwrap();
        store.save(&write("light", 2)).unwrap();
        assert_eq!(store.load().unwrap(), Some(write("light", 2)));
        store.clear().unwrap();
        assert_eq!(store.load().unwrap(), None);
    }
}
