use crate::crypto::SettingsCipher;
use crate::error::{Result, SyncError};
use crate::storage::Storage;
use crate::types::{Document, Patch, Scope, SettingsRecord, Snapshot, VersionStamp};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

/// Outcome of a whole-document write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// Stored as the given version
    Accepted(VersionStamp),
    /// Rejected by the version/timestamp guard; carries the current record
    Conflict(Snapshot),
}

/// Outcome of applying one patch to a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The document changed and was persisted as a new version
    Applied(VersionStamp),
    /// The merge was a no-op; nothing was persisted
    Unchanged(VersionStamp),
}

impl PatchOutcome {
    pub fn stamp(&self) -> VersionStamp {
        match self {
            PatchOutcome::Applied(stamp) | PatchOutcome::Unchanged(stamp) => *stamp,
        }
    }
}

/// Versioned encrypted document store
///
/// Owns the cipher and enforces the compare-and-set rule. Every write to a
/// scope, whole-document or patch, runs under that scope's lock so the
/// read/decide/persist sequence is atomic. Writes to different scopes do not
/// contend. Generic over Storage to allow testing with different backends.
pub struct Server<S: Storage> {
    storage: Arc<S>,
    cipher: SettingsCipher,
    // Entries live only while some write holds or waits on them
    scope_locks: StdMutex<HashMap<Scope, Arc<Mutex<()>>>>,
}

impl<S: Storage> Server<S> {
    /// Create a new server with the given storage
    ///
    /// Decrypts every stored record once; a record that does not open under
    /// this key refuses startup.
    pub async fn new(storage: Arc<S>, cipher: SettingsCipher) -> Result<Self> {
        let scopes = storage.scopes()?;
        for scope in &scopes {
            let record = storage.load_record(scope)?.ok_or_else(|| {
                SyncError::TransientIo(format!("record for {} vanished during startup", scope))
            })?;
            cipher.open(scope, &record)?;
        }
        info!("Verified {} stored scope(s)", scopes.len());

        Ok(Self {
            storage,
            cipher,
            scope_locks: StdMutex::new(HashMap::new()),
        })
    }

    /// Current document for a scope, or None if it was never written
    pub async fn read(&self, scope: &Scope) -> Result<Option<Snapshot>> {
        match self.storage.load_record(scope)? {
            Some(record) => Ok(Some(self.open(scope, &record)?)),
            None => Ok(None),
        }
    }

    /// Replace a scope's document under the compare-and-set guard
    ///
    /// With no existing record the write is always accepted as version 1.
    /// Otherwise it is accepted only if `proposed_updated_at` does not
    /// regress and `expected_version`, when given, is not behind.
    pub async fn write(
        &self,
        scope: &Scope,
        document: &Document,
        expected_version: Option<u64>,
        proposed_updated_at: i64,
    ) -> Result<WriteOutcome> {
        self.write_and_notify(scope, document, expected_version, proposed_updated_at, |_| {})
            .await
    }

    /// Like `write`, calling `notify` with the new stamp before the scope
    /// lock is released so notifications leave in version order
    pub async fn write_and_notify(
        &self,
        scope: &Scope,
        document: &Document,
        expected_version: Option<u64>,
        proposed_updated_at: i64,
        notify: impl FnOnce(VersionStamp),
    ) -> Result<WriteOutcome> {
        let lock = self.scope_lock(scope);
        let outcome = {
            let _guard = lock.lock().await;
            let outcome = self.write_locked(scope, document, expected_version, proposed_updated_at);
            if let Ok(WriteOutcome::Accepted(stamp)) = &outcome {
                notify(*stamp);
            }
            outcome
        };
        self.release_scope_lock(scope, lock);
        outcome
    }

    /// Merge one validated patch into a scope's document
    ///
    /// The new record takes the next version and an updatedAt that never
    /// regresses, advanced to the patch clock when that is later.
    pub async fn apply_patch(&self, scope: &Scope, patch: &Patch) -> Result<PatchOutcome> {
        self.apply_patch_and_notify(scope, patch, |_| {}).await
    }

    /// Like `apply_patch`, calling `notify` under the scope lock when the
    /// patch produced a new version
    pub async fn apply_patch_and_notify(
        &self,
        scope: &Scope,
        patch: &Patch,
        notify: impl FnOnce(VersionStamp),
    ) -> Result<PatchOutcome> {
        let lock = self.scope_lock(scope);
        let outcome = {
            let _guard = lock.lock().await;
            let outcome = self.apply_patch_locked(scope, patch);
            if let Ok(PatchOutcome::Applied(stamp)) = &outcome {
                notify(*stamp);
            }
            outcome
        };
        self.release_scope_lock(scope, lock);
        outcome
    }

    /// Number of scopes with a write in flight
    pub fn active_scope_locks(&self) -> usize {
        self.locks().len()
    }

    fn write_locked(
        &self,
        scope: &Scope,
        document: &Document,
        expected_version: Option<u64>,
        proposed_updated_at: i64,
    ) -> Result<WriteOutcome> {
        let current = self.storage.load_record(scope)?;
        if let Some(record) = &current {
            let timestamp_ok = proposed_updated_at >= record.updated_at;
            let version_ok = expected_version.is_none_or(|v| v >= record.version);
            if !(timestamp_ok && version_ok) {
                warn!(
                    "Conflict on {}: stored v{} at {}, proposed v{:?} at {}",
                    scope, record.version, record.updated_at, expected_version, proposed_updated_at
                );
                return Ok(WriteOutcome::Conflict(self.open(scope, record)?));
            }
        }

        let stamp = self.persist(scope, document, current.as_ref(), proposed_updated_at)?;
        Ok(WriteOutcome::Accepted(stamp))
    }

    fn apply_patch_locked(&self, scope: &Scope, patch: &Patch) -> Result<PatchOutcome> {
        let current = self.storage.load_record(scope)?;
        let (document, stamp) = match &current {
            Some(record) => (self.cipher.open(scope, record)?, record.stamp()),
            None => (
                Document::new(),
                VersionStamp {
                    version: 0,
                    updated_at: 0,
                },
            ),
        };

        let merged = document.apply_patch(patch);
        if merged == document {
            debug!(
                "Patch {} {}/{} on {} changed nothing",
                patch.action.name(),
                patch.collection,
                patch.item_id,
                scope
            );
            return Ok(PatchOutcome::Unchanged(stamp));
        }

        let updated_at = stamp.updated_at.max(patch.clock.timestamp);
        let stamp = self.persist(scope, &merged, current.as_ref(), updated_at)?;
        Ok(PatchOutcome::Applied(stamp))
    }

    /// Caller must hold the scope lock
    fn persist(
        &self,
        scope: &Scope,
        document: &Document,
        current: Option<&SettingsRecord>,
        updated_at: i64,
    ) -> Result<VersionStamp> {
        let version = current.map_or(1, |record| record.version + 1);
        let record = self.cipher.seal(scope, document, version, updated_at)?;
        trace!("calling storage for {} ({} bytes)", scope, record.ciphertext.len());
        self.storage.store_record(scope, &record)?;

        info!("Stored {} at v{} updatedAt={}", scope, version, updated_at);
        Ok(record.stamp())
    }

    fn open(&self, scope: &Scope, record: &SettingsRecord) -> Result<Snapshot> {
        Ok(Snapshot {
            document: self.cipher.open(scope, record)?,
            version: record.version,
            updated_at: record.updated_at,
        })
    }

    fn scope_lock(&self, scope: &Scope) -> Arc<Mutex<()>> {
        Arc::clone(self.locks().entry(scope.clone()).or_default())
    }

    /// Drop the map entry once no other write holds or waits on it
    fn release_scope_lock(&self, scope: &Scope, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks();
        // One reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(scope);
        }
    }

    // Only map lookups run under this lock, so poisoning cannot leave it
    // half-updated
    fn locks(&self) -> MutexGuard<'_, HashMap<Scope, Arc<Mutex<()>>>> {
        self.scope_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
