use crate::types::{Scope, SettingsRecord};
use rusqlite::Result;

/// Storage abstraction for encrypted settings records
///
/// This trait defines the persistence layer for the versioned store.
/// Implementations hold exactly one record per scope.
///
/// Key design principles:
/// - Storage does NOT decide whether a write is accepted (Server does)
/// - Records arrive already encrypted; storage never sees plaintext
/// - `store_record` replaces the whole record atomically or not at all
/// - No knowledge of patches, subscribers or authentication
pub trait Storage: Send + Sync {
    /// Load the record for a scope, if one was ever written
    fn load_record(&self, scope: &Scope) -> Result<Option<SettingsRecord>>;

    /// Persist a record, replacing any previous record for the scope
    fn store_record(&self, scope: &Scope, record: &SettingsRecord) -> Result<()>;

    /// All scopes that have a record
    /// Called once at Server startup to verify every record decrypts
    fn scopes(&self) -> Result<Vec<Scope>>;
}
