use crate::config::StorageConfig;
use crate::storage::Storage;
use crate::types::{Scope, SettingsRecord};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Result, params};
use std::path::Path;

pub type DbPool = Pool<SqliteConnectionManager>;

/// SQLite implementation of the Storage trait
pub struct SqliteStorage {
    pool: DbPool,
}

impl SqliteStorage {
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let cache_size = config.sqlite_cache_size;
        let busy_timeout = config.sqlite_busy_timeout;
        let path_ref = path.as_ref();

        // Initialize schema with a single connection first
        {
            let conn = rusqlite::Connection::open(path_ref)?;
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;

            Self::create_schema(&conn)?;
        }

        // Now create the pool - schema already exists
        let manager = SqliteConnectionManager::file(path_ref).with_init(move |conn| {
            conn.pragma_update(None, "cache_size", cache_size)?;
            conn.pragma_update(None, "busy_timeout", busy_timeout)?;
            conn.pragma_update(None, "journal_mode", "WAL")?;
            conn.pragma_update(None, "synchronous", "NORMAL")?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(5) // Writes are serialized per scope by the server, reads run alongside
            .min_idle(Some(1))
            .build(manager)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;

        Ok(SqliteStorage { pool })
    }

    fn create_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- One encrypted document per scope
            CREATE TABLE IF NOT EXISTS settings (
                scope TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                nonce BLOB NOT NULL,       -- 12-byte ChaCha20-Poly1305 nonce
                auth_tag BLOB NOT NULL,    -- 16-byte Poly1305 tag
                ciphertext BLOB NOT NULL
            ) WITHOUT ROWID;
            "#,
        )?;

        Ok(())
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))
    }
}

impl Storage for SqliteStorage {
    fn load_record(&self, scope: &Scope) -> Result<Option<SettingsRecord>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT version, updated_at, nonce, auth_tag, ciphertext FROM settings WHERE scope = ?1",
            [scope.to_string()],
            |row| {
                Ok(SettingsRecord {
                    version: row.get::<_, i64>(0)? as u64,
                    updated_at: row.get(1)?,
                    nonce: row.get(2)?,
                    auth_tag: row.get(3)?,
                    ciphertext: row.get(4)?,
                })
            },
        )
        .optional()
    }

    fn store_record(&self, scope: &Scope, record: &SettingsRecord) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            INSERT INTO settings (scope, version, updated_at, nonce, auth_tag, ciphertext)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(scope) DO UPDATE SET
                version = excluded.version,
                updated_at = excluded.updated_at,
                nonce = excluded.nonce,
                auth_tag = excluded.auth_tag,
                ciphertext = excluded.ciphertext
            "#,
            params![
                scope.to_string(),
                record.version as i64,
                record.updated_at,
                record.nonce,
                record.auth_tag,
                record.ciphertext,
            ],
        )?;
        tx.commit()
    }

    fn scopes(&self) -> Result<Vec<Scope>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT scope FROM settings ORDER BY scope")?;
        let rows = stmt.query_map([], |row| {
            let raw: String = row.get(0)?;
            raw.parse::<Scope>()
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
        })?;
        let scopes = rows.collect::<Result<Vec<_>>>()?;
        Ok(scopes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(temp: &TempDir) -> SqliteStorage {
        let config = StorageConfig {
            sqlite_cache_size: 1000,
            sqlite_busy_timeout: 5000,
        };
        SqliteStorage::open(temp.path().join("settings.db"), &config).unwrap()
    }

    fn record(version: u64, updated_at: i64) -> SettingsRecord {
        SettingsRecord {
            version,
            updated_at,
            ciphertext: vec![1, 2, 3],
            nonce: vec![0; 12],
            auth_tag: vec![9; 16],
        }
    }

    #[test]
    fn test_missing_scope_is_none() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);
        assert_eq!(storage.load_record(&Scope::Public).unwrap(), None);
        assert!(storage.scopes().unwrap().is_empty());
    }

    #[test]
    fn test_store_replaces_whole_record() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);

        storage.store_record(&Scope::Public, &record(1, 10)).unwrap();
        let mut second = record(2, 20);
        second.ciphertext = vec![7; 40];
        storage.store_record(&Scope::Public, &second).unwrap();

        assert_eq!(storage.load_record(&Scope::Public).unwrap(), Some(second));
    }

    #[test]
    fn test_scopes_are_isolated() {
        let temp = TempDir::new().unwrap();
        let storage = open(&temp);

        storage.store_record(&Scope::Public, &record(1, 10)).unwrap();
        storage.store_record(&Scope::owner("7"), &record(5, 50)).unwrap();

        assert_eq!(storage.load_record(&Scope::owner("7")).unwrap().unwrap().version, 5);
        assert_eq!(storage.load_record(&Scope::Public).unwrap().unwrap().version, 1);
        assert_eq!(
            storage.scopes().unwrap(),
            vec![Scope::owner("7"), Scope::Public]
        );
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp = TempDir::new().unwrap();
        open(&temp).store_record(&Scope::Public, &record(3, 30)).unwrap();
        assert_eq!(
            open(&temp).load_record(&Scope::Public).unwrap(),
            Some(record(3, 30))
        );
    }
}
