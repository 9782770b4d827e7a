//! SQLite connection for the chunk store
//!
//! One connection behind a mutex. Every transaction runs with the connection
//! held, so record, tag, term and link writes are serialized store-wide.

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::sync::Arc;

use super::migrations::run_migrations;
use crate::config::{StorageConfig, StorageMode};
use crate::error::Result;

/// Path fragments of folders that sync files behind SQLite's back
const SYNCED_FOLDERS: &[&str] = &["dropbox", "onedrive", "icloud", "google drive"];

fn pragmas(mode: StorageMode) -> &'static str {
    match mode {
        // WAL: readers never block the single writer
        StorageMode::Local => {
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=30000;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;"
        }
        // Rollback journal keeps the store a single file
        StorageMode::CloudSafe => {
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=FULL;
             PRAGMA busy_timeout=30000;
             PRAGMA temp_store=MEMORY;
             PRAGMA foreign_keys=ON;"
        }
    }
}

/// Shared handle to the chunk database
#[derive(Clone)]
pub struct Storage {
    config: StorageConfig,
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open or create the database and bring its schema up to date
    pub fn open(config: StorageConfig) -> Result<Self> {
        let conn = if config.db_path == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(&config.db_path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            Connection::open_with_flags(
                &config.db_path,
                OpenFlags::SQLITE_OPEN_READ_WRITE
                    | OpenFlags::SQLITE_OPEN_CREATE
                    | OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?
        };
        conn.execute_batch(pragmas(config.storage_mode))?;
        run_migrations(&conn)?;

        if in_synced_folder(&config) {
            tracing::warn!(
                db_path = %config.db_path,
                "Chunk database is in a synced folder; set MERIDIAN_STORAGE_MODE=cloud-safe"
            );
        }

        Ok(Self {
            config,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Ephemeral database, gone when the last handle drops
    pub fn open_in_memory() -> Result<Self> {
        Self::open(StorageConfig::default())
    }

    /// Run `f` with the connection held
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Run `f` inside a transaction; any error rolls it back
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Highest migration applied to this database
    pub fn schema_version(&self) -> Result<i32> {
        self.with_connection(|conn| {
            Ok(conn.query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )?)
        })
    }

    pub fn storage_mode(&self) -> StorageMode {
        self.config.storage_mode
    }

    pub fn db_path(&self) -> &str {
        &self.config.db_path
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }
}

fn in_synced_folder(config: &StorageConfig) -> bool {
    let path = config.db_path.to_lowercase();
    config.storage_mode == StorageMode::Local && SYNCED_FOLDERS.iter().any(|f| path.contains(f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SCHEMA_VERSION;

    #[test]
    fn test_open_in_memory() {
        let storage = Storage::open_in_memory().unwrap();
        assert_eq!(storage.db_path(), ":memory:");
        assert_eq!(storage.storage_mode(), StorageMode::Local);
        assert_eq!(storage.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_reopen_on_disk_keeps_schema() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("nested").join("chunks.db");
        let config = StorageConfig {
            db_path: db_path.to_string_lossy().to_string(),
            storage_mode: StorageMode::CloudSafe,
            ..Default::default()
        };
        Storage::open(config.clone()).unwrap();
        assert!(db_path.exists());

        let reopened = Storage::open(config).unwrap();
        assert_eq!(reopened.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let storage = Storage::open_in_memory().unwrap();
        let result: Result<()> = storage.with_transaction(|conn| {
            conn.execute(
                "INSERT INTO chunks (id, partition, record, chunk_type, created_at, created_ts)
                 VALUES ('chunk-x', '2026-03', '{}', 'fact', '2026-03-02T09:00:00Z', 0)",
                [],
            )?;
            Err(crate::error::MeridianError::Internal("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = storage
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM chunks", [], |r| r.get(0))?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_synced_folder_detection() {
        let config = StorageConfig {
            db_path: "/Users/test/Dropbox/chunks.db".to_string(),
            ..Default::default()
        };
        assert!(in_synced_folder(&config));

        let config = StorageConfig {
            storage_mode: StorageMode::CloudSafe,
            ..config
        };
        assert!(!in_synced_folder(&config));
    }
}
