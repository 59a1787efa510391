// Storage schema and database management

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Whether to enable WAL mode
    pub wal_enabled: bool,

    /// Cache size in pages
    pub cache_size_pages: Option<i64>,

    /// How long to wait on a lock held by another process
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_enabled: true,
            cache_size_pages: Some(2000),
            busy_timeout_ms: 5_000,
        }
    }
}

/// Key-value storage partitioned into named buckets, over one SQLite table
pub struct Storage {
    conn: Connection,
    config: StorageConfig,
}

impl Storage {
    /// Open storage with default config
    pub fn open<P: AsRef<Path>>(path: P) -> SqliteResult<Self> {
        Self::open_with_config(path, StorageConfig::default())
    }

    /// Open storage with custom config
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: StorageConfig) -> SqliteResult<Self> {
        let conn = Connection::open(path)?;

        conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        // Enable WAL mode for better concurrency
        if config.wal_enabled {
            conn.pragma_update(None, "journal_mode", "WAL")?;
        }

        if let Some(cache_size) = config.cache_size_pages {
            conn.pragma_update(None, "cache_size", cache_size)?;
        }

        let mut storage = Self { conn, config };
        storage.initialize_schema()?;

        Ok(storage)
    }

    fn initialize_schema(&mut self) -> SqliteResult<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS buckets (
                bucket TEXT NOT NULL,
                key TEXT NOT NULL,
                value BLOB NOT NULL,
                PRIMARY KEY (bucket, key)
            )",
            [],
        )?;

        Ok(())
    }

    /// Insert or replace `key` in `bucket` inside a single transaction.
    pub fn bucket_put(&mut self, bucket: &str, key: &str, value: &[u8]) -> SqliteResult<()> {
        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO buckets (bucket, key, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(bucket, key) DO UPDATE SET value = excluded.value",
            params![bucket, key, value],
        )?;
        tx.commit()
    }

    /// Value stored under `key`, if any.
    pub fn bucket_get(&self, bucket: &str, key: &str) -> SqliteResult<Option<Vec<u8>>> {
        self.conn
            .query_row(
                "SELECT value FROM buckets WHERE bucket = ?1 AND key = ?2",
                params![bucket, key],
                |row| row.get(0),
            )
            .optional()
    }

    /// Remove `key`; returns whether it existed.
    pub fn bucket_delete(&mut self, bucket: &str, key: &str) -> SqliteResult<bool> {
        let tx = self.conn.transaction()?;
        let removed = tx.execute(
            "DELETE FROM buckets WHERE bucket = ?1 AND key = ?2",
            params![bucket, key],
        )?;
        tx.commit()?;
        Ok(removed > 0)
    }

    /// Keys in `bucket`, sorted.
    pub fn bucket_keys(&self, bucket: &str) -> SqliteResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM buckets WHERE bucket = ?1 ORDER BY key")?;
        let keys = stmt
            .query_map(params![bucket], |row| row.get(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(keys)
    }

    /// Get the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Close the storage connection and ensure WAL is checkpointed
    ///
    /// Checkpointing releases the `-wal` and `-shm` side files so the store is a
    /// single file again once the command ends.
    pub fn close(self) -> SqliteResult<()> {
        if self.config.wal_enabled {
            self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")?;
        }
        self.conn.close().map_err(|(_, e)| e)
    }
}
