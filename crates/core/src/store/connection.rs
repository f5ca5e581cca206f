//! Opening a shard database with pragma configuration.
//!
//! This module handles opening the SQLite file, applying the pragmas every
//! shard runs with (exclusive locking, WAL), running migrations, and loading
//! the aggregate counters.

use std::path::Path;

use tokio_rusqlite::Connection;

use super::{ShardId, ShardStore, StoreStatus, migrations, status};
use crate::Error;
use crate::config::StoreConfig;

fn pragmas(config: &StoreConfig) -> String {
    let synchronous = if config.synchronous_off { "OFF" } else { "NORMAL" };
    format!(
        "PRAGMA locking_mode=EXCLUSIVE;
         PRAGMA journal_mode=WAL;
         PRAGMA synchronous={synchronous};
         PRAGMA temp_store=MEMORY;
         PRAGMA foreign_keys=ON;
         PRAGMA wal_autocheckpoint={};",
        config.force_checkpoint_threshold_pages
    )
}

impl ShardStore {
    /// Open (or create) the database at `path`.
    ///
    /// Incompatible databases are razed and recreated. Returns the store and
    /// its aggregate status.
    pub async fn open(path: impl AsRef<Path>, shard_id: ShardId, config: StoreConfig) -> Result<(Self, StoreStatus), Error> {
        let path = path.as_ref();
        let conn = Connection::open(path).await.map_err(|e| Error::FailedToOpenDatabase(e.to_string()))?;

        let batch = pragmas(&config);
        conn.call(move |conn| -> Result<(), Error> {
            conn.execute_batch(&batch).map_err(|e| Error::FailedToOpenDatabase(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(Error::from)?;

        migrations::run(&conn).await?;

        let (status, recovered) = conn
            .call(move |conn| -> Result<(StoreStatus, bool), Error> { status::initialize(conn) })
            .await
            .map_err(Error::from)?;
        if recovered {
            tracing::warn!(shard_id, "Stored counters were out of range and have been recalculated");
        }

        Ok((Self { conn, shard_id, config }, status))
    }

    /// Drop every table and index, leaving an empty file.
    ///
    /// Used after a catastrophic failure; the shard stays closed afterwards.
    pub async fn raze(&self) -> Result<(), Error> {
        self.conn
            .call(|conn| -> Result<(), Error> {
                migrations::raze(conn)?;
                Ok(())
            })
            .await
            .map_err(Error::from)
    }

    /// Checkpoint the WAL if it grew beyond the idle threshold.
    ///
    /// Returns true when a checkpoint ran.
    pub async fn maybe_run_checkpoint(&self) -> Result<bool, Error> {
        let threshold = self.config.idle_checkpoint_threshold_pages;
        self.read("maybe_run_checkpoint", move |conn, _| {
            let wal_pages: i64 = conn.query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |row| row.get(1))?;
            if wal_pages < threshold {
                return Ok(false);
            }
            let _: (i64, i64, i64) =
                conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
            Ok(true)
        })
        .await
    }

    /// Close the connection, waiting for queued work to finish.
    pub async fn close(self) -> Result<(), Error> {
        self.conn.close().await.map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_creates_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sqldb0");
        let (store, status) = ShardStore::open(&path, 0, StoreConfig::default()).await.unwrap();
        assert!(path.exists());
        assert_eq!(status, StoreStatus::default());
        assert_eq!(store.shard_id(), 0);
    }

    #[tokio::test]
    async fn test_pragmas_applied() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig { force_checkpoint_threshold_pages: 1234, ..Default::default() };
        let (store, _) = ShardStore::open(dir.path().join("sqldb0"), 0, config).await.unwrap();

        let (journal, autocheckpoint): (String, i64) = store
            .conn
            .call(|conn| -> Result<(String, i64), Error> {
                let journal = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
                let auto = conn.query_row("PRAGMA wal_autocheckpoint", [], |row| row.get(0))?;
                Ok((journal, auto))
            })
            .await
            .map_err(Error::from)
            .unwrap();
        assert_eq!(journal.to_lowercase(), "wal");
        assert_eq!(autocheckpoint, 1234);
    }

    #[tokio::test]
    async fn test_checkpoint_below_threshold_is_noop() {
        let dir = TempDir::new().unwrap();
        let config = StoreConfig { idle_checkpoint_threshold_pages: i64::MAX, ..Default::default() };
        let (store, _) = ShardStore::open(dir.path().join("sqldb0"), 0, config).await.unwrap();
        assert!(!store.maybe_run_checkpoint().await.unwrap());
    }

    #[tokio::test]
    async fn test_reopen_keeps_status() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sqldb0");
        {
            let (store, _) = ShardStore::open(&path, 0, StoreConfig::default()).await.unwrap();
            let key = crate::CacheEntryKey::new("persisted");
            store.create_entry(key, chrono::Utc::now(), true).await.result.unwrap();
            store.close().await.unwrap();
        }
        let (_, status) = ShardStore::open(&path, 0, StoreConfig::default()).await.unwrap();
        assert_eq!(status.entry_count, 1);
        assert_eq!(status.total_size, "persisted".len() as i64);
    }
}
