//! Durable per-shard storage of resources and their body blobs.
//!
//! A [`ShardStore`] owns one SQLite database file. Every operation runs as a
//! single closure on the connection's dedicated thread (tokio-rusqlite), so
//! all I/O for a shard is confined to one background context. Mutating
//! operations run inside one transaction and keep the aggregate counters in
//! the `meta` table up to date; see [`status`].

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_rusqlite::{Connection, rusqlite};

use crate::Error;
use crate::config::StoreConfig;
use crate::key::CacheEntryKey;

pub mod blobs;
pub mod connection;
pub mod entries;
pub mod eviction;
pub mod migrations;
pub mod status;

/// Accounting overhead of one resource row, on top of its `bytes_usage`.
pub const STATIC_RESOURCE_SIZE: i64 = 300;

/// Identifier of one resource row. Never reused within a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ResId(pub i64);

impl ResId {
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ResId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type ShardId = u16;

/// Aggregate counters of the live (non-doomed) rows in one shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStatus {
    pub entry_count: i64,
    pub total_size: i64,
}

impl StoreStatus {
    /// `total_size` plus the static per-row overhead of every entry.
    pub fn estimated_disk_usage(&self) -> i64 {
        self.entry_count.saturating_mul(STATIC_RESOURCE_SIZE).saturating_add(self.total_size)
    }
}

/// Resource metadata loaded by open/create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    pub res_id: ResId,
    pub last_used: DateTime<Utc>,
    pub body_end: i64,
    pub head: Bytes,
    /// False when the row was created by this call.
    pub opened: bool,
}

/// A live entry returned while iterating a shard.
#[derive(Debug, Clone)]
pub struct EntryInfoWithKey {
    pub key: CacheEntryKey,
    pub info: EntryInfo,
}

/// First contiguous stored sub-range of a requested body range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeResult {
    pub start: i64,
    pub len: i64,
}

/// A live row proposed for eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub res_id: ResId,
    pub shard_id: ShardId,
    pub bytes_usage: i64,
    pub last_used: DateTime<Utc>,
}

/// A row removed by a delete or an eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedEntry {
    pub res_id: ResId,
    pub key_hash: i32,
}

/// One row of the startup scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexRow {
    pub res_id: ResId,
    pub key_hash: i32,
    pub doomed: bool,
}

/// Result of a mutating operation together with the store status read back
/// after it finished. `status` is `None` when the counters could not be read.
#[derive(Debug)]
pub struct WithStatus<T> {
    pub result: Result<T, Error>,
    pub status: Option<StoreStatus>,
}

/// Answers whether the process is currently idle.
///
/// Idle-time eviction consults it before selecting candidates and before each
/// deletion.
pub trait IdleProbe: Send + Sync + 'static {
    fn is_idle(&self) -> bool;
}

/// Probe that always reports idle.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysIdle;

impl IdleProbe for AlwaysIdle {
    fn is_idle(&self) -> bool {
        true
    }
}

/// Handle to one shard database.
#[derive(Clone, Debug)]
pub struct ShardStore {
    pub(crate) conn: Connection,
    shard_id: ShardId,
    config: StoreConfig,
}

impl ShardStore {
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Run a read-only operation on the shard thread.
    pub(crate) async fn read<T, F>(&self, op: &'static str, f: F) -> Result<T, Error>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection, &mut bool) -> Result<T, Error> + Send + 'static,
    {
        let shard_id = self.shard_id;
        let strict = self.config.strict_corruption_check;
        self.conn
            .call(move |conn| -> Result<T, Error> {
                let mut corruption_detected = false;
                let result = f(conn, &mut corruption_detected);
                report_corruption(shard_id, op, strict, corruption_detected, result.as_ref().err());
                result
            })
            .await
            .map_err(Error::from)
    }

    /// Run a mutating operation on the shard thread.
    ///
    /// When the operation fails with a corruption signal its transaction has
    /// already rolled back; the counters are then recomputed from the
    /// resources table in a fresh transaction before the status is read back.
    pub(crate) async fn write<T, F>(&self, op: &'static str, f: F) -> WithStatus<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection, &mut bool) -> Result<T, Error> + Send + 'static,
    {
        let shard_id = self.shard_id;
        let strict = self.config.strict_corruption_check;
        let outcome = self
            .conn
            .call(move |conn| -> Result<WithStatus<T>, Error> {
                let mut corruption_detected = false;
                let result = f(conn, &mut corruption_detected);
                report_corruption(shard_id, op, strict, corruption_detected, result.as_ref().err());

                if result.as_ref().is_err_and(Error::is_corruption) {
                    if let Err(e) = conn
                        .transaction()
                        .map_err(|_| Error::FailedToStartTransaction)
                        .and_then(status::recalculate_status_and_commit)
                    {
                        tracing::warn!(shard_id, op, error = %e, "Failed to recalculate store status");
                    }
                }

                let status = status::load_status(conn).ok();
                Ok(WithStatus { result, status })
            })
            .await;

        match outcome {
            Ok(with_status) => with_status,
            Err(e) => WithStatus { result: Err(Error::from(e)), status: None },
        }
    }
}

fn report_corruption(shard_id: ShardId, op: &'static str, strict: bool, detected: bool, error: Option<&Error>) {
    let corrupted = detected || error.is_some_and(Error::is_corruption);
    if !corrupted {
        return;
    }
    match error {
        Some(e) => tracing::warn!(shard_id, op, error = %e, "Corruption detected"),
        None => tracing::warn!(shard_id, op, "Corruption detected and recovered"),
    }
    if strict {
        panic!("corruption detected in shard {shard_id} during {op}");
    }
}

/// Microseconds since the Unix epoch, as stored in `last_used`.
pub(crate) fn to_micros(time: DateTime<Utc>) -> i64 {
    time.timestamp_micros()
}

pub(crate) fn from_micros(micros: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_micros(micros).ok_or_else(|| Error::InvalidData(format!("bad timestamp {micros}")))
}

/// Half-open `[from, to)` bounds in stored units. `MIN_UTC`/`MAX_UTC` are
/// unbounded.
pub(crate) fn time_bounds(from: DateTime<Utc>, to: DateTime<Utc>) -> (i64, i64) {
    let lower = if from == DateTime::<Utc>::MIN_UTC { i64::MIN } else { to_micros(from) };
    let upper = if to == DateTime::<Utc>::MAX_UTC { i64::MAX } else { to_micros(to) };
    (lower, upper)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use tempfile::TempDir;

    pub async fn open_store(dir: &TempDir) -> (ShardStore, StoreStatus) {
        open_store_with(dir, StoreConfig::default()).await
    }

    pub async fn open_store_with(dir: &TempDir, config: StoreConfig) -> (ShardStore, StoreStatus) {
        ShardStore::open(dir.path().join("sqldb0"), 0, config).await.unwrap()
    }

    pub fn now() -> DateTime<Utc> {
        Utc::now()
    }
}
