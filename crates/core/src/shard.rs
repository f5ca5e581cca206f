//! Asynchronous facade over one [`ShardStore`].
//!
//! A [`Shard`] keeps the shard's [`InMemoryIndex`] in step with every
//! mutation and holds a snapshot of the store status so that size and count
//! queries never need a database round-trip. Mutations issued while the
//! index is still loading are journaled and replayed once the startup scan
//! finishes.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::Error;
use crate::config::StoreConfig;
use crate::eviction::EvictionCoordinator;
use crate::index::InMemoryIndex;
use crate::key::{CacheEntryKey, KeyHash};
use crate::store::eviction::EvictedEntries;
use crate::store::{
    DeletedEntry, EntryInfo, EntryInfoWithKey, IdleProbe, RangeResult, ResId, ShardId, ShardStore, StoreStatus,
    WithStatus,
};

/// File name of a shard database inside the cache directory.
pub fn database_file_name(shard_id: ShardId) -> String {
    format!("sqldb{shard_id}")
}

/// What the in-memory index knows about a key hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup {
    NotYetLoaded,
    HashPresent,
    HashAbsent,
}

#[derive(Debug, Clone, Copy)]
enum IndexChange {
    Insert(i32, ResId),
    Remove(i32, ResId),
    Clear,
}

enum IndexState {
    /// Startup scan in flight; changes are journaled.
    Loading(Vec<IndexChange>),
    Loaded(InMemoryIndex),
    /// The scan failed or the shard was closed. Lookups never short-circuit.
    Unavailable,
}

/// Returns false when a removal did not find its pair.
fn apply_change(index: &mut InMemoryIndex, change: IndexChange) -> bool {
    match change {
        IndexChange::Insert(hash, res_id) => {
            index.insert(hash, res_id);
            true
        }
        IndexChange::Remove(hash, res_id) => index.remove(hash, res_id),
        IndexChange::Clear => {
            *index = InMemoryIndex::new();
            true
        }
    }
}

/// Point-in-time statistics of one shard.
#[derive(Debug, Clone, Serialize)]
pub struct ShardStats {
    pub shard_id: ShardId,
    pub entry_count: i64,
    pub total_size: i64,
    /// `None` until the index has loaded.
    pub index_len: Option<usize>,
    pub index_inconsistencies: u64,
    /// Size of the database file when the shard was opened.
    pub database_file_size: u64,
    pub closed: bool,
}

pub struct Shard {
    store: ShardStore,
    status: Mutex<StoreStatus>,
    index: Mutex<IndexState>,
    index_loaded: watch::Sender<bool>,
    poisoned: AtomicBool,
    index_inconsistencies: AtomicU64,
    database_file_size: u64,
}

impl Shard {
    /// Open `sqldb<shard_id>` inside `cache_dir`. The index is not loaded;
    /// call [`Shard::load_index`] afterwards.
    pub async fn open(cache_dir: &Path, shard_id: ShardId, config: StoreConfig) -> Result<Self, Error> {
        let path = cache_dir.join(database_file_name(shard_id));
        let (store, status) = ShardStore::open(&path, shard_id, config).await?;
        let database_file_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);

        tracing::info!(
            shard_id,
            entry_count = status.entry_count,
            total_size = status.total_size,
            database_file_size,
            "Shard initialized"
        );

        let (index_loaded, _) = watch::channel(false);
        Ok(Self {
            store,
            status: Mutex::new(status),
            index: Mutex::new(IndexState::Loading(Vec::new())),
            index_loaded,
            poisoned: AtomicBool::new(false),
            index_inconsistencies: AtomicU64::new(0),
            database_file_size,
        })
    }

    pub fn shard_id(&self) -> ShardId {
        self.store.shard_id()
    }

    /// Last status reported by the store.
    pub fn status(&self) -> StoreStatus {
        *self.status.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.poisoned.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ShardStats {
        let status = self.status();
        let index_len = match &*self.index.lock() {
            IndexState::Loaded(index) => Some(index.len()),
            _ => None,
        };
        ShardStats {
            shard_id: self.shard_id(),
            entry_count: status.entry_count,
            total_size: status.total_size,
            index_len,
            index_inconsistencies: self.index_inconsistencies.load(Ordering::Relaxed),
            database_file_size: self.database_file_size,
            closed: self.is_closed(),
        }
    }

    fn check_open(&self) -> Result<(), Error> {
        if self.is_closed() { Err(Error::DatabaseClosed) } else { Ok(()) }
    }

    async fn settle<T>(&self, result: Result<T, Error>) -> Result<T, Error> {
        match &result {
            Err(e) if e.is_catastrophic() => self.poison(e).await,
            _ => {}
        }
        result
    }

    async fn settle_with_status<T>(&self, out: WithStatus<T>) -> Result<T, Error> {
        if let Some(status) = out.status {
            *self.status.lock() = status;
        }
        self.settle(out.result).await
    }

    /// Close the shard after an unrecoverable database error. Its tables are
    /// razed so the next startup begins from an empty store.
    async fn poison(&self, error: &Error) {
        if self.poisoned.swap(true, Ordering::AcqRel) {
            return;
        }
        let shard_id = self.shard_id();
        tracing::warn!(shard_id, error = %error, "Catastrophic database error, closing shard");
        if let Err(e) = self.store.raze().await {
            tracing::warn!(shard_id, error = %e, "Failed to raze shard database");
        }
        *self.status.lock() = StoreStatus::default();
        *self.index.lock() = IndexState::Unavailable;
        self.index_loaded.send_replace(true);
    }

    fn record(&self, change: IndexChange) {
        let consistent = match &mut *self.index.lock() {
            IndexState::Loading(journal) => {
                journal.push(change);
                true
            }
            IndexState::Loaded(index) => apply_change(index, change),
            IndexState::Unavailable => true,
        };
        if !consistent {
            self.note_inconsistency(change);
        }
    }

    fn record_deleted(&self, deleted: &[DeletedEntry]) {
        for entry in deleted {
            self.record(IndexChange::Remove(entry.key_hash, entry.res_id));
        }
    }

    fn note_inconsistency(&self, change: IndexChange) {
        let total = self.index_inconsistencies.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(shard_id = self.shard_id(), ?change, total, "In-memory index out of step with database");
    }

    pub fn index_lookup(&self, hash: KeyHash) -> IndexLookup {
        match &*self.index.lock() {
            IndexState::Loaded(index) if index.contains(hash.value()) => IndexLookup::HashPresent,
            IndexState::Loaded(_) => IndexLookup::HashAbsent,
            _ => IndexLookup::NotYetLoaded,
        }
    }

    /// Scan the resources table into the in-memory index.
    ///
    /// Returns the rows left doomed by an earlier run; the caller deletes
    /// them later with [`Shard::delete_doomed_entries`].
    pub async fn load_index(&self) -> Result<Vec<ResId>, Error> {
        self.check_open()?;
        let shard_id = self.shard_id();
        let rows = match self.store.load_index_rows().await {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(shard_id, error = %e, "Failed to load in-memory index");
                *self.index.lock() = IndexState::Unavailable;
                self.index_loaded.send_replace(true);
                return self.settle(Err(e)).await;
            }
        };

        let mut index = InMemoryIndex::with_capacity(rows.len());
        let mut doomed = Vec::new();
        for row in rows {
            if row.doomed {
                doomed.push(row.res_id);
            } else {
                index.insert(row.key_hash, row.res_id);
            }
        }

        let len = {
            let mut state = self.index.lock();
            match std::mem::replace(&mut *state, IndexState::Unavailable) {
                IndexState::Loading(journal) => {
                    for change in journal {
                        apply_change(&mut index, change);
                    }
                    let len = index.len();
                    *state = IndexState::Loaded(index);
                    len
                }
                other => {
                    *state = other;
                    0
                }
            }
        };
        self.index_loaded.send_replace(true);
        tracing::info!(shard_id, entries = len, doomed = doomed.len(), "In-memory index loaded");
        Ok(doomed)
    }

    /// Resolves once [`Shard::load_index`] has finished, successfully or not.
    pub async fn wait_for_index_load(&self) {
        let mut loaded = self.index_loaded.subscribe();
        let _ = loaded.wait_for(|loaded| *loaded).await;
    }

    pub async fn open_entry(&self, key: CacheEntryKey) -> Result<Option<EntryInfo>, Error> {
        self.check_open()?;
        if self.index_lookup(key.hash()) == IndexLookup::HashAbsent {
            return Ok(None);
        }
        let result = self.store.open_entry(key).await;
        self.settle(result).await
    }

    pub async fn open_or_create_entry(
        &self, key: CacheEntryKey, creation_time: DateTime<Utc>,
    ) -> Result<EntryInfo, Error> {
        self.check_open()?;
        let hash = key.hash();
        let out = if self.index_lookup(hash) == IndexLookup::HashAbsent {
            self.store.create_entry(key, creation_time, false).await
        } else {
            self.store.open_or_create_entry(key, creation_time).await
        };
        let info = self.settle_with_status(out).await?;
        if !info.opened {
            self.record(IndexChange::Insert(hash.value(), info.res_id));
        }
        Ok(info)
    }

    /// Create a row for `key`. The existence check is skipped when the index
    /// proves no row carries the key's hash.
    pub async fn create_entry(&self, key: CacheEntryKey, creation_time: DateTime<Utc>) -> Result<EntryInfo, Error> {
        self.check_open()?;
        let hash = key.hash();
        let run_existence_check = self.index_lookup(hash) != IndexLookup::HashAbsent;
        let out = self.store.create_entry(key, creation_time, run_existence_check).await;
        let info = self.settle_with_status(out).await?;
        self.record(IndexChange::Insert(hash.value(), info.res_id));
        Ok(info)
    }

    pub async fn doom_entry(&self, hash: KeyHash, res_id: ResId) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.doom_entry(res_id).await;
        self.settle_with_status(out).await?;
        self.record(IndexChange::Remove(hash.value(), res_id));
        Ok(())
    }

    pub async fn delete_doomed_entry(&self, res_id: ResId) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.delete_doomed_entry(res_id).await;
        self.settle_with_status(out).await
    }

    pub async fn delete_doomed_entries(&self, res_ids: Vec<ResId>) -> Result<usize, Error> {
        self.check_open()?;
        let out = self.store.delete_doomed_entries(res_ids).await;
        self.settle_with_status(out).await
    }

    pub async fn delete_live_entry(&self, key: CacheEntryKey) -> Result<(), Error> {
        self.check_open()?;
        if self.index_lookup(key.hash()) == IndexLookup::HashAbsent {
            return Err(Error::NotFound);
        }
        let out = self.store.delete_live_entry(key).await;
        let deleted = self.settle_with_status(out).await?;
        self.record_deleted(&deleted);
        Ok(())
    }

    pub async fn delete_all_entries(&self) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.delete_all_entries().await;
        self.settle_with_status(out).await?;
        self.record(IndexChange::Clear);
        Ok(())
    }

    pub async fn delete_live_entries_between(
        &self, from: DateTime<Utc>, to: DateTime<Utc>, excluded: HashSet<ResId>,
    ) -> Result<usize, Error> {
        self.check_open()?;
        let out = self.store.delete_live_entries_between(from, to, excluded).await;
        let deleted = self.settle_with_status(out).await?;
        self.record_deleted(&deleted);
        Ok(deleted.len())
    }

    pub async fn update_entry_last_used_by_key(&self, key: CacheEntryKey, last_used: DateTime<Utc>) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.update_entry_last_used_by_key(key, last_used).await;
        self.settle_with_status(out).await
    }

    pub async fn update_entry_last_used_by_res_id(&self, res_id: ResId, last_used: DateTime<Utc>) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.update_entry_last_used_by_res_id(res_id, last_used).await;
        self.settle_with_status(out).await
    }

    pub async fn update_entry_header_and_last_used(
        &self, key: CacheEntryKey, res_id: ResId, last_used: DateTime<Utc>, head: Bytes, header_size_delta: i64,
    ) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.update_entry_header_and_last_used(key, res_id, last_used, head, header_size_delta).await;
        self.settle_with_status(out).await
    }

    pub async fn write_entry_data(
        &self, key: CacheEntryKey, res_id: ResId, old_body_end: i64, offset: i64, data: Bytes, truncate: bool,
    ) -> Result<(), Error> {
        self.check_open()?;
        let out = self.store.write_entry_data(key, res_id, old_body_end, offset, data, truncate).await;
        self.settle_with_status(out).await
    }

    pub async fn read_entry_data(
        &self, key: CacheEntryKey, res_id: ResId, offset: i64, len: usize, body_end: i64, sparse: bool,
    ) -> Result<Bytes, Error> {
        self.check_open()?;
        let result = self.store.read_entry_data(key, res_id, offset, len, body_end, sparse).await;
        self.settle(result).await
    }

    pub async fn get_entry_available_range(&self, res_id: ResId, offset: i64, len: i64) -> Result<RangeResult, Error> {
        self.check_open()?;
        let result = self.store.get_entry_available_range(res_id, offset, len).await;
        self.settle(result).await
    }

    /// The unbounded range is answered from the status snapshot.
    pub async fn calculate_size_of_entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<i64, Error> {
        self.check_open()?;
        if from == DateTime::<Utc>::MIN_UTC && to == DateTime::<Utc>::MAX_UTC {
            return Ok(self.status().estimated_disk_usage());
        }
        let result = self.store.calculate_size_of_entries_between(from, to).await;
        self.settle(result).await
    }

    pub async fn open_next_entry(&self, cursor: ResId) -> Result<Option<EntryInfoWithKey>, Error> {
        self.check_open()?;
        let result = self.store.open_next_entry(cursor).await;
        self.settle(result).await
    }

    pub async fn maybe_run_checkpoint(&self) -> Result<bool, Error> {
        self.check_open()?;
        let result = self.store.maybe_run_checkpoint().await;
        self.settle(result).await
    }

    /// Take part in one coordinated eviction round.
    ///
    /// Always reports to `coordinator`, with an empty list if this shard
    /// cannot select, so the barrier completes for the other shards.
    pub async fn start_eviction(
        &self, excluded: HashSet<ResId>, idle: Option<Arc<dyn IdleProbe>>, coordinator: Arc<EvictionCoordinator>,
    ) -> Result<EvictedEntries, Error> {
        let shard_id = self.shard_id();
        let candidates = if self.is_closed() {
            Vec::new()
        } else {
            let selected =
                self.store.select_eviction_candidates(coordinator.size_to_remove(), excluded, idle.clone()).await;
            match self.settle(selected).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "Failed to select eviction candidates");
                    Vec::new()
                }
            }
        };

        let selection = coordinator.on_candidates(shard_id, candidates).await.unwrap_or_default();
        if selection.res_ids.is_empty() {
            let aborted = idle.as_ref().is_some_and(|probe| !probe.is_idle());
            return Ok(EvictedEntries { aborted, ..Default::default() });
        }

        self.check_open()?;
        let out = self.store.evict_entries(selection.res_ids, idle).await;
        let evicted = self.settle_with_status(out).await?;
        self.record_deleted(&evicted.entries);
        tracing::debug!(shard_id, removed = evicted.entries.len(), bytes = evicted.bytes_usage, "Shard eviction done");
        Ok(evicted)
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.store.clone().close().await
    }
}
