//! The sharded cache engine.
//!
//! [`Engine`] fronts one [`Shard`] per database file. Keys are routed to a
//! shard by their hash. Every public operation returns a [`Pending`]
//! immediately and runs on the tokio runtime: normal operations are queued
//! per key, exclusive operations (iteration, bulk deletion, flush, eviction)
//! are ordered against everything else, see [`operations`].

pub mod entry;
pub mod marker;
pub mod operations;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;

pub use entry::{EntryHandle, EntrySnapshot};

use crate::Error;
use crate::config::EngineConfig;
use crate::eviction::EvictionCoordinator;
use crate::key::{CacheEntryKey, KeyHash};
use crate::shard::{Shard, ShardStats};
use crate::store::{EntryInfo, IdleProbe, RangeResult, ResId, StoreStatus};
use entry::{EntryRegistry, PendingUpdate, Token};
use operations::{OperationCoordinator, Ticket};

/// Result of an engine operation that may still be running.
///
/// Await it, or poll it without blocking through [`Pending::try_result`].
#[must_use = "dropping a Pending does not cancel the operation, but its result is lost"]
pub struct Pending<T> {
    rx: oneshot::Receiver<Result<T, Error>>,
    taken: bool,
}

impl<T> Pending<T> {
    fn new(rx: oneshot::Receiver<Result<T, Error>>) -> Self {
        Self { rx, taken: false }
    }

    fn ready(result: Result<T, Error>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self::new(rx)
    }

    /// The result if the operation has already finished. Yields it at most
    /// once.
    pub fn try_result(&mut self) -> Option<Result<T, Error>> {
        if self.taken {
            return None;
        }
        let result = match self.rx.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return None,
            Err(TryRecvError::Closed) => Err(Error::DatabaseClosed),
        };
        self.taken = true;
        Some(result)
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.taken {
            return Poll::Ready(Err(Error::DatabaseClosed));
        }
        let polled = Pin::new(&mut self.rx).poll(cx);
        polled.map(|received| {
            self.taken = true;
            received.unwrap_or(Err(Error::DatabaseClosed))
        })
    }
}

/// Engine-wide statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub entry_count: i64,
    pub total_size: i64,
    pub estimated_disk_usage: i64,
    pub max_bytes: i64,
    pub open_entries: usize,
    pub doomed_open_entries: usize,
    pub shards: Vec<ShardStats>,
}

/// What one eviction round removed across all shards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub removed: usize,
    pub bytes_usage: i64,
    pub aborted: bool,
}

pub(crate) struct EngineInner {
    config: EngineConfig,
    shards: Vec<Arc<Shard>>,
    operations: OperationCoordinator,
    entries: Mutex<EntryRegistry>,
    eviction_running: AtomicBool,
    idle_probe: Option<Arc<dyn IdleProbe>>,
    runtime: Handle,
}

/// Handle to an open cache directory. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub async fn open(config: EngineConfig) -> Result<Self, Error> {
        Self::open_with_idle_probe(config, None).await
    }

    /// Open the cache directory, claim it with the marker file, and open every
    /// shard. Index loading continues in the background.
    pub async fn open_with_idle_probe(
        config: EngineConfig, idle_probe: Option<Arc<dyn IdleProbe>>,
    ) -> Result<Self, Error> {
        if config.shard_count == 0 {
            return Err(Error::InvalidArgument("shard_count must be at least 1".into()));
        }
        std::fs::create_dir_all(&config.cache_dir)
            .map_err(|e| Error::FailedToCreateDirectory(format!("{}: {e}", config.cache_dir.display())))?;
        let marker = marker::claim(&config.cache_dir)?;

        let mut opening = Vec::with_capacity(usize::from(config.shard_count));
        for shard_id in 0..config.shard_count {
            let cache_dir = config.cache_dir.clone();
            let store = config.store;
            opening.push(tokio::spawn(async move { Shard::open(&cache_dir, shard_id, store).await }));
        }
        let mut shards = Vec::with_capacity(opening.len());
        for task in opening {
            let shard = task.await.map_err(|e| Error::FailedToOpenDatabase(e.to_string()))??;
            shards.push(Arc::new(shard));
        }

        let inner = Arc::new(EngineInner {
            config,
            shards,
            operations: OperationCoordinator::new(),
            entries: Mutex::new(EntryRegistry::default()),
            eviction_running: AtomicBool::new(false),
            idle_probe,
            runtime: Handle::current(),
        });

        let status = inner.total_status();
        tracing::info!(
            cache_dir = %inner.config.cache_dir.display(),
            shard_count = inner.shards.len(),
            entry_count = status.entry_count,
            total_size = status.total_size,
            ?marker,
            "Engine initialized"
        );

        for index in 0..inner.shards.len() {
            inner.spawn_index_load(index);
        }
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Index of the shard that owns `key`.
    pub fn shard_for_key(&self, key: &CacheEntryKey) -> usize {
        self.inner.shard_index(key.hash())
    }

    /// Resolves once every shard has finished loading its index.
    pub async fn wait_for_index_load(&self) {
        for shard in &self.inner.shards {
            shard.wait_for_index_load().await;
        }
    }

    /// Open the live entry for `key`, bumping its `last_used`.
    pub fn open_entry(&self, key: impl Into<CacheEntryKey>) -> Pending<Option<EntryHandle>> {
        let key = key.into();
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move { inner.open_entry(key).await })
    }

    pub fn open_or_create_entry(&self, key: impl Into<CacheEntryKey>) -> Pending<EntryHandle> {
        let key = key.into();
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move { inner.open_or_create_entry(key).await })
    }

    /// Create a new entry; fails with `AlreadyExists` if one is live.
    pub fn create_entry(&self, key: impl Into<CacheEntryKey>) -> Pending<EntryHandle> {
        let key = key.into();
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move { inner.create_entry(key).await })
    }

    /// Doom the live entry for `key`. An open entry is only marked doomed;
    /// its row is deleted once the last handle is dropped.
    pub fn doom_entry(&self, key: impl Into<CacheEntryKey>) -> Pending<()> {
        let key = key.into();
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move { inner.doom_entry_by_key(key).await })
    }

    /// Doom the entry behind `entry`.
    pub fn doom(&self, entry: &EntryHandle) -> Pending<()> {
        let token = entry.token;
        let ticket = self.inner.operations.normal(entry.key.as_str());
        self.inner.submit(ticket, move |inner| async move { inner.doom_token(token).await })
    }

    pub fn doom_all_entries(&self) -> Pending<()> {
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, |inner| async move {
            inner.doom_between(DateTime::<Utc>::MIN_UTC, DateTime::<Utc>::MAX_UTC).await
        })
    }

    /// Doom every entry with `from <= last_used < to`.
    pub fn doom_entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Pending<()> {
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, move |inner| async move { inner.doom_between(from, to).await })
    }

    pub fn doom_entries_since(&self, from: DateTime<Utc>) -> Pending<()> {
        self.doom_entries_between(from, DateTime::<Utc>::MAX_UTC)
    }

    /// Estimated disk usage of every live entry, from the status snapshots.
    pub fn calculate_size_of_all_entries(&self) -> Pending<i64> {
        Pending::ready(Ok(self.inner.estimated_usage()))
    }

    pub fn calculate_size_of_entries_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Pending<i64> {
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, move |inner| async move {
            let mut total: i64 = 0;
            for shard in &inner.shards {
                total = total.saturating_add(shard.calculate_size_of_entries_between(from, to).await?);
            }
            Ok(total)
        })
    }

    pub fn entry_count(&self) -> i64 {
        self.inner.total_status().entry_count
    }

    /// Sum of `total_size` over all shards.
    pub fn size_of_all_entries(&self) -> i64 {
        self.inner.total_status().total_size
    }

    /// Read up to `len` bytes at `offset`. The result never extends past the
    /// entry's body.
    pub fn read_data(&self, entry: &EntryHandle, offset: i64, len: usize, sparse: bool) -> Pending<Bytes> {
        if offset < 0 || i64::try_from(len).is_err() {
            return Pending::ready(Err(Error::InvalidArgument(format!("read at {offset} of {len} bytes"))));
        }
        let Some(body_end) = self.inner.with_entry(entry.token, |state| state.body_end) else {
            return Pending::ready(Err(Error::NotFound));
        };
        let (key, res_id, token) = (entry.key.clone(), entry.res_id, entry.token);
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move {
            let shard = inner.shard_of(token)?;
            shard.read_entry_data(key, res_id, offset, len, body_end, sparse).await
        })
    }

    /// Write `data` at `offset`. With `truncate` the body ends at the end of
    /// the write.
    pub fn write_data(&self, entry: &EntryHandle, offset: i64, data: Bytes, truncate: bool) -> Pending<()> {
        let inner = &self.inner;
        let Some(end) = i64::try_from(data.len()).ok().and_then(|len| offset.checked_add(len)) else {
            return Pending::ready(Err(Error::InvalidArgument(format!("write at {offset} overflows"))));
        };
        if offset < 0 {
            return Pending::ready(Err(Error::InvalidArgument(format!("negative offset {offset}"))));
        }
        let max_file_size = inner.config.max_file_size();
        if end > max_file_size {
            return Pending::ready(Err(Error::InvalidArgument(format!(
                "write ending at {end} exceeds the maximum entry size {max_file_size}"
            ))));
        }

        let (key, res_id, token) = (entry.key.clone(), entry.res_id, entry.token);
        let old_body_end = {
            let mut entries = inner.entries.lock();
            let Some(state) = entries.get_mut(token) else {
                return Pending::ready(Err(Error::NotFound));
            };
            let old_body_end = state.body_end;
            state.body_end = if truncate { end } else { old_body_end.max(end) };
            let body_end = state.body_end;
            entries.push_pending(key.as_str(), PendingUpdate { body_end: Some(body_end), ..Default::default() });
            old_body_end
        };

        let ticket = inner.operations.normal(key.as_str());
        inner.submit(ticket, move |inner| async move {
            let result = match inner.shard_of(token) {
                Ok(shard) => shard.write_entry_data(key.clone(), res_id, old_body_end, offset, data, truncate).await,
                Err(e) => Err(e),
            };
            inner.entries.lock().pop_pending(key.as_str());
            inner.finish_entry_update(token, result).await
        })
    }

    /// Replace the entry's header and bump its `last_used`.
    pub fn write_header(&self, entry: &EntryHandle, head: Bytes) -> Pending<()> {
        let inner = &self.inner;
        let now = Utc::now();
        let (key, res_id, token) = (entry.key.clone(), entry.res_id, entry.token);
        let header_size_delta = {
            let mut entries = inner.entries.lock();
            let Some(state) = entries.get_mut(token) else {
                return Pending::ready(Err(Error::NotFound));
            };
            let delta = head.len() as i64 - state.head.len() as i64;
            state.head = head.clone();
            state.last_used = now;
            entries.push_pending(
                key.as_str(),
                PendingUpdate { last_used: Some(now), head: Some(head.clone()), body_end: None },
            );
            delta
        };

        let ticket = inner.operations.normal(key.as_str());
        inner.submit(ticket, move |inner| async move {
            let result = match inner.shard_of(token) {
                Ok(shard) => {
                    shard.update_entry_header_and_last_used(key.clone(), res_id, now, head, header_size_delta).await
                }
                Err(e) => Err(e),
            };
            inner.entries.lock().pop_pending(key.as_str());
            inner.finish_entry_update(token, result).await
        })
    }

    /// Record a use of the entry now.
    pub fn update_last_used(&self, entry: &EntryHandle) -> Pending<()> {
        let inner = &self.inner;
        let now = Utc::now();
        let (key, res_id, token) = (entry.key.clone(), entry.res_id, entry.token);
        if inner.with_entry_mut(token, |state| state.last_used = now).is_none() {
            return Pending::ready(Err(Error::NotFound));
        }
        inner.entries.lock().push_pending(key.as_str(), PendingUpdate { last_used: Some(now), ..Default::default() });

        let ticket = inner.operations.normal(key.as_str());
        inner.submit(ticket, move |inner| async move {
            let result = match inner.shard_of(token) {
                Ok(shard) => shard.update_entry_last_used_by_res_id(res_id, now).await,
                Err(e) => Err(e),
            };
            inner.entries.lock().pop_pending(key.as_str());
            result
        })
    }

    pub fn get_available_range(&self, entry: &EntryHandle, offset: i64, len: i64) -> Pending<RangeResult> {
        let (key, res_id, token) = (entry.key.clone(), entry.res_id, entry.token);
        let ticket = self.inner.operations.normal(key.as_str());
        self.inner.submit(ticket, move |inner| async move {
            inner.shard_of(token)?.get_entry_available_range(res_id, offset, len).await
        })
    }

    /// Iterator over every live entry, shard by shard, newest row first.
    pub fn iterator(&self) -> EntryIterator {
        EntryIterator { inner: Arc::clone(&self.inner), cursor: Arc::new(Mutex::new(Cursor::start())) }
    }

    /// Resolves once every operation submitted before it has finished.
    pub fn flush(&self) -> Pending<()> {
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, |_| async { Ok(()) })
    }

    /// Idle-time maintenance: WAL checkpoints on every shard, then idle
    /// eviction when enabled and the store is above the low watermark.
    ///
    /// Fails with `AbortedDueToBrowserActivity` if idle eviction stopped
    /// early.
    pub fn on_idle(&self) -> Pending<()> {
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, |inner| async move { inner.run_idle_tasks().await })
    }

    pub fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let status = inner.total_status();
        let (open_entries, doomed_open_entries) = {
            let entries = inner.entries.lock();
            (entries.len(), entries.doomed_len())
        };
        EngineStats {
            entry_count: status.entry_count,
            total_size: status.total_size,
            estimated_disk_usage: inner.estimated_usage(),
            max_bytes: inner.config.max_bytes,
            open_entries,
            doomed_open_entries,
            shards: inner.shards.iter().map(|shard| shard.stats()).collect(),
        }
    }

    /// Wait for submitted operations, then close every shard database.
    pub async fn close(self) -> Result<(), Error> {
        self.flush().await?;
        for shard in &self.inner.shards {
            shard.close().await?;
        }
        tracing::info!(cache_dir = %self.inner.config.cache_dir.display(), "Engine closed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct Cursor {
    shard: usize,
    res_id: ResId,
}

impl Cursor {
    fn start() -> Self {
        Self { shard: 0, res_id: ResId(i64::MAX) }
    }
}

/// Walks every live entry. Each step runs as an exclusive operation.
pub struct EntryIterator {
    inner: Arc<EngineInner>,
    cursor: Arc<Mutex<Cursor>>,
}

impl EntryIterator {
    /// Open the next entry, or `None` once every shard is exhausted.
    pub fn open_next_entry(&mut self) -> Pending<Option<EntryHandle>> {
        let cursor = Arc::clone(&self.cursor);
        let ticket = self.inner.operations.exclusive();
        self.inner.submit(ticket, move |inner| async move { inner.open_next_entry(cursor).await })
    }
}

impl EngineInner {
    fn submit<T, F, Fut>(self: &Arc<Self>, ticket: Ticket, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<EngineInner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, Error>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let _guard = ticket.ready().await;
            let result = op(inner).await;
            let _ = tx.send(result);
        });
        Pending::new(rx)
    }

    fn shard_index(&self, hash: KeyHash) -> usize {
        (hash.value() as u32 % self.shards.len() as u32) as usize
    }

    fn shard_for(&self, key: &CacheEntryKey) -> (usize, &Arc<Shard>) {
        let index = self.shard_index(key.hash());
        (index, &self.shards[index])
    }

    fn shard_of(&self, token: Token) -> Result<Arc<Shard>, Error> {
        let index = self.with_entry(token, |state| state.shard).ok_or(Error::NotFound)?;
        self.shards.get(index).cloned().ok_or(Error::NotFound)
    }

    fn with_entry<R>(&self, token: Token, f: impl FnOnce(&entry::EntryState) -> R) -> Option<R> {
        self.entries.lock().get(token).map(f)
    }

    fn with_entry_mut<R>(&self, token: Token, f: impl FnOnce(&mut entry::EntryState) -> R) -> Option<R> {
        self.entries.lock().get_mut(token).map(f)
    }

    fn total_status(&self) -> StoreStatus {
        self.shards.iter().map(|shard| shard.status()).fold(StoreStatus::default(), |acc, status| StoreStatus {
            entry_count: acc.entry_count.saturating_add(status.entry_count),
            total_size: acc.total_size.saturating_add(status.total_size),
        })
    }

    fn estimated_usage(&self) -> i64 {
        self.shards.iter().map(|shard| shard.status().estimated_disk_usage()).fold(0, i64::saturating_add)
    }

    fn handle(self: &Arc<Self>, token: Token, key: CacheEntryKey, res_id: ResId) -> EntryHandle {
        EntryHandle { token, key, res_id, engine: Arc::downgrade(self) }
    }

    fn acquire_active(self: &Arc<Self>, key: &CacheEntryKey) -> Option<EntryHandle> {
        let (token, res_id) = self.entries.lock().acquire_active(key.as_str())?;
        Some(self.handle(token, key.clone(), res_id))
    }

    fn register(self: &Arc<Self>, key: CacheEntryKey, shard: usize, info: &EntryInfo) -> EntryHandle {
        let (token, res_id) = self.entries.lock().register(&key, shard, info);
        self.handle(token, key, res_id)
    }

    /// Load one shard's index, then delete its doomed backlog after the
    /// configured delay.
    fn spawn_index_load(self: &Arc<Self>, index: usize) {
        let engine = Arc::downgrade(self);
        let delay = self.config.delete_doomed_entries_delay;
        self.runtime.spawn(async move {
            let Some(shard) = engine.upgrade().and_then(|inner| inner.shards.get(index).cloned()) else {
                return;
            };
            let shard_id = shard.shard_id();
            let backlog = match shard.load_index().await {
                Ok(backlog) => backlog,
                Err(e) => {
                    tracing::warn!(shard_id, error = %e, "Index load failed");
                    return;
                }
            };
            drop(shard);
            if backlog.is_empty() {
                return;
            }

            tokio::time::sleep(delay).await;
            let Some(shard) = engine.upgrade().and_then(|inner| inner.shards.get(index).cloned()) else {
                return;
            };
            let count = backlog.len();
            match shard.delete_doomed_entries(backlog).await {
                Ok(deleted) => tracing::info!(shard_id, deleted, count, "Deleted doomed entries from earlier run"),
                Err(e) => tracing::warn!(shard_id, error = %e, "Failed to delete doomed backlog"),
            }
        });
    }

    async fn open_entry(self: Arc<Self>, key: CacheEntryKey) -> Result<Option<EntryHandle>, Error> {
        if let Some(handle) = self.acquire_active(&key) {
            return Ok(Some(handle));
        }
        let (index, shard) = self.shard_for(&key);
        let Some(mut info) = shard.open_entry(key.clone()).await? else {
            return Ok(None);
        };
        let now = Utc::now();
        shard.update_entry_last_used_by_res_id(info.res_id, now).await?;
        info.last_used = now;
        Ok(Some(self.register(key, index, &info)))
    }

    async fn open_or_create_entry(self: Arc<Self>, key: CacheEntryKey) -> Result<EntryHandle, Error> {
        if let Some(handle) = self.acquire_active(&key) {
            return Ok(handle);
        }
        let (index, shard) = self.shard_for(&key);
        let now = Utc::now();
        let mut info = shard.open_or_create_entry(key.clone(), now).await?;
        if info.opened {
            shard.update_entry_last_used_by_res_id(info.res_id, now).await?;
            info.last_used = now;
        } else {
            tracing::debug!(res_id = %info.res_id, key_hash = key.hash().value(), "Entry created");
            self.maybe_start_eviction();
        }
        Ok(self.register(key, index, &info))
    }

    async fn create_entry(self: Arc<Self>, key: CacheEntryKey) -> Result<EntryHandle, Error> {
        if self.entries.lock().active_token(key.as_str()).is_some() {
            return Err(Error::AlreadyExists);
        }
        let (index, shard) = self.shard_for(&key);
        let info = shard.create_entry(key.clone(), Utc::now()).await?;
        tracing::debug!(res_id = %info.res_id, key_hash = key.hash().value(), "Entry created");
        self.maybe_start_eviction();
        Ok(self.register(key, index, &info))
    }

    async fn doom_entry_by_key(self: Arc<Self>, key: CacheEntryKey) -> Result<(), Error> {
        let active = self.entries.lock().active_token(key.as_str());
        match active {
            Some(token) => self.doom_token(token).await,
            None => {
                let (_, shard) = self.shard_for(&key);
                shard.delete_live_entry(key).await
            }
        }
    }

    async fn doom_token(self: Arc<Self>, token: Token) -> Result<(), Error> {
        let Some((key, res_id, shard, doomed)) =
            self.with_entry(token, |state| (state.key.clone(), state.res_id, state.shard, state.doomed))
        else {
            return Err(Error::NotFound);
        };
        if doomed {
            return Err(Error::NotFound);
        }
        let result = match self.shards.get(shard) {
            Some(shard) => shard.doom_entry(key.hash(), res_id).await,
            None => Err(Error::NotFound),
        };
        // The row is gone or doomed either way once the store answered
        // NotFound.
        if result.is_ok() || result.as_ref().is_err_and(Error::is_not_found) {
            self.entries.lock().mark_doomed(token);
        }
        result
    }

    async fn doom_between(self: Arc<Self>, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<(), Error> {
        let unbounded = from == DateTime::<Utc>::MIN_UTC && to == DateTime::<Utc>::MAX_UTC;
        let (nothing_open, excluded, open) = {
            let entries = self.entries.lock();
            let open: Vec<Token> = entries
                .live_tokens()
                .into_iter()
                .filter(|token| entries.get(*token).is_some_and(|state| state.last_used >= from && state.last_used < to))
                .collect();
            (entries.is_empty(), entries.open_res_ids(self.shards.len()), open)
        };

        let mut removed = 0;
        for (shard, excluded) in self.shards.iter().zip(excluded) {
            if unbounded && nothing_open {
                shard.delete_all_entries().await?;
            } else {
                removed += shard.delete_live_entries_between(from, to, excluded).await?;
            }
        }
        for token in open {
            match Arc::clone(&self).doom_token(token).await {
                Ok(()) | Err(Error::NotFound) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(removed, unbounded, "Entries doomed by range");
        Ok(())
    }

    /// Finish a data or header write. Corruption dooms the entry so it is
    /// not served again.
    async fn finish_entry_update(self: Arc<Self>, token: Token, result: Result<(), Error>) -> Result<(), Error> {
        match &result {
            Ok(()) => self.maybe_start_eviction(),
            Err(e) if e.is_corruption() => {
                tracing::warn!(error = %e, "Entry write failed with corruption, dooming entry");
                if let Err(doom_error) = Arc::clone(&self).doom_token(token).await {
                    tracing::debug!(error = %doom_error, "Doom after failed write did not apply");
                }
            }
            Err(_) => {}
        }
        result
    }

    async fn open_next_entry(self: Arc<Self>, cursor: Arc<Mutex<Cursor>>) -> Result<Option<EntryHandle>, Error> {
        loop {
            let position = *cursor.lock();
            let Some(shard) = self.shards.get(position.shard) else {
                return Ok(None);
            };
            let Some(found) = shard.open_next_entry(position.res_id).await? else {
                *cursor.lock() = Cursor { shard: position.shard + 1, res_id: ResId(i64::MAX) };
                continue;
            };
            cursor.lock().res_id = found.info.res_id;

            if let Some(handle) = self.acquire_active(&found.key) {
                return Ok(Some(handle));
            }
            let mut info = found.info;
            self.entries.lock().apply_pending(found.key.as_str(), &mut info);
            return Ok(Some(self.register(found.key, position.shard, &info)));
        }
    }

    /// Release one handle reference; a doomed entry's row is deleted once no
    /// handle remains.
    fn release_entry(self: &Arc<Self>, token: Token) {
        let Some(state) = self.entries.lock().release(token) else {
            return;
        };
        if !state.doomed {
            return;
        }
        let Some(shard) = self.shards.get(state.shard).cloned() else {
            return;
        };
        let ticket = self.operations.normal(state.key.as_str());
        let res_id = state.res_id;
        let deletion = self.submit(ticket, move |_| async move { shard.delete_doomed_entry(res_id).await });
        drop(deletion);
    }

    fn maybe_start_eviction(self: &Arc<Self>) {
        let usage = self.estimated_usage();
        if usage <= self.config.high_watermark() {
            return;
        }
        if self.eviction_running.swap(true, Ordering::AcqRel) {
            return;
        }
        let ticket = self.operations.exclusive();
        let inner = Arc::clone(self);
        self.runtime.spawn(async move {
            let _guard = ticket.ready().await;
            let usage = inner.estimated_usage();
            let target = inner.config.low_watermark();
            if usage > target {
                if let Err(e) = inner.run_eviction(usage - target, None).await {
                    tracing::warn!(error = %e, "Eviction failed");
                }
            }
            inner.eviction_running.store(false, Ordering::Release);
        });
    }

    /// One coordinated eviction round across every shard. Open entries are
    /// never selected.
    async fn run_eviction(
        self: &Arc<Self>, size_to_remove: i64, idle: Option<Arc<dyn IdleProbe>>,
    ) -> Result<EvictionReport, Error> {
        let coordinator = Arc::new(EvictionCoordinator::new(size_to_remove, self.shards.len()));
        let excluded = self.entries.lock().open_res_ids(self.shards.len());

        let mut rounds = Vec::with_capacity(self.shards.len());
        for (shard, excluded) in self.shards.iter().zip(excluded) {
            let shard = Arc::clone(shard);
            let idle = idle.clone();
            let coordinator = Arc::clone(&coordinator);
            rounds.push(self.runtime.spawn(async move { shard.start_eviction(excluded, idle, coordinator).await }));
        }

        let mut report = EvictionReport::default();
        let mut first_error = None;
        for round in rounds {
            match round.await {
                Ok(Ok(evicted)) => {
                    report.removed += evicted.entries.len();
                    report.bytes_usage = report.bytes_usage.saturating_add(evicted.bytes_usage);
                    report.aborted |= evicted.aborted;
                }
                Ok(Err(Error::AbortedDueToBrowserActivity)) => report.aborted = true,
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(Error::InvalidData(format!("eviction task failed: {e}")));
                }
            }
        }

        tracing::info!(
            size_to_remove,
            removed = report.removed,
            bytes = report.bytes_usage,
            aborted = report.aborted,
            idle = idle.is_some(),
            "Eviction finished"
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn run_idle_tasks(self: Arc<Self>) -> Result<(), Error> {
        for shard in &self.shards {
            match shard.maybe_run_checkpoint().await {
                Ok(true) => tracing::debug!(shard_id = shard.shard_id(), "Idle checkpoint ran"),
                Ok(false) | Err(Error::DatabaseClosed) => {}
                Err(e) => tracing::warn!(shard_id = shard.shard_id(), error = %e, "Idle checkpoint failed"),
            }
        }

        if !self.config.idle_eviction_enabled || self.config.max_bytes <= 0 {
            return Ok(());
        }
        let Some(probe) = self.idle_probe.clone() else {
            return Ok(());
        };
        let usage = self.estimated_usage();
        if usage < self.config.low_watermark() || !probe.is_idle() {
            return Ok(());
        }
        if self.eviction_running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let size_to_remove = usage - self.config.idle_eviction_target();
        let result = self.run_eviction(size_to_remove, Some(probe)).await;
        self.eviction_running.store(false, Ordering::Release);
        match result? {
            report if report.aborted => Err(Error::AbortedDueToBrowserActivity),
            _ => Ok(()),
        }
    }
}
