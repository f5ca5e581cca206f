//! Open entries.
//!
//! The engine owns one [`EntryRegistry`]. An [`EntryHandle`] holds a token
//! into it and a weak reference to the engine; dropping the last handle for
//! a token releases the registry slot and, if the entry was doomed while
//! open, queues the physical deletion of its row.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Weak;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use super::EngineInner;
use crate::key::CacheEntryKey;
use crate::store::{EntryInfo, ResId};

pub(crate) type Token = u64;

#[derive(Debug, Clone)]
pub(crate) struct EntryState {
    pub key: CacheEntryKey,
    pub res_id: ResId,
    pub shard: usize,
    pub last_used: DateTime<Utc>,
    pub body_end: i64,
    pub head: Bytes,
    pub doomed: bool,
    refs: usize,
}

/// A change requested for an entry but not yet confirmed persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PendingUpdate {
    pub last_used: Option<DateTime<Utc>>,
    pub head: Option<Bytes>,
    pub body_end: Option<i64>,
}

impl PendingUpdate {
    fn apply(&self, info: &mut EntryInfo) {
        if let Some(last_used) = self.last_used {
            info.last_used = last_used;
        }
        if let Some(head) = &self.head {
            info.head = head.clone();
        }
        if let Some(body_end) = self.body_end {
            info.body_end = body_end;
        }
    }
}

/// Entries currently held open, live or doomed.
#[derive(Debug, Default)]
pub(crate) struct EntryRegistry {
    next_token: Token,
    active: HashMap<String, Token>,
    entries: HashMap<Token, EntryState>,
    pending: HashMap<String, VecDeque<PendingUpdate>>,
}

impl EntryRegistry {
    /// Take a reference to the active entry for `key`, if any.
    pub fn acquire_active(&mut self, key: &str) -> Option<(Token, ResId)> {
        let token = *self.active.get(key)?;
        let state = self.entries.get_mut(&token)?;
        state.refs += 1;
        Some((token, state.res_id))
    }

    pub fn active_token(&self, key: &str) -> Option<Token> {
        self.active.get(key).copied()
    }

    /// Register a freshly opened or created entry. An already active entry
    /// for the same key is reused instead.
    pub fn register(&mut self, key: &CacheEntryKey, shard: usize, info: &EntryInfo) -> (Token, ResId) {
        if let Some(found) = self.acquire_active(key.as_str()) {
            return found;
        }
        self.next_token += 1;
        let token = self.next_token;
        self.entries.insert(
            token,
            EntryState {
                key: key.clone(),
                res_id: info.res_id,
                shard,
                last_used: info.last_used,
                body_end: info.body_end,
                head: info.head.clone(),
                doomed: false,
                refs: 1,
            },
        );
        self.active.insert(key.as_str().to_owned(), token);
        (token, info.res_id)
    }

    pub fn get(&self, token: Token) -> Option<&EntryState> {
        self.entries.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut EntryState> {
        self.entries.get_mut(&token)
    }

    /// Move an entry from the active map to the doomed set. Returns false if
    /// it was already doomed.
    pub fn mark_doomed(&mut self, token: Token) -> bool {
        let Some(state) = self.entries.get_mut(&token) else {
            return false;
        };
        if state.doomed {
            return false;
        }
        state.doomed = true;
        if self.active.get(state.key.as_str()) == Some(&token) {
            self.active.remove(state.key.as_str());
        }
        true
    }

    /// Drop one reference. Returns the state once the last reference is
    /// gone.
    pub fn release(&mut self, token: Token) -> Option<EntryState> {
        let state = self.entries.get_mut(&token)?;
        state.refs = state.refs.saturating_sub(1);
        if state.refs > 0 {
            return None;
        }
        let state = self.entries.remove(&token)?;
        if self.active.get(state.key.as_str()) == Some(&token) {
            self.active.remove(state.key.as_str());
        }
        Some(state)
    }

    /// Tokens of open entries that are not doomed.
    pub fn live_tokens(&self) -> Vec<Token> {
        self.active.values().copied().collect()
    }

    /// `res_id`s of every open entry, grouped by shard.
    pub fn open_res_ids(&self, shard_count: usize) -> Vec<HashSet<ResId>> {
        let mut by_shard = vec![HashSet::new(); shard_count];
        for state in self.entries.values() {
            if let Some(ids) = by_shard.get_mut(state.shard) {
                ids.insert(state.res_id);
            }
        }
        by_shard
    }

    pub fn push_pending(&mut self, key: &str, update: PendingUpdate) {
        self.pending.entry(key.to_owned()).or_default().push_back(update);
    }

    /// Pop the oldest in-flight update for `key` once its store call has
    /// completed.
    pub fn pop_pending(&mut self, key: &str) {
        if let Some(queue) = self.pending.get_mut(key) {
            queue.pop_front();
            if queue.is_empty() {
                self.pending.remove(key);
            }
        }
    }

    /// Overlay the in-flight updates for `key` on persisted state.
    pub fn apply_pending(&self, key: &str, info: &mut EntryInfo) {
        for update in self.pending.get(key).into_iter().flatten() {
            update.apply(info);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn doomed_len(&self) -> usize {
        self.entries.values().filter(|s| s.doomed).count()
    }
}

/// Current in-memory view of an open entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub res_id: ResId,
    pub last_used: DateTime<Utc>,
    pub body_end: i64,
    pub head: Bytes,
    pub doomed: bool,
}

/// One reference to an open cache entry.
pub struct EntryHandle {
    pub(crate) token: Token,
    pub(crate) key: CacheEntryKey,
    pub(crate) res_id: ResId,
    pub(crate) engine: Weak<EngineInner>,
}

impl EntryHandle {
    pub fn key(&self) -> &CacheEntryKey {
        &self.key
    }

    pub fn res_id(&self) -> ResId {
        self.res_id
    }

    /// `None` once the engine has gone away.
    pub fn snapshot(&self) -> Option<EntrySnapshot> {
        let engine = self.engine.upgrade()?;
        let entries = engine.entries.lock();
        let state = entries.get(self.token)?;
        Some(EntrySnapshot {
            res_id: state.res_id,
            last_used: state.last_used,
            body_end: state.body_end,
            head: state.head.clone(),
            doomed: state.doomed,
        })
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryHandle").field("key", &self.key).field("res_id", &self.res_id).finish()
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.upgrade() {
            engine.release_entry(self.token);
        }
    }
}
