//! Compact in-memory existence index, one per shard.
//!
//! Maps key hashes to the `res_id`s of rows carrying that hash. The common
//! case (one row per hash, id below 2^32) is stored as a flat `i32 -> u32`
//! pair; hash collisions and large ids spill into a secondary map.
//!
//! The index is best-effort: it can answer "definitely absent" once fully
//! loaded, but a hit always has to be confirmed by the database.

use std::collections::HashMap;

use crate::store::ResId;

#[derive(Debug, Default)]
pub struct InMemoryIndex {
    compact: HashMap<i32, u32>,
    overflow: HashMap<i32, Vec<ResId>>,
    len: usize,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { compact: HashMap::with_capacity(capacity), overflow: HashMap::new(), len: 0 }
    }

    /// Number of `(hash, res_id)` pairs.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn contains(&self, hash: i32) -> bool {
        self.compact.contains_key(&hash) || self.overflow.contains_key(&hash)
    }

    /// Returns false if the pair was already present.
    pub fn insert(&mut self, hash: i32, res_id: ResId) -> bool {
        if let Some(ids) = self.overflow.get_mut(&hash) {
            if ids.contains(&res_id) {
                return false;
            }
            ids.push(res_id);
            self.len += 1;
            return true;
        }

        match self.compact.get(&hash) {
            Some(&existing) if i64::from(existing) == res_id.value() => false,
            Some(&existing) => {
                self.compact.remove(&hash);
                self.overflow.insert(hash, vec![ResId(i64::from(existing)), res_id]);
                self.len += 1;
                true
            }
            None => {
                match u32::try_from(res_id.value()) {
                    Ok(compact_id) => {
                        self.compact.insert(hash, compact_id);
                    }
                    Err(_) => {
                        self.overflow.insert(hash, vec![res_id]);
                    }
                }
                self.len += 1;
                true
            }
        }
    }

    /// Returns false if the pair was not present.
    pub fn remove(&mut self, hash: i32, res_id: ResId) -> bool {
        if let Some(&existing) = self.compact.get(&hash) {
            if i64::from(existing) != res_id.value() {
                return false;
            }
            self.compact.remove(&hash);
            self.len -= 1;
            return true;
        }

        let Some(ids) = self.overflow.get_mut(&hash) else {
            return false;
        };
        let Some(pos) = ids.iter().position(|id| *id == res_id) else {
            return false;
        };
        ids.swap_remove(pos);
        self.len -= 1;
        match ids.as_slice() {
            [] => {
                self.overflow.remove(&hash);
            }
            [only] => {
                if let Ok(compact_id) = u32::try_from(only.value()) {
                    self.overflow.remove(&hash);
                    self.compact.insert(hash, compact_id);
                }
            }
            _ => {}
        }
        true
    }
}
