//! Cache entry keys, key hashing, and the payload checksum.

use std::fmt;

use sha2::{Digest, Sha256};

/// 32-bit hash of a cache key.
///
/// Stored in the `key_hash` column, used for shard routing, the in-memory
/// index, and as the salt of every checksum. Stable across processes and
/// byte orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KeyHash(pub i32);

impl KeyHash {
    pub fn value(self) -> i32 {
        self.0
    }
}

/// A cache key together with its precomputed hash.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheEntryKey {
    key: String,
    hash: KeyHash,
}

impl CacheEntryKey {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        let hash = compute_key_hash(&key);
        Self { key, hash }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn hash(&self) -> KeyHash {
        self.hash
    }

    /// Length in bytes, counted towards the entry's `bytes_usage`.
    pub fn len(&self) -> usize {
        self.key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_empty()
    }
}

impl fmt::Debug for CacheEntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntryKey")
            .field("key", &self.key)
            .field("hash", &self.hash.0)
            .finish()
    }
}

impl From<&str> for CacheEntryKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for CacheEntryKey {
    fn from(key: String) -> Self {
        Self::new(key)
    }
}

/// Compute the persistent 32-bit hash of a key: the first four bytes of its
/// SHA-256 digest, big-endian.
pub fn compute_key_hash(key: &str) -> KeyHash {
    let digest = Sha256::digest(key.as_bytes());
    KeyHash(i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

/// `crc32(payload || big_endian(key_hash))`.
///
/// Used for the header column and every blob row.
pub fn calculate_checksum(data: &[u8], key_hash: KeyHash) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.update(&key_hash.0.to_be_bytes());
    hasher.finalize()
}
