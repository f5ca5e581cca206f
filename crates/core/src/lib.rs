//! Sharded SQLite persistence engine for a disk cache.
//!
//! This crate provides:
//! - `ShardStore`: resources and body blobs in one SQLite file per shard
//! - `Shard`: the async facade with its in-memory existence index
//! - `EvictionCoordinator`: cross-shard LRU eviction
//! - `Engine`: key routing, per-key ordering and open-entry registries
//! - Unified error types and layered configuration

pub mod backend;
pub mod config;
pub mod error;
pub mod eviction;
pub mod index;
pub mod key;
pub mod shard;
pub mod store;

pub use backend::{Engine, EngineStats, EntryHandle, EntryIterator, EntrySnapshot, Pending};
pub use config::{AppConfig, ConfigError, EngineConfig, StoreConfig};
pub use error::Error;
pub use key::{CacheEntryKey, KeyHash};
pub use store::{AlwaysIdle, IdleProbe, RangeResult, ResId, StoreStatus};
