//! Cache configuration with layered loading.
//!
//! Uses figment to layer configuration from:
//!
//! 1. Environment variables (SQLCACHE_*)
//! 2. TOML config file (if SQLCACHE_CONFIG_FILE set)
//! 3. Built-in defaults
//!
//! [`EngineConfig`] is the resolved, construction-time view handed to the
//! engine; tests usually build it directly.

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Size used when `max_bytes` is left at 0.
pub const DEFAULT_MAX_BYTES: i64 = 80 * 1024 * 1024;

/// Lower bound for the per-entry size limit.
pub const MIN_FILE_SIZE_LIMIT: i64 = 5 * 1024 * 1024;

/// Application configuration with layered loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Directory holding the shard databases and the marker file.
    ///
    /// Set via SQLCACHE_CACHE_DIR environment variable.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Number of shards (one database file and one background thread each).
    #[serde(default = "default_shard_count")]
    pub shard_count: u16,

    /// Cache capacity in bytes; 0 selects [`DEFAULT_MAX_BYTES`].
    #[serde(default)]
    pub max_bytes: i64,

    /// Eviction starts at `max - max/divisor` and stops at `max - 2*max/divisor`.
    #[serde(default = "default_watermark_divisor")]
    pub watermark_divisor: i64,

    /// Whether `on_idle` may run an eviction pass.
    #[serde(default = "default_true")]
    pub idle_eviction_enabled: bool,

    /// WAL size (pages) above which an idle checkpoint runs.
    #[serde(default = "default_idle_checkpoint_threshold_pages")]
    pub idle_checkpoint_threshold_pages: i64,

    /// WAL size (pages) at which SQLite checkpoints on commit.
    #[serde(default = "default_force_checkpoint_threshold_pages")]
    pub force_checkpoint_threshold_pages: i64,

    /// Run SQLite with `synchronous=OFF`.
    #[serde(default)]
    pub synchronous_off: bool,

    /// Delay before deleting entries left doomed by a previous run.
    #[serde(default = "default_delete_doomed_entries_delay_ms")]
    pub delete_doomed_entries_delay_ms: u64,

    /// Panic on any detected corruption signal.
    #[serde(default)]
    pub strict_corruption_check: bool,

    /// A single entry may use up to `max_bytes / max_file_size_ratio`.
    #[serde(default = "default_max_file_size_ratio")]
    pub max_file_size_ratio: i64,
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./sqlcache")
}

fn default_shard_count() -> u16 {
    3
}

fn default_watermark_divisor() -> i64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_idle_checkpoint_threshold_pages() -> i64 {
    1_000
}

fn default_force_checkpoint_threshold_pages() -> i64 {
    20_000
}

fn default_delete_doomed_entries_delay_ms() -> u64 {
    30_000
}

fn default_max_file_size_ratio() -> i64 {
    8
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            shard_count: default_shard_count(),
            max_bytes: 0,
            watermark_divisor: default_watermark_divisor(),
            idle_eviction_enabled: true,
            idle_checkpoint_threshold_pages: default_idle_checkpoint_threshold_pages(),
            force_checkpoint_threshold_pages: default_force_checkpoint_threshold_pages(),
            synchronous_off: false,
            delete_doomed_entries_delay_ms: default_delete_doomed_entries_delay_ms(),
            strict_corruption_check: false,
            max_file_size_ratio: default_max_file_size_ratio(),
        }
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// Priority (highest wins):
    /// 1. Environment variables prefixed with `SQLCACHE_`
    /// 2. TOML file from `SQLCACHE_CONFIG_FILE` (if set)
    /// 3. Built-in defaults via `Default::default()`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a source cannot be read or parsed, or if
    /// validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("SQLCACHE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("SQLCACHE_")
                .ignore(&["config_file"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Resolve into the construction-time engine configuration.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            cache_dir: self.cache_dir.clone(),
            shard_count: self.shard_count,
            max_bytes: if self.max_bytes > 0 { self.max_bytes } else { DEFAULT_MAX_BYTES },
            watermark_divisor: self.watermark_divisor,
            idle_eviction_enabled: self.idle_eviction_enabled,
            store: StoreConfig {
                idle_checkpoint_threshold_pages: self.idle_checkpoint_threshold_pages,
                force_checkpoint_threshold_pages: self.force_checkpoint_threshold_pages,
                synchronous_off: self.synchronous_off,
                strict_corruption_check: self.strict_corruption_check,
            },
            delete_doomed_entries_delay: Duration::from_millis(self.delete_doomed_entries_delay_ms),
            max_file_size_ratio: self.max_file_size_ratio,
        }
    }
}

/// Per-shard database settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    pub idle_checkpoint_threshold_pages: i64,
    pub force_checkpoint_threshold_pages: i64,
    pub synchronous_off: bool,
    pub strict_corruption_check: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            idle_checkpoint_threshold_pages: default_idle_checkpoint_threshold_pages(),
            force_checkpoint_threshold_pages: default_force_checkpoint_threshold_pages(),
            synchronous_off: false,
            strict_corruption_check: false,
        }
    }
}

/// Thresholds and sizes the engine is constructed with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub cache_dir: PathBuf,
    pub shard_count: u16,
    pub max_bytes: i64,
    pub watermark_divisor: i64,
    pub idle_eviction_enabled: bool,
    pub store: StoreConfig,
    pub delete_doomed_entries_delay: Duration,
    pub max_file_size_ratio: i64,
}

impl EngineConfig {
    /// Defaults for a cache rooted at `cache_dir`.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        AppConfig { cache_dir: cache_dir.into(), ..Default::default() }.engine_config()
    }

    /// Total size at which eviction starts.
    pub fn high_watermark(&self) -> i64 {
        self.max_bytes - self.max_bytes / self.watermark_divisor
    }

    /// Total size eviction brings the store back down to.
    pub fn low_watermark(&self) -> i64 {
        self.max_bytes - 2 * (self.max_bytes / self.watermark_divisor)
    }

    /// Target of an idle-time eviction pass.
    pub fn idle_eviction_target(&self) -> i64 {
        self.max_bytes - 3 * (self.max_bytes / self.watermark_divisor)
    }

    /// Largest body a single entry may hold.
    pub fn max_file_size(&self) -> i64 {
        (self.max_bytes / self.max_file_size_ratio).max(MIN_FILE_SIZE_LIMIT)
    }
}
