//! Configuration validation rules.
//!
//! Checked after `AppConfig` has been merged from defaults, file and
//! environment.

use crate::config::AppConfig;
use thiserror::Error;

/// Upper bound on the number of shard databases.
pub const MAX_SHARD_COUNT: u16 = 64;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadFailed(String),

    #[error("invalid configuration: {field} - {reason}")]
    Invalid { field: String, reason: String },

    #[error("missing required configuration: {field} ({hint})")]
    Missing { field: String, hint: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.into(), reason: reason.into() }
}

impl AppConfig {
    /// Validate configuration values after loading.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Missing` if `cache_dir` is empty, and
    /// `ConfigError::Invalid` if:
    /// - `shard_count` is outside `1..=64`
    /// - `max_bytes` is negative
    /// - `watermark_divisor` is below 4, which would leave no room between
    ///   the idle target and zero
    /// - either checkpoint threshold is not positive
    /// - `max_file_size_ratio` is not positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::Missing {
                field: "cache_dir".into(),
                hint: "set SQLCACHE_CACHE_DIR or cache_dir in the config file".into(),
            });
        }

        if self.shard_count == 0 || self.shard_count > MAX_SHARD_COUNT {
            return Err(invalid("shard_count", "must be between 1 and 64"));
        }

        if self.max_bytes < 0 {
            return Err(invalid("max_bytes", "must not be negative (0 selects the default)"));
        }

        if self.watermark_divisor < 4 {
            return Err(invalid("watermark_divisor", "must be at least 4"));
        }

        if self.idle_checkpoint_threshold_pages <= 0 {
            return Err(invalid("idle_checkpoint_threshold_pages", "must be greater than 0"));
        }
        if self.force_checkpoint_threshold_pages <= 0 {
            return Err(invalid("force_checkpoint_threshold_pages", "must be greater than 0"));
        }
        if self.force_checkpoint_threshold_pages < self.idle_checkpoint_threshold_pages {
            tracing::warn!(
                idle = self.idle_checkpoint_threshold_pages,
                force = self.force_checkpoint_threshold_pages,
                "force_checkpoint_threshold_pages is below idle_checkpoint_threshold_pages; \
                 idle checkpoints will rarely run"
            );
        }

        if self.max_file_size_ratio <= 0 {
            return Err(invalid("max_file_size_ratio", "must be greater than 0"));
        }

        if self.strict_corruption_check {
            tracing::warn!("strict_corruption_check is enabled; corruption will abort the affected shard");
        }

        Ok(())
    }
}
