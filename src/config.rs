//! Engine configuration.
//!
//! Every field has a default, so an empty TOML file (or no file at all)
//! yields a working configuration. CLI flags override file values after
//! loading; [`EngineConfig::validate`] runs last.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Inclusive bounds for `worker_concurrency`.
pub const WORKER_CONCURRENCY_RANGE: std::ops::RangeInclusive<usize> = 1..=64;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("cannot read config file {}: {source}", path.display())]
    Read {
        /// Path that failed.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Config file is not valid TOML or has wrong value types.
    #[error("cannot parse config file {}: {source}", path.display())]
    Parse {
        /// Path that failed.
        path: PathBuf,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// A value is outside its allowed range.
    #[error("invalid config value for '{key}': {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// Why it was rejected.
        reason: String,
    },
}

impl ConfigError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Per-endpoint rate-limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Fixed window length.
    pub window_secs: u64,
    /// Maximum accepted submissions per client per window.
    pub submit_ceiling: u32,
    /// Maximum accepted synchronous downloads per client per window.
    pub sync_ceiling: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            submit_ceiling: 10,
            sync_ceiling: 5,
        }
    }
}

/// TTL per cache entry class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheTtlConfig {
    /// Extractor format lists.
    pub formats_secs: u64,
    /// Final task results served by status queries.
    pub result_secs: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            formats_secs: 3600,
            result_secs: 600,
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub database_path: PathBuf,
    pub media_root: PathBuf,
    pub cookie_dir: PathBuf,
    pub worker_concurrency: usize,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_max_secs: u64,
    pub backoff_jitter_ms: u64,
    pub extraction_timeout_secs: u64,
    pub file_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_interval_ms: u64,
    pub stale_task_secs: u64,
    pub sync_wait_timeout_secs: u64,
    pub ytdlp_program: String,
    pub rate_limit: RateLimitConfig,
    pub cache_ttl: CacheTtlConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("mediafetch.db"),
            media_root: PathBuf::from("media"),
            cookie_dir: PathBuf::from("cookies"),
            worker_concurrency: 4,
            max_attempts: 3,
            backoff_base_secs: 5,
            backoff_max_secs: 600,
            backoff_jitter_ms: 0,
            extraction_timeout_secs: 30 * 60,
            file_ttl_secs: 24 * 60 * 60,
            sweep_interval_secs: 60 * 60,
            poll_interval_ms: 500,
            stale_task_secs: 60 * 60,
            sync_wait_timeout_secs: 120,
            ytdlp_program: "yt-dlp".to_string(),
            rate_limit: RateLimitConfig::default(),
            cache_ttl: CacheTtlConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a TOML file, falling back to defaults for missing keys.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Read`] or [`ConfigError::Parse`].
    #[instrument(fields(path = %path.display()))]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("config file loaded");
        Ok(config)
    }

    /// Parses configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns the TOML deserialization error on malformed input.
    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first bad key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !WORKER_CONCURRENCY_RANGE.contains(&self.worker_concurrency) {
            return Err(ConfigError::invalid(
                "worker_concurrency",
                format!(
                    "{} is outside {}..={}",
                    self.worker_concurrency,
                    WORKER_CONCURRENCY_RANGE.start(),
                    WORKER_CONCURRENCY_RANGE.end()
                ),
            ));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if self.backoff_max_secs < self.backoff_base_secs {
            return Err(ConfigError::invalid(
                "backoff_max_secs",
                "must not be smaller than backoff_base_secs",
            ));
        }
        for (key, value) in [
            ("extraction_timeout_secs", self.extraction_timeout_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("rate_limit.window_secs", self.rate_limit.window_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if self.stale_task_secs <= self.extraction_timeout_secs {
            return Err(ConfigError::invalid(
                "stale_task_secs",
                format!(
                    "{} must exceed extraction_timeout_secs ({}) or running tasks get requeued",
                    self.stale_task_secs, self.extraction_timeout_secs
                ),
            ));
        }
        if self.rate_limit.submit_ceiling == 0 || self.rate_limit.sync_ceiling == 0 {
            return Err(ConfigError::invalid(
                "rate_limit",
                "ceilings must be greater than zero",
            ));
        }
        if self.ytdlp_program.trim().is_empty() {
            return Err(ConfigError::invalid("ytdlp_program", "must not be empty"));
        }
        Ok(())
    }

    /// Cache TTLs as the engine applies them.
    ///
    /// A cached result never outlives the file it points at, so
    /// `result_secs` is clamped to `file_ttl_secs`.
    #[must_use]
    pub fn effective_cache_ttl(&self) -> CacheTtlConfig {
        CacheTtlConfig {
            formats_secs: self.cache_ttl.formats_secs,
            result_secs: self.cache_ttl.result_secs.min(self.file_ttl_secs),
        }
    }

    #[must_use]
    pub fn file_ttl(&self) -> Duration {
        Duration::from_secs(self.file_ttl_secs)
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    #[must_use]
    pub fn extraction_timeout(&self) -> Duration {
        Duration::from_secs(self.extraction_timeout_secs)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn stale_task_after(&self) -> Duration {
        Duration::from_secs(self.stale_task_secs)
    }

    #[must_use]
    pub fn sync_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.sync_wait_timeout_secs)
    }

    #[must_use]
    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit.window_secs)
    }
}
