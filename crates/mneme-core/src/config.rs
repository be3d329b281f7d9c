//! Memory configuration
//!
//! `ttl` and `safety_margin` are coupled: a write-back fires `safety_margin`
//! before the cache entry expires, so `safety_margin < ttl` is enforced by
//! [`MemoryConfig::validate`] at startup.

use crate::error::{Error, Result};
use crate::utils::RetryConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Check if running in production environment
pub fn is_production() -> bool {
    std::env::var("MNEME_ENV")
        .map(|v| v.to_lowercase() == "production")
        .unwrap_or(false)
}

/// Complete memory configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Cache tier settings
    #[serde(default)]
    pub cache: CacheConfig,
    /// Archival tier settings
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Write-back scheduling settings
    #[serde(default)]
    pub write_back: WriteBackConfig,
}

/// Cache tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Backend type: "memory" (default) or "redis"
    #[serde(default = "default_cache_backend")]
    pub backend: String,
    /// Redis URL (only used when backend = "redis")
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Key prefix for cached threads
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Cache entry lifetime in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_cache_backend() -> String {
    "memory".to_string()
}

fn default_prefix() -> String {
    "chat:".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: default_cache_backend(),
            redis_url: None,
            prefix: default_prefix(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

impl CacheConfig {
    /// Cache TTL
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Archival tier configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Backend type: "sqlite" (default) or "memory"
    #[serde(default = "default_archive_backend")]
    pub backend: String,
    /// SQLite database path; relative paths resolve under `~/.mneme`
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

fn default_archive_backend() -> String {
    "sqlite".to_string()
}

fn default_sqlite_path() -> String {
    "threads.db".to_string()
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            backend: default_archive_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl ArchiveConfig {
    /// Resolve the SQLite path against the data directory
    ///
    /// # Errors
    ///
    /// Returns error if the home directory cannot be determined for a
    /// relative path.
    pub fn resolved_sqlite_path(&self) -> Result<PathBuf> {
        let path = PathBuf::from(&self.sqlite_path);
        if path.is_absolute() {
            return Ok(path);
        }
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Internal("Could not determine home directory".to_string()))?;
        Ok(home.join(".mneme").join(path))
    }
}

/// Write-back scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBackConfig {
    /// Seconds before cache expiry at which a write-back fires
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,
    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// Multiplier for exponential backoff
    #[serde(default = "default_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// Attempts for an explicit (non-scheduled) write-back
    #[serde(default = "default_max_attempts")]
    pub retry_max_attempts: u32,
}

fn default_safety_margin_secs() -> u64 {
    300
}

fn default_initial_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u32 {
    5
}

impl Default for WriteBackConfig {
    fn default() -> Self {
        Self {
            safety_margin_secs: default_safety_margin_secs(),
            retry_initial_delay_ms: default_initial_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_backoff_multiplier: default_backoff_multiplier(),
            retry_max_attempts: default_max_attempts(),
        }
    }
}

impl WriteBackConfig {
    /// Safety margin before expiry
    #[must_use]
    pub fn safety_margin(&self) -> Duration {
        Duration::from_secs(self.safety_margin_secs)
    }

    /// Backoff policy for archive writes
    #[must_use]
    pub fn retry(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.retry_max_attempts)
            .with_initial_delay(Duration::from_millis(self.retry_initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_backoff_multiplier(self.retry_backoff_multiplier)
    }
}

impl MemoryConfig {
    /// Build a config from explicit durations, other settings default
    #[must_use]
    pub fn with_timing(ttl: Duration, safety_margin: Duration) -> Self {
        let mut config = Self::default();
        config.cache.ttl_secs = ttl.as_secs();
        config.write_back.safety_margin_secs = safety_margin.as_secs();
        config
    }

    /// Validate invariants, including production restrictions from `MNEME_ENV`
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        self.validate_for(is_production())
    }

    /// Validate invariants for an explicit environment
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the offending field.
    pub fn validate_for(&self, production: bool) -> Result<()> {
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs", "must be positive"));
        }
        if self.write_back.safety_margin_secs >= self.cache.ttl_secs {
            return Err(invalid(
                "write_back.safety_margin_secs",
                &format!(
                    "must be smaller than cache.ttl_secs ({} >= {})",
                    self.write_back.safety_margin_secs, self.cache.ttl_secs
                ),
            ));
        }
        if self.write_back.retry_max_attempts == 0 {
            return Err(invalid("write_back.retry_max_attempts", "must be at least 1"));
        }
        if self.write_back.retry_backoff_multiplier < 1.0 {
            return Err(invalid(
                "write_back.retry_backoff_multiplier",
                "must be at least 1.0",
            ));
        }

        match self.cache.backend.as_str() {
            "memory" => {}
            "redis" if self.cache.redis_url.is_some() => {}
            "redis" => return Err(invalid("cache.redis_url", "required for redis backend")),
            other => {
                return Err(invalid(
                    "cache.backend",
                    &format!("unknown backend '{}'. Use 'memory' or 'redis'.", other),
                ))
            }
        }

        match self.archive.backend.as_str() {
            "sqlite" => {}
            "memory" if production => {
                return Err(invalid(
                    "archive.backend",
                    "memory archive is not durable and is not allowed in production",
                ))
            }
            "memory" => {}
            other => {
                return Err(invalid(
                    "archive.backend",
                    &format!("unknown backend '{}'. Use 'sqlite' or 'memory'.", other),
                ))
            }
        }

        Ok(())
    }
}

fn invalid(field: &str, message: &str) -> Error {
    Error::InvalidConfig {
        field: field.to_string(),
        message: message.to_string(),
    }
}
