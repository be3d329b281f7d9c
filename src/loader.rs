//! Configuration loading
//!
//! Handles loading configuration from embedded defaults, files, and environment.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use mneme_core::MemoryConfig;
use serde::{Deserialize, Serialize};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Output format
    #[serde(default)]
    pub format: LogFormat,
}

/// Top-level application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Cache, archive and write-back settings
    #[serde(default)]
    pub memory: MemoryConfig,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Load configuration from files and environment
pub fn load_config() -> Result<AppConfig> {
    let env = std::env::var("MNEME_ENV").unwrap_or_else(|_| "development".to_string());
    let config = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. External overrides (optional)
        .add_source(File::with_name("config/default").required(false))
        .add_source(File::with_name(&format!("config/{}", env)).required(false))
        .add_source(File::with_name("config/local").required(false))
        // 3. Environment variables (highest priority), MNEME_MEMORY__CACHE__TTL_SECS
        .add_source(
            Environment::with_prefix("MNEME")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}
