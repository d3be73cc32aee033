//! Configuration file loading.
//!
//! A config file is TOML with optional `[batch]` and `[logging]` tables:
//!
//! ```toml
//! [batch]
//! max_concurrent_batches = 8
//! request_timeout_ms = 10000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use crate::batch::config::BatchConfig;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VolleyConfig {
    /// Batch engine settings.
    #[serde(default)]
    pub batch: BatchConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VolleyConfig {
    /// Parses and validates configuration from TOML text.
    ///
    /// # Errors
    /// Returns error if the text is not valid TOML or a value is out of range.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config
            .batch
            .validate()
            .map_err(|e| ConfigError::Validation(format!("Invalid batch configuration: {}", e)))?;
        Ok(config)
    }
}

/// Load configuration from `path`.
///
/// A missing file yields the defaults; missing tables or keys fall back to
/// their defaults as well.
///
/// # Errors
/// Returns error if the file exists but cannot be read, parsed, or validated.
pub fn load_config(path: &Path) -> Result<VolleyConfig, ConfigError> {
    if !path.exists() {
        return Ok(VolleyConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    VolleyConfig::from_toml_str(&content)
}

/// Get the default config file path under `root`.
///
/// # Returns
/// Path to `.volley/config.toml`
#[must_use]
pub fn default_config_path(root: &Path) -> PathBuf {
    root.join(".volley").join("config.toml")
}
