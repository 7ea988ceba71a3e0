//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration, optional)
//! 2. environment variables prefixed with `FRAMESRC_`, nested with `__`
//!
//! # Environment Variable Overrides
//!
//! ```text
//! FRAMESRC_ARCHIVE__CAPACITY=8
//! FRAMESRC_ARCHIVE__FLUSH_TIMEOUT_MS=250
//! FRAMESRC_LOGGING__LEVEL=debug
//! ```
//!
//! # Example
//!
//! ```no_run
//! use frame_source::config::SourceConfig;
//!
//! let config = SourceConfig::load_from("config/frame_source.toml")?;
//! println!("Capacity: {}", config.archive.capacity);
//! # Ok::<(), frame_source::config::ConfigError>(())
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::option::FRAME_QUEUE_SIZE_RANGE;

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/frame_source.toml";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] figment::Error),
    #[error("Configuration serialization error: {0}")]
    SerializeError(#[from] toml::ser::Error),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Frame archive settings
    #[serde(default)]
    pub archive: ArchiveSettings,
    /// Logging settings
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Frame archive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Initial admission capacity for every archive (0-32)
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    /// How long `flush()` waits for outstanding frames, in milliseconds
    #[serde(default = "default_flush_timeout")]
    pub flush_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_capacity() -> u32 {
    FRAME_QUEUE_SIZE_RANGE.default as u32
}

fn default_flush_timeout() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            flush_timeout_ms: default_flush_timeout(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl SourceConfig {
    /// Load configuration from [`DEFAULT_CONFIG_PATH`] and the environment.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file is malformed or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path.
    ///
    /// A missing file is not an error; defaults apply. Precedence, highest
    /// first: environment variables, the file, built-in defaults.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("FRAMESRC_").split("__"))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Capacity is within the frame queue size range
    /// - Flush timeout is non-zero
    /// - Log level is valid
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !FRAME_QUEUE_SIZE_RANGE.is_valid(self.archive.capacity as f32) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid archive capacity {}. Must be {}-{}",
                self.archive.capacity, FRAME_QUEUE_SIZE_RANGE.min, FRAME_QUEUE_SIZE_RANGE.max
            )));
        }

        if self.archive.flush_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "Invalid flush_timeout_ms 0. Must be > 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            )));
        }

        Ok(())
    }

    /// Flush timeout as a `Duration`.
    #[must_use]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.archive.flush_timeout_ms)
    }

    /// Render the effective configuration as TOML.
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp config");
        file.write_all(contents.as_bytes()).expect("write temp config");
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SourceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.archive.capacity, 16);
        assert_eq!(config.flush_timeout(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = SourceConfig::load_from(dir.path().join("absent.toml")).expect("defaults");
        assert_eq!(config.archive.capacity, 16);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_load_partial_file() {
        let file = write_config(
            r#"
            [archive]
            capacity = 4

            [logging]
            json = true
            "#,
        );

        let config = SourceConfig::load_from(file.path()).expect("valid config");
        assert_eq!(config.archive.capacity, 4);
        assert_eq!(config.archive.flush_timeout_ms, 1000);
        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_capacity_out_of_range_rejected() {
        let file = write_config("[archive]\ncapacity = 64\n");

        let result = SourceConfig::load_from(file.path());
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid archive capacity"));
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = SourceConfig::default();
        config.logging.level = "loud".to_string();

        let result = config.validate();
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_zero_flush_timeout_rejected() {
        let mut config = SourceConfig::default();
        config.archive.flush_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_file_is_load_error() {
        let file = write_config("[archive\ncapacity = ");
        let result = SourceConfig::load_from(file.path());
        assert!(matches!(result, Err(ConfigError::LoadError(_))));
    }

    #[test]
    fn test_toml_round_trip() {
        let config = SourceConfig::default();
        let rendered = config.to_toml().expect("serializable");
        assert!(rendered.contains("capacity = 16"));

        let file = write_config(&rendered);
        assert_eq!(SourceConfig::load_from(file.path()).expect("valid"), config);
    }
}
