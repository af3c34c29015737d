//! Engine configuration
//!
//! TOML-deserialized settings consumed by the engine at construction time.
//! Components never read configuration themselves; they receive the values
//! they need through their constructors. A missing config file falls back to
//! defaults with a warning, an invalid one is a hard error at validation.

use crate::error::ConfigError;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Sample and alert history retention limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetentionConfig {
    /// Samples older than this are pruned from every series
    pub max_age_seconds: i64,
    /// Hard per-series sample cap, enforced on write
    pub max_samples_per_series: usize,
    /// Hard cap on retained resolved alert events
    pub history_max_events: usize,
    /// Resolved alert events older than this are pruned
    pub history_retention_seconds: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_seconds: 3600,
            max_samples_per_series: 10_000,
            history_max_events: 1000,
            history_retention_seconds: 86_400,
        }
    }
}

/// Store write and maintenance behavior
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// Late samples within this window are clamped instead of rejected
    pub skew_tolerance_ms: i64,
    /// How often the background pruner runs
    pub prune_interval_seconds: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            skew_tolerance_ms: 2000,
            prune_interval_seconds: 60,
        }
    }
}

/// Health probe scheduling and classification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProbeConfig {
    /// Probe interval for services without a per-service override
    pub default_interval_seconds: u64,
    /// Hard timeout for a single probe round trip
    pub timeout_ms: u64,
    /// Successful responses slower than this classify as degraded
    pub degraded_threshold_ms: f64,
    /// Bound on concurrent outbound probes
    pub worker_pool_size: usize,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_interval_seconds: 30,
            timeout_ms: 5000,
            degraded_threshold_ms: 1000.0,
            worker_pool_size: 8,
        }
    }
}

/// Resource collector sampling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CollectConfig {
    pub interval_seconds: u64,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 15,
        }
    }
}

/// Rule evaluation cadence
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DetectConfig {
    pub interval_seconds: u64,
}

impl Default for DetectConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 5,
        }
    }
}

/// Scrape endpoint exposure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExportConfig {
    pub listen_addr: String,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:9464".to_string(),
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub retention: RetentionConfig,
    pub store: StoreConfig,
    pub probe: ProbeConfig,
    pub collect: CollectConfig,
    pub detect: DetectConfig,
    pub export: ExportConfig,
}

impl EngineConfig {
    /// Read and validate a configuration file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read,
    /// `ConfigError::TomlError` if it is not valid TOML and
    /// `ConfigError::ValidationError` if a value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let config: EngineConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, or fall back to defaults
    ///
    /// An unreadable or invalid file is reported and replaced by defaults so
    /// a bad deployment never prevents the engine from starting.
    pub fn load(path: Option<&Path>) -> Self {
        match path {
            Some(path) => {
                info!("loading configuration from {}", path.display());
                match Self::from_file(path) {
                    Ok(config) => config,
                    Err(ConfigError::ReadError(e)) => {
                        warn!("config file unreadable ({}), using defaults", e);
                        Self::default()
                    }
                    Err(e) => {
                        warn!("invalid config file ({}), using defaults", e);
                        Self::default()
                    }
                }
            }
            None => {
                info!("using default configuration");
                Self::default()
            }
        }
    }

    /// Check value ranges
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retention.max_age_seconds <= 0 {
            return Err(ConfigError::ValidationError(
                "retention.max_age_seconds must be positive".to_string(),
            ));
        }
        if self.retention.max_samples_per_series == 0 {
            return Err(ConfigError::ValidationError(
                "retention.max_samples_per_series must be positive".to_string(),
            ));
        }
        if self.retention.history_retention_seconds <= 0 {
            return Err(ConfigError::ValidationError(
                "retention.history_retention_seconds must be positive".to_string(),
            ));
        }
        if self.store.skew_tolerance_ms < 0 {
            return Err(ConfigError::ValidationError(
                "store.skew_tolerance_ms must not be negative".to_string(),
            ));
        }
        if self.store.prune_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "store.prune_interval_seconds must be positive".to_string(),
            ));
        }
        if self.probe.default_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "probe.default_interval_seconds must be positive".to_string(),
            ));
        }
        if self.probe.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe.timeout_ms must be positive".to_string(),
            ));
        }
        if self.probe.worker_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "probe.worker_pool_size must be positive".to_string(),
            ));
        }
        if self.collect.interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "collect.interval_seconds must be positive".to_string(),
            ));
        }
        if self.detect.interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "detect.interval_seconds must be positive".to_string(),
            ));
        }
        self.listen_addr()?;
        Ok(())
    }

    /// Parsed scrape listen address
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.export.listen_addr.parse().map_err(|_| {
            ConfigError::ValidationError(format!(
                "export.listen_addr '{}' is not a valid socket address",
                self.export.listen_addr
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.probe.default_interval_seconds, 30);
    }

    #[test]
    fn test_from_file_parses_partial_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[probe]\ntimeout_ms = 250\n\n[export]\nlisten_addr = \"0.0.0.0:9000\"\n"
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.probe.timeout_ms, 250);
        // Unspecified sections keep their defaults.
        assert_eq!(config.probe.default_interval_seconds, 30);
        assert_eq!(config.collect, CollectConfig::default());
        assert_eq!(config.listen_addr().unwrap().port(), 9000);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[probe]\ntimeout_ms = 0\n").unwrap();

        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_from_file_rejects_malformed_toml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();

        let err = EngineConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::TomlError(_)));
    }

    #[test]
    fn test_load_missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Some(Path::new("/nonexistent/vantage.toml")));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_load_invalid_file_falls_back_to_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[export]\nlisten_addr = \"not-an-addr\"\n").unwrap();

        let config = EngineConfig::load(Some(file.path()));
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_round_trip() {
        let config = EngineConfig::default();
        let serialized = toml::to_string(&config).unwrap();
        let parsed: EngineConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed, config);
    }
}
