use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors signaled by the time series store
#[derive(Error, Debug)]
pub enum StoreError {
    /// The sample is older than the series tail by more than the skew
    /// tolerance. Callers log and drop the sample; subsequent writes to the
    /// same series are unaffected.
    #[error("out-of-order sample for '{series}': {timestamp} predates {last_seen} beyond skew tolerance")]
    OutOfOrderSample {
        series: String,
        timestamp: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    },

    /// The store can no longer accept writes at all. Every other component
    /// depends on the store, so this is the one engine-fatal condition.
    #[error("time series store unavailable: {0}")]
    Unavailable(String),
}

/// Errors local to a single health probe attempt
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("probe connection failed: {0}")]
    ConnectionFailed(String),
}

/// Errors local to one metric read in the resource collector
#[derive(Error, Debug)]
pub enum CollectError {
    #[error("failed to read metric '{metric}': {detail}")]
    MetricReadFailed { metric: String, detail: String },
}

/// Errors rejected synchronously at the exporter boundary
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("unsupported export format: '{0}' (expected exposition, structured or json)")]
    UnsupportedFormat(String),

    #[error("failed to serialize export payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
