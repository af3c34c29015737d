/// Error types for the telemetry engine
pub mod error;

/// Core data model: series keys, samples, health and span types
pub mod model;

/// Time series storage with retention enforcement
pub mod store;

/// Periodic health probing of service endpoints
pub mod probe;

/// Process and host resource metrics collection
pub mod collectors;

/// Span recording and trace reconstruction
pub mod trace;

/// Alert rules and rule evaluation
pub mod detect;

/// Alert event lifecycle management
pub mod alerts;

/// Snapshot export and the scrape endpoint
pub mod export;

/// Engine configuration
pub mod config;

/// Engine assembly and lifecycle
pub mod engine;

// Re-export commonly used types
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{CollectError, ConfigError, ExportError, ProbeError, StoreError};
pub use model::{HealthStatus, MetricSample, SeriesKey, Severity, Span, Timestamp};
