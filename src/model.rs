//! Core data model for the telemetry engine
//!
//! This module defines the fundamental data structures shared across the
//! engine: series identities and samples, health check results, spans and
//! trace contexts, and the severity scale used by alerting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Timestamp type for consistent time handling across the engine
pub type Timestamp = DateTime<Utc>;

/// Identity of a metric series: metric name plus its sorted label set
///
/// The label map is a `BTreeMap`, so two keys built from the same labels in
/// any insertion order compare equal, and rendering a key always produces
/// the same label ordering. This is what makes exposition output stable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    /// Metric name, e.g. `service_probe_latency_ms`
    pub metric: String,
    /// Sorted label set identifying this stream within the metric
    pub labels: BTreeMap<String, String>,
}

impl SeriesKey {
    /// Create a series key from a metric name and label pairs
    pub fn new(metric: impl Into<String>, labels: &[(&str, &str)]) -> Self {
        Self {
            metric: metric.into(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Create a label-free series key
    pub fn bare(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Value of a single label, if present
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }
}

impl fmt::Display for SeriesKey {
    /// Renders `metric{k="v",...}`, or just `metric` when label-free.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric)?;
        if self.labels.is_empty() {
            return Ok(());
        }
        write!(f, "{{")?;
        for (i, (k, v)) in self.labels.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\""))?;
        }
        write!(f, "}}")
    }
}

/// A single timestamped value within a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: Timestamp,
    pub value: f64,
}

/// Outcome classification of a health probe
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Probe succeeded within the success range
    Healthy,
    /// Probe responded, but outside the success range (slow or bad status)
    Degraded,
    /// No usable response within the timeout
    Unhealthy,
}

impl HealthStatus {
    /// Gauge encoding written to the `service_healthy` series
    pub fn as_gauge(&self) -> f64 {
        match self {
            HealthStatus::Healthy => 1.0,
            HealthStatus::Degraded | HealthStatus::Unhealthy => 0.0,
        }
    }
}

/// Result of a single probe against a registered service endpoint
///
/// Produced only by the health prober and immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HealthCheckResult {
    /// Identity of the probed service
    pub service: String,
    /// When the probe completed
    pub timestamp: Timestamp,
    /// Classified outcome
    pub status: HealthStatus,
    /// Round-trip latency in milliseconds (up to the timeout on failure)
    pub latency_ms: f64,
    /// Error detail for degraded/unhealthy outcomes
    pub error: Option<String>,
}

/// Severity level for alert rules and alert events
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational, no action required
    Info,
    /// May require attention
    Warning,
    /// Requires immediate attention
    Critical,
}

/// Completion status of a span
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SpanStatus {
    Ok,
    Error,
}

/// Scalar value kinds allowed in span attributes
///
/// Label names stay free-form; values are constrained to this bounded set so
/// attribute maps remain type-checked end to end.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// A finished, committed span
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Span {
    /// Trace this span belongs to
    pub trace_id: String,
    /// Unique identifier of this span
    pub span_id: String,
    /// Declared parent span, if any
    pub parent_span_id: Option<String>,
    /// Name of the traced operation
    pub operation: String,
    /// Service that performed the operation
    pub service: String,
    /// When the operation started
    pub start_time: Timestamp,
    /// Wall-clock duration in milliseconds
    pub duration_ms: f64,
    /// Typed attribute map
    pub attributes: BTreeMap<String, AttrValue>,
    /// Completion status
    pub status: SpanStatus,
}

/// Explicit trace propagation context
///
/// Callers forward this along the call chain by hand; nothing flows
/// implicitly. Starting a span with a context nests it under the context's
/// span within the same trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
}
