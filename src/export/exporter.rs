//! Snapshot exporter
//!
//! Renders read-only snapshots of the store, recorder and alert manager in
//! three formats. The exporter holds no state of its own and never mutates
//! the components it reads; identical component state renders to identical
//! bytes.

use crate::alerts::{AlertEvent, AlertManager};
use crate::error::ExportError;
use crate::model::{MetricSample, SeriesKey, Span, Timestamp};
use crate::store::{LabelFilter, TimeSeriesStore};
use crate::trace::{Trace, TraceRecorder};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::str::FromStr;
use std::sync::Arc;

/// Output format of a rendering pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    /// Plain-text `key value` lines of current series values
    Exposition,
    /// Per-service records carrying metrics and spans
    Structured,
    /// Direct JSON mirror of the engine's data model
    Json,
}

impl FromStr for ExportFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "exposition" | "prometheus" => Ok(ExportFormat::Exposition),
            "structured" | "opentelemetry" => Ok(ExportFormat::Structured),
            "json" => Ok(ExportFormat::Json),
            other => Err(ExportError::UnsupportedFormat(other.to_string())),
        }
    }
}

/// Narrows a rendering pass to matching series and a time range
#[derive(Debug, Clone, Default)]
pub struct ExportFilter {
    pub label: Option<LabelFilter>,
    pub range: Option<(Timestamp, Timestamp)>,
}

/// One series with the samples that fell inside the filter range
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeriesRecord {
    pub metric: String,
    pub labels: BTreeMap<String, String>,
    pub samples: Vec<MetricSample>,
}

/// All telemetry attributed to one service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub service: String,
    pub metrics: Vec<SeriesRecord>,
    pub spans: Vec<Span>,
}

#[derive(Debug, Serialize)]
struct JsonReport {
    generated_at: Timestamp,
    series: Vec<SeriesRecord>,
    traces: Vec<Trace>,
    alerts: Vec<AlertEvent>,
}

/// Renders snapshots of the other components; owns nothing itself
pub struct Exporter {
    store: Arc<TimeSeriesStore>,
    recorder: Arc<TraceRecorder>,
    alerts: Arc<AlertManager>,
}

impl Exporter {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        recorder: Arc<TraceRecorder>,
        alerts: Arc<AlertManager>,
    ) -> Self {
        Self {
            store,
            recorder,
            alerts,
        }
    }

    /// Render a snapshot in the requested format
    ///
    /// # Errors
    ///
    /// Returns `ExportError::Serialization` if JSON encoding fails.
    pub fn render(&self, format: ExportFormat, filter: &ExportFilter) -> Result<String, ExportError> {
        match format {
            ExportFormat::Exposition => Ok(self.render_exposition(filter)),
            ExportFormat::Structured => self.render_structured(filter),
            ExportFormat::Json => self.render_json(filter),
        }
    }

    /// Current series values as sorted `key value` lines
    pub fn render_exposition(&self, filter: &ExportFilter) -> String {
        let mut lines: Vec<(String, f64)> = self
            .selected_series(filter)
            .into_iter()
            .filter_map(|key| {
                self.store
                    .latest(&key)
                    .map(|sample| (key.to_string(), sample.value))
            })
            .collect();
        lines.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = String::new();
        for (key, value) in lines {
            let _ = writeln!(out, "{} {}", key, value);
        }
        out
    }

    /// Per-service records, sorted by service name
    ///
    /// Series without a `service` label are attributed to the empty-named
    /// record.
    fn render_structured(&self, filter: &ExportFilter) -> Result<String, ExportError> {
        let mut records: BTreeMap<String, ResourceRecord> = BTreeMap::new();

        for record in self.series_records(filter) {
            let service = record
                .labels
                .get("service")
                .cloned()
                .unwrap_or_default();
            records
                .entry(service.clone())
                .or_insert_with(|| ResourceRecord {
                    service,
                    metrics: Vec::new(),
                    spans: Vec::new(),
                })
                .metrics
                .push(record);
        }

        let mut spans = self.recorder.all_spans();
        spans.sort_by(|a, b| (a.start_time, &a.span_id).cmp(&(b.start_time, &b.span_id)));
        for span in spans {
            let service = span.service.clone();
            records
                .entry(service.clone())
                .or_insert_with(|| ResourceRecord {
                    service,
                    metrics: Vec::new(),
                    spans: Vec::new(),
                })
                .spans
                .push(span);
        }

        let records: Vec<&ResourceRecord> = records.values().collect();
        serde_json::to_string_pretty(&records).map_err(ExportError::from)
    }

    /// Direct JSON mirror of series, traces and alert events
    fn render_json(&self, filter: &ExportFilter) -> Result<String, ExportError> {
        let mut trace_ids: Vec<String> = self
            .recorder
            .all_spans()
            .into_iter()
            .map(|span| span.trace_id)
            .collect();
        trace_ids.sort();
        trace_ids.dedup();
        let traces: Vec<Trace> = trace_ids
            .iter()
            .filter_map(|id| self.recorder.get_trace(id))
            .collect();

        let mut alerts = self.alerts.active_alerts();
        alerts.extend(self.alerts.recent_history(chrono::Duration::hours(24)));

        let report = JsonReport {
            generated_at: Utc::now(),
            series: self.series_records(filter),
            traces,
            alerts,
        };
        serde_json::to_string_pretty(&report).map_err(ExportError::from)
    }

    fn selected_series(&self, filter: &ExportFilter) -> Vec<SeriesKey> {
        let label_filter = filter.label.clone().unwrap_or(LabelFilter::All);
        self.store.list_series(&label_filter)
    }

    fn series_records(&self, filter: &ExportFilter) -> Vec<SeriesRecord> {
        let (from, to) = filter
            .range
            .unwrap_or((chrono::DateTime::<Utc>::MIN_UTC, chrono::DateTime::<Utc>::MAX_UTC));
        let mut records: Vec<SeriesRecord> = self
            .selected_series(filter)
            .into_iter()
            .map(|key| SeriesRecord {
                samples: self.store.query(&key, from, to),
                metric: key.metric.clone(),
                labels: key.labels,
            })
            .collect();
        records.sort_by(|a, b| (&a.metric, &a.labels).cmp(&(&b.metric, &b.labels)));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use crate::store::RetentionPolicy;
    use chrono::Duration;

    fn setup() -> (Arc<TimeSeriesStore>, Arc<TraceRecorder>, Arc<AlertManager>, Exporter) {
        let store = Arc::new(TimeSeriesStore::new(
            RetentionPolicy::default(),
            Duration::seconds(2),
        ));
        let recorder = Arc::new(TraceRecorder::new(Duration::hours(1)));
        let alerts = Arc::new(AlertManager::new(Duration::hours(1), 100));
        let exporter = Exporter::new(Arc::clone(&store), Arc::clone(&recorder), Arc::clone(&alerts));
        (store, recorder, alerts, exporter)
    }

    #[test]
    fn test_unknown_format_rejected() {
        let err = "csv".parse::<ExportFormat>().unwrap_err();
        assert!(matches!(err, ExportError::UnsupportedFormat(f) if f == "csv"));
    }

    #[test]
    fn test_format_aliases() {
        assert_eq!("prometheus".parse::<ExportFormat>().unwrap(), ExportFormat::Exposition);
        assert_eq!("opentelemetry".parse::<ExportFormat>().unwrap(), ExportFormat::Structured);
        assert_eq!("JSON".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
    }

    #[test]
    fn test_exposition_sorted_by_metric_then_labels() {
        let (store, _, _, exporter) = setup();
        let now = Utc::now();
        store
            .write(&SeriesKey::new("cpu", &[("service", "y")]), now, 2.0)
            .unwrap();
        store
            .write(&SeriesKey::new("cpu", &[("service", "x")]), now, 1.0)
            .unwrap();
        store.write(&SeriesKey::bare("alloc"), now, 3.0).unwrap();

        let text = exporter.render_exposition(&ExportFilter::default());
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "alloc 3");
        assert_eq!(lines[1], r#"cpu{service="x"} 1"#);
        assert_eq!(lines[2], r#"cpu{service="y"} 2"#);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_exposition_rendering_is_idempotent() {
        let (store, _, _, exporter) = setup();
        let now = Utc::now();
        for i in 0..10 {
            let key = SeriesKey::new("m", &[("service", &format!("s{}", i))]);
            store.write(&key, now, i as f64).unwrap();
        }
        let first = exporter.render_exposition(&ExportFilter::default());
        let second = exporter.render_exposition(&ExportFilter::default());
        assert_eq!(first, second);
    }

    #[test]
    fn test_exposition_respects_label_filter() {
        let (store, _, _, exporter) = setup();
        let now = Utc::now();
        store
            .write(&SeriesKey::new("cpu", &[("service", "a")]), now, 1.0)
            .unwrap();
        store
            .write(&SeriesKey::new("cpu", &[("service", "b")]), now, 2.0)
            .unwrap();

        let filter = ExportFilter {
            label: Some(LabelFilter::Equals("service".into(), "a".into())),
            range: None,
        };
        let text = exporter.render_exposition(&filter);
        assert_eq!(text, "cpu{service=\"a\"} 1\n");
    }

    #[test]
    fn test_structured_groups_by_service() {
        let (store, recorder, _, exporter) = setup();
        let now = Utc::now();
        store
            .write(&SeriesKey::new("cpu", &[("service", "api")]), now, 1.0)
            .unwrap();
        let handle = recorder.start_span("handle_request", "api", None);
        recorder.finish_span(handle, crate::model::SpanStatus::Ok, BTreeMap::new());

        let out = exporter
            .render(ExportFormat::Structured, &ExportFilter::default())
            .unwrap();
        let records: Vec<ResourceRecord> = serde_json::from_str(&out).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].service, "api");
        assert_eq!(records[0].metrics.len(), 1);
        assert_eq!(records[0].spans.len(), 1);
        assert_eq!(records[0].spans[0].operation, "handle_request");
    }

    #[test]
    fn test_json_report_shape() {
        let (store, _, alerts, exporter) = setup();
        let now = Utc::now();
        store.write(&SeriesKey::bare("cpu"), now, 1.0).unwrap();
        alerts.fire("high_cpu", Severity::Warning, 95.0);

        let out = exporter
            .render(ExportFormat::Json, &ExportFilter::default())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert!(value["generated_at"].is_string());
        assert_eq!(value["series"].as_array().unwrap().len(), 1);
        assert_eq!(value["series"][0]["metric"], "cpu");
        assert_eq!(value["alerts"][0]["rule"], "high_cpu");
        assert!(value["traces"].as_array().unwrap().is_empty());
    }

    #[test]
    fn test_series_records_sorted_by_metric_then_labels() {
        let (store, _, _, exporter) = setup();
        let now = Utc::now();
        store
            .write(&SeriesKey::new("cpu", &[("service", "y")]), now, 2.0)
            .unwrap();
        store
            .write(&SeriesKey::new("cpu", &[("service", "x")]), now, 1.0)
            .unwrap();
        store.write(&SeriesKey::bare("alloc"), now, 3.0).unwrap();

        let out = exporter
            .render(ExportFormat::Json, &ExportFilter::default())
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        let series = value["series"].as_array().unwrap();
        assert_eq!(series[0]["metric"], "alloc");
        assert_eq!(series[1]["labels"]["service"], "x");
        assert_eq!(series[2]["labels"]["service"], "y");
    }

    #[test]
    fn test_range_filter_limits_samples() {
        let (store, _, _, exporter) = setup();
        let base = Utc::now();
        let key = SeriesKey::bare("cpu");
        for i in 0..5 {
            store
                .write(&key, base + Duration::seconds(i), i as f64)
                .unwrap();
        }

        let filter = ExportFilter {
            label: None,
            range: Some((base + Duration::seconds(2), base + Duration::seconds(3))),
        };
        let out = exporter.render(ExportFormat::Json, &filter).unwrap();
        let value: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(value["series"][0]["samples"].as_array().unwrap().len(), 2);
    }
}
