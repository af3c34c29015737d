//! Alert rule definitions
//!
//! Rules are configured externally and consumed read-only by the detector
//! and alert manager. A rule whose selector matches no existing series is
//! valid; it simply never fires until matching data appears.

use crate::model::{SeriesKey, Severity};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Selects the series a rule applies to
///
/// A series matches when its metric name equals `metric` and its label set
/// contains every label listed here (subset match; an empty label map selects
/// all series of the metric).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesSelector {
    pub metric: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl SeriesSelector {
    pub fn metric(metric: impl Into<String>) -> Self {
        Self {
            metric: metric.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn matches(&self, key: &SeriesKey) -> bool {
        key.metric == self.metric
            && self
                .labels
                .iter()
                .all(|(name, value)| key.label(name) == Some(value.as_str()))
    }
}

/// Comparison operator for threshold conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
}

impl CmpOp {
    pub fn holds(&self, value: f64, bound: f64) -> bool {
        match self {
            CmpOp::Gt => value > bound,
            CmpOp::Lt => value < bound,
            CmpOp::Ge => value >= bound,
            CmpOp::Le => value <= bound,
        }
    }
}

/// Condition a rule evaluates against its selected series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Condition {
    /// Latest sample crosses a fixed bound
    Threshold { op: CmpOp, bound: f64 },
    /// Latest sample deviates from the rolling mean by more than `sigma`
    /// standard deviations, once the window holds at least `min_samples`
    /// (guards against false positives on cold series)
    Anomaly {
        window: usize,
        min_samples: usize,
        sigma: f64,
    },
}

/// An externally-configured alerting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    /// Unique rule name; alert events reference rules by this name
    pub name: String,
    pub selector: SeriesSelector,
    pub condition: Condition,
    pub severity: Severity,
    /// Minimum continuous duration the condition must hold before a firing
    /// transition is reported (suppresses single-sample flapping)
    #[serde(with = "debounce_seconds")]
    pub debounce: Duration,
}

mod debounce_seconds {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i64(d.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::seconds(i64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_subset_match() {
        let selector = SeriesSelector::metric("cpu_percent").with_label("service", "x");
        assert!(selector.matches(&SeriesKey::new("cpu_percent", &[("service", "x")])));
        assert!(selector.matches(&SeriesKey::new(
            "cpu_percent",
            &[("service", "x"), ("host", "a")]
        )));
        assert!(!selector.matches(&SeriesKey::new("cpu_percent", &[("service", "y")])));
        assert!(!selector.matches(&SeriesKey::new("mem_bytes", &[("service", "x")])));
    }

    #[test]
    fn test_empty_label_selector_matches_all_of_metric() {
        let selector = SeriesSelector::metric("cpu_percent");
        assert!(selector.matches(&SeriesKey::bare("cpu_percent")));
        assert!(selector.matches(&SeriesKey::new("cpu_percent", &[("service", "x")])));
    }

    #[test]
    fn test_cmp_ops() {
        assert!(CmpOp::Gt.holds(91.0, 90.0));
        assert!(!CmpOp::Gt.holds(90.0, 90.0));
        assert!(CmpOp::Ge.holds(90.0, 90.0));
        assert!(CmpOp::Lt.holds(1.0, 2.0));
        assert!(CmpOp::Le.holds(2.0, 2.0));
    }

    #[test]
    fn test_rule_toml_round_trip() {
        let rule = AlertRule {
            name: "high_cpu".to_string(),
            selector: SeriesSelector::metric("cpu_percent").with_label("service", "x"),
            condition: Condition::Threshold {
                op: CmpOp::Gt,
                bound: 90.0,
            },
            severity: Severity::Warning,
            debounce: Duration::seconds(60),
        };
        let text = toml::to_string(&rule).unwrap();
        let back: AlertRule = toml::from_str(&text).unwrap();
        assert_eq!(rule, back);
    }
}
