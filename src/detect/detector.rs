//! Rule evaluation engine
//!
//! Runs on its own interval, independent of collection cadence. Detector
//! state (rolling statistics, debounce bookkeeping, last reported transition)
//! is owned per rule and persists across evaluation ticks. Evaluation takes
//! an explicit `now` so the debounce behavior is deterministic under test.

use crate::detect::rules::{AlertRule, Condition};
use crate::model::{SeriesKey, Severity, Timestamp};
use crate::store::{LabelFilter, TimeSeriesStore};
use chrono::Utc;
use log::{debug, info};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, RwLock};

/// A condition transition reported to the alert manager
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Condition held continuously for the rule's debounce window
    Fired {
        rule: String,
        severity: Severity,
        value: f64,
    },
    /// Condition stopped holding for a rule that previously fired
    Resolved { rule: String },
}

/// Per-rule evaluation state, persisted across ticks
#[derive(Debug, Default)]
struct RuleState {
    /// When the condition was first observed holding in the current stretch
    holding_since: Option<Timestamp>,
    /// Whether a firing transition has been reported and not yet resolved
    active: bool,
    /// Rolling sample windows per selected series (anomaly conditions)
    windows: HashMap<SeriesKey, VecDeque<f64>>,
    /// Timestamp of the last sample ingested per series, so one sample is
    /// never counted twice across ticks
    ingested: HashMap<SeriesKey, Timestamp>,
}

/// Scans the store for threshold crossings and statistical deviations
pub struct AnomalyDetector {
    rules: RwLock<Vec<AlertRule>>,
    state: Mutex<HashMap<String, RuleState>>,
}

impl Default for AnomalyDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyDetector {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Install a rule at runtime; replaces any rule with the same name
    ///
    /// A selector matching no existing series is valid and never fires until
    /// matching data appears.
    pub fn install_rule(&self, rule: AlertRule) {
        let mut rules = match self.rules.write() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(existing) = rules.iter_mut().find(|r| r.name == rule.name) {
            info!("replacing alert rule '{}'", rule.name);
            if let Ok(mut state) = self.state.lock() {
                state.remove(&rule.name);
            }
            *existing = rule;
        } else {
            info!("installed alert rule '{}'", rule.name);
            rules.push(rule);
        }
    }

    /// Remove a rule and its evaluation state
    pub fn remove_rule(&self, name: &str) -> bool {
        let mut rules = match self.rules.write() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };
        let before = rules.len();
        rules.retain(|r| r.name != name);
        if let Ok(mut state) = self.state.lock() {
            state.remove(name);
        }
        rules.len() != before
    }

    /// Names of currently installed rules
    pub fn rule_names(&self) -> Vec<String> {
        self.rules
            .read()
            .map(|rules| rules.iter().map(|r| r.name.clone()).collect())
            .unwrap_or_default()
    }

    /// Evaluate every rule against the store's current state
    pub fn evaluate_tick(&self, store: &TimeSeriesStore) -> Vec<Transition> {
        self.evaluate_at(store, Utc::now())
    }

    /// Evaluate every rule as of `now`
    ///
    /// Each rule is independent: at most one firing transition per rule at a
    /// time, never merged across rules even when selectors overlap.
    pub fn evaluate_at(&self, store: &TimeSeriesStore, now: Timestamp) -> Vec<Transition> {
        let rules: Vec<AlertRule> = match self.rules.read() {
            Ok(rules) => rules.clone(),
            Err(_) => return Vec::new(),
        };
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };

        let all_series = store.list_series(&LabelFilter::All);
        let mut transitions = Vec::new();

        for rule in &rules {
            let rule_state = state.entry(rule.name.clone()).or_default();
            let holding_value = Self::condition_value(rule, rule_state, store, &all_series);

            match holding_value {
                Some(value) if !rule_state.active => {
                    let since = *rule_state.holding_since.get_or_insert(now);
                    if now - since >= rule.debounce {
                        rule_state.active = true;
                        debug!(
                            "rule '{}' held for {}s, reporting firing transition",
                            rule.name,
                            (now - since).num_seconds()
                        );
                        transitions.push(Transition::Fired {
                            rule: rule.name.clone(),
                            severity: rule.severity,
                            value,
                        });
                    }
                }
                Some(_) => {} // already active, nothing to report
                None => {
                    rule_state.holding_since = None;
                    if rule_state.active {
                        rule_state.active = false;
                        transitions.push(Transition::Resolved {
                            rule: rule.name.clone(),
                        });
                    }
                }
            }
        }
        transitions
    }

    /// Whether the rule's condition currently holds, and the triggering value
    ///
    /// A rule holds when any series its selector matches satisfies the
    /// condition.
    fn condition_value(
        rule: &AlertRule,
        rule_state: &mut RuleState,
        store: &TimeSeriesStore,
        all_series: &[SeriesKey],
    ) -> Option<f64> {
        let mut triggering = None;
        for key in all_series.iter().filter(|k| rule.selector.matches(k)) {
            let latest = match store.latest(key) {
                Some(sample) => sample,
                None => continue,
            };
            let holds = match &rule.condition {
                Condition::Threshold { op, bound } => op.holds(latest.value, *bound),
                Condition::Anomaly {
                    window,
                    min_samples,
                    sigma,
                } => Self::anomaly_holds(
                    rule_state,
                    key,
                    latest.timestamp,
                    latest.value,
                    *window,
                    *min_samples,
                    *sigma,
                ),
            };
            if holds && triggering.is_none() {
                triggering = Some(latest.value);
            }
        }
        triggering
    }

    /// Statistical condition over a per-series rolling window
    ///
    /// Mean and standard deviation are computed over the samples seen before
    /// the latest one, then the latest is ingested. Each sample is ingested
    /// once regardless of tick cadence.
    fn anomaly_holds(
        rule_state: &mut RuleState,
        key: &SeriesKey,
        timestamp: Timestamp,
        value: f64,
        window: usize,
        min_samples: usize,
        sigma: f64,
    ) -> bool {
        let already_seen = rule_state
            .ingested
            .get(key)
            .is_some_and(|last| *last >= timestamp);

        let samples = rule_state.windows.entry(key.clone()).or_default();
        let holds = if samples.len() >= min_samples.max(1) {
            let n = samples.len() as f64;
            let mean = samples.iter().sum::<f64>() / n;
            let variance = samples.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
            (value - mean).abs() > sigma * variance.sqrt()
        } else {
            false
        };

        if !already_seen {
            samples.push_back(value);
            while samples.len() > window.max(1) {
                samples.pop_front();
            }
            rule_state.ingested.insert(key.clone(), timestamp);
        }
        holds
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::rules::{CmpOp, SeriesSelector};
    use crate::store::RetentionPolicy;
    use chrono::Duration;

    fn test_store() -> TimeSeriesStore {
        TimeSeriesStore::new(
            RetentionPolicy {
                max_age: Duration::hours(1),
                max_samples: 10_000,
            },
            Duration::days(365),
        )
    }

    fn threshold_rule(name: &str, bound: f64, debounce_secs: i64) -> AlertRule {
        AlertRule {
            name: name.to_string(),
            selector: SeriesSelector::metric("cpu_percent").with_label("service", "x"),
            condition: Condition::Threshold {
                op: CmpOp::Gt,
                bound,
            },
            severity: Severity::Warning,
            debounce: Duration::seconds(debounce_secs),
        }
    }

    #[test]
    fn test_debounce_not_satisfied_no_event() {
        // Rule: value > 90 for at least 60s. Series holds at 95 for 45s, then
        // drops to 80. No firing transition is reported.
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("high_cpu", 90.0, 60));

        let key = SeriesKey::new("cpu_percent", &[("service", "x")]);
        let base = Utc::now();
        let mut transitions = Vec::new();

        for offset in (0..=45).step_by(5) {
            let at = base + Duration::seconds(offset);
            store.write(&key, at, 95.0).unwrap();
            transitions.extend(detector.evaluate_at(&store, at));
        }
        let at = base + Duration::seconds(50);
        store.write(&key, at, 80.0).unwrap();
        transitions.extend(detector.evaluate_at(&store, at));

        assert!(transitions.is_empty());
    }

    #[test]
    fn test_debounce_satisfied_fires_once_then_resolves() {
        // Holding at 95 for 65s fires exactly one event; a later drop below
        // the bound resolves it.
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("high_cpu", 90.0, 60));

        let key = SeriesKey::new("cpu_percent", &[("service", "x")]);
        let base = Utc::now();
        let mut transitions = Vec::new();

        for offset in (0..=65).step_by(5) {
            let at = base + Duration::seconds(offset);
            store.write(&key, at, 95.0).unwrap();
            transitions.extend(detector.evaluate_at(&store, at));
        }

        let fired: Vec<_> = transitions
            .iter()
            .filter(|t| matches!(t, Transition::Fired { .. }))
            .collect();
        assert_eq!(fired.len(), 1);
        assert!(matches!(
            fired[0],
            Transition::Fired { rule, value, .. } if rule == "high_cpu" && *value == 95.0
        ));

        let at = base + Duration::seconds(70);
        store.write(&key, at, 80.0).unwrap();
        let resolved = detector.evaluate_at(&store, at);
        assert_eq!(
            resolved,
            vec![Transition::Resolved {
                rule: "high_cpu".to_string()
            }]
        );
    }

    #[test]
    fn test_flapping_resets_debounce() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("high_cpu", 90.0, 30));

        let key = SeriesKey::new("cpu_percent", &[("service", "x")]);
        let base = Utc::now();

        // Hold 20s, dip, hold another 20s: never fires.
        let mut transitions = Vec::new();
        for (offset, value) in [(0, 95.0), (10, 95.0), (20, 95.0), (25, 50.0), (30, 95.0), (40, 95.0), (50, 95.0)] {
            let at = base + Duration::seconds(offset);
            store.write(&key, at, value).unwrap();
            transitions.extend(detector.evaluate_at(&store, at));
        }
        assert!(transitions.is_empty());

        // Continuing to hold past the debounce from the restart does fire.
        let at = base + Duration::seconds(60);
        store.write(&key, at, 95.0).unwrap();
        let fired = detector.evaluate_at(&store, at);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_zero_debounce_fires_immediately() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("high_cpu", 90.0, 0));

        let key = SeriesKey::new("cpu_percent", &[("service", "x")]);
        let now = Utc::now();
        store.write(&key, now, 95.0).unwrap();

        let transitions = detector.evaluate_at(&store, now);
        assert_eq!(transitions.len(), 1);
        assert!(matches!(transitions[0], Transition::Fired { .. }));
    }

    #[test]
    fn test_selector_matching_nothing_never_fires() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(AlertRule {
            name: "ghost".to_string(),
            selector: SeriesSelector::metric("does_not_exist"),
            condition: Condition::Threshold {
                op: CmpOp::Gt,
                bound: 0.0,
            },
            severity: Severity::Critical,
            debounce: Duration::zero(),
        });

        assert!(detector.evaluate_at(&store, Utc::now()).is_empty());
    }

    #[test]
    fn test_overlapping_rules_fire_independently() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("warn_cpu", 50.0, 0));
        let mut critical = threshold_rule("crit_cpu", 90.0, 0);
        critical.severity = Severity::Critical;
        detector.install_rule(critical);

        let key = SeriesKey::new("cpu_percent", &[("service", "x")]);
        let now = Utc::now();
        store.write(&key, now, 95.0).unwrap();

        let transitions = detector.evaluate_at(&store, now);
        // One event per rule, never merged.
        assert_eq!(transitions.len(), 2);
    }

    #[test]
    fn test_anomaly_condition_needs_min_samples() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(AlertRule {
            name: "latency_spike".to_string(),
            selector: SeriesSelector::metric("latency_ms"),
            condition: Condition::Anomaly {
                window: 20,
                min_samples: 5,
                sigma: 3.0,
            },
            severity: Severity::Warning,
            debounce: Duration::zero(),
        });

        let key = SeriesKey::bare("latency_ms");
        let base = Utc::now();

        // A wild first sample on a cold series must not fire.
        store.write(&key, base, 10_000.0).unwrap();
        assert!(detector.evaluate_at(&store, base).is_empty());
    }

    #[test]
    fn test_anomaly_condition_fires_on_deviation() {
        let store = test_store();
        let detector = AnomalyDetector::new();
        detector.install_rule(AlertRule {
            name: "latency_spike".to_string(),
            selector: SeriesSelector::metric("latency_ms"),
            condition: Condition::Anomaly {
                window: 20,
                min_samples: 5,
                sigma: 3.0,
            },
            severity: Severity::Warning,
            debounce: Duration::zero(),
        });

        let key = SeriesKey::bare("latency_ms");
        let base = Utc::now();

        // Stable baseline around 100ms.
        let baseline = [100.0, 101.0, 99.0, 100.5, 99.5, 100.0];
        let mut transitions = Vec::new();
        for (i, value) in baseline.iter().enumerate() {
            let at = base + Duration::seconds(i as i64);
            store.write(&key, at, *value).unwrap();
            transitions.extend(detector.evaluate_at(&store, at));
        }
        assert!(transitions.is_empty());

        // A 10x spike deviates far beyond three standard deviations.
        let at = base + Duration::seconds(10);
        store.write(&key, at, 1000.0).unwrap();
        let fired = detector.evaluate_at(&store, at);
        assert_eq!(fired.len(), 1);
        assert!(matches!(
            &fired[0],
            Transition::Fired { rule, .. } if rule == "latency_spike"
        ));
    }

    #[test]
    fn test_install_remove_rules() {
        let detector = AnomalyDetector::new();
        detector.install_rule(threshold_rule("a", 1.0, 0));
        detector.install_rule(threshold_rule("b", 2.0, 0));
        assert_eq!(detector.rule_names().len(), 2);

        assert!(detector.remove_rule("a"));
        assert!(!detector.remove_rule("a"));
        assert_eq!(detector.rule_names(), vec!["b".to_string()]);
    }
}
