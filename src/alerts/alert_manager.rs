//! Alert event lifecycle management
//!
//! Consumes condition transitions from the detector and turns them into
//! deduplicated alert events: at most one open event per rule at a time.
//! Open events and a bounded history of recently resolved events sit behind
//! one coarse mutex, acceptable because alert volume is orders of magnitude
//! lower than metric volume.

use crate::detect::Transition;
use crate::model::{Severity, Timestamp};
use chrono::{Duration, Utc};
use log::{info, warn};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// A fired (and possibly resolved) alert
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AlertEvent {
    /// Name of the rule that fired
    pub rule: String,
    pub severity: Severity,
    /// Sample value that triggered the firing transition
    pub value: f64,
    pub fired_at: Timestamp,
    /// Set when the condition transitioned back to false
    pub resolved_at: Option<Timestamp>,
}

#[derive(Debug, Default)]
struct AlertState {
    /// Currently-open events, keyed by rule name
    open: HashMap<String, AlertEvent>,
    /// Recently resolved events, newest at the back
    history: VecDeque<AlertEvent>,
}

/// Owns all alert events; other components only ever see copies
pub struct AlertManager {
    state: Mutex<AlertState>,
    /// Resolved events older than this are pruned from history
    history_retention: Duration,
    /// Hard cap on retained resolved events
    history_max: usize,
}

impl AlertManager {
    pub fn new(history_retention: Duration, history_max: usize) -> Self {
        Self {
            state: Mutex::new(AlertState::default()),
            history_retention,
            history_max,
        }
    }

    /// Apply a batch of detector transitions
    pub fn apply(&self, transitions: &[Transition]) {
        for transition in transitions {
            match transition {
                Transition::Fired {
                    rule,
                    severity,
                    value,
                } => self.fire(rule, *severity, *value),
                Transition::Resolved { rule } => self.resolve(rule),
            }
        }
    }

    /// Open an alert event for a rule
    ///
    /// Idempotent: when an unresolved event for the rule already exists, the
    /// call is a no-op, so repeated firing reports never duplicate events.
    pub fn fire(&self, rule: &str, severity: Severity, value: f64) {
        let mut state = self.lock();
        if state.open.contains_key(rule) {
            return;
        }
        info!("alert fired: rule '{}' value {} ({:?})", rule, value, severity);
        state.open.insert(
            rule.to_string(),
            AlertEvent {
                rule: rule.to_string(),
                severity,
                value,
                fired_at: Utc::now(),
                resolved_at: None,
            },
        );
    }

    /// Mark the open event for a rule resolved and move it to history
    pub fn resolve(&self, rule: &str) {
        let mut state = self.lock();
        match state.open.remove(rule) {
            Some(mut event) => {
                info!("alert resolved: rule '{}'", rule);
                event.resolved_at = Some(Utc::now());
                state.history.push_back(event);
                self.prune_history(&mut state);
            }
            None => warn!("resolve for rule '{}' with no open alert", rule),
        }
    }

    /// Snapshot of currently-open events, sorted by rule name for stable
    /// export output
    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        let state = self.lock();
        let mut events: Vec<AlertEvent> = state.open.values().cloned().collect();
        events.sort_by(|a, b| a.rule.cmp(&b.rule));
        events
    }

    /// Resolved events whose resolution falls within the given window
    pub fn recent_history(&self, window: Duration) -> Vec<AlertEvent> {
        let cutoff = Utc::now() - window;
        let state = self.lock();
        state
            .history
            .iter()
            .filter(|e| e.resolved_at.is_some_and(|at| at >= cutoff))
            .cloned()
            .collect()
    }

    /// Drop resolved events past the audit retention window
    pub fn prune(&self) {
        let mut state = self.lock();
        self.prune_history(&mut state);
    }

    fn prune_history(&self, state: &mut AlertState) {
        let cutoff = Utc::now() - self.history_retention;
        while let Some(front) = state.history.front() {
            let expired = front.resolved_at.is_some_and(|at| at < cutoff);
            if expired || state.history.len() > self.history_max {
                state.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, AlertState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
