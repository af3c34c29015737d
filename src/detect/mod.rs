/// Alert rule definitions and series selectors
mod rules;

/// Rule evaluation with rolling statistics and debounce
mod detector;

pub use detector::{AnomalyDetector, Transition};
pub use rules::{AlertRule, CmpOp, Condition, SeriesSelector};
