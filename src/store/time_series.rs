//! Time series store with per-series write serialization
//!
//! Samples are keyed by series identity (metric name plus sorted labels) and
//! held in append-only buffers bounded by the retention policy. The outer map
//! is only locked long enough to locate or create a series; every series
//! carries its own mutex, so writers to the same series serialize while
//! writes and reads on different series proceed independently.

use crate::error::StoreError;
use crate::model::{MetricSample, SeriesKey, Timestamp};
use chrono::{Duration, Utc};
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

/// Bounds on how long and how many samples a series may retain
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Samples older than this are pruned
    pub max_age: Duration,
    /// A series never holds more than this many samples
    pub max_samples: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_age: Duration::hours(1),
            max_samples: 10_000,
        }
    }
}

/// Predicate over series label sets for `list_series`
#[derive(Debug, Clone)]
pub enum LabelFilter {
    /// Match every series
    All,
    /// Match series carrying the named label, any value
    Has(String),
    /// Match series where the named label equals the given value
    Equals(String, String),
}

impl LabelFilter {
    pub fn matches(&self, key: &SeriesKey) -> bool {
        match self {
            LabelFilter::All => true,
            LabelFilter::Has(name) => key.labels.contains_key(name),
            LabelFilter::Equals(name, value) => key.label(name) == Some(value.as_str()),
        }
    }
}

#[derive(Debug, Default)]
struct Series {
    samples: VecDeque<MetricSample>,
}

impl Series {
    fn last_timestamp(&self) -> Option<Timestamp> {
        self.samples.back().map(|s| s.timestamp)
    }
}

/// Append-only, retention-bounded storage for numeric samples
///
/// Series are created lazily on first write and never renamed. Reads copy a
/// consistent per-series snapshot as of call time; there is no cross-series
/// atomicity.
pub struct TimeSeriesStore {
    series: RwLock<HashMap<SeriesKey, Arc<Mutex<Series>>>>,
    retention: RetentionPolicy,
    /// Clock jitter absorbed across concurrent writers before a sample is
    /// rejected as out of order
    skew_tolerance: Duration,
}

impl TimeSeriesStore {
    pub fn new(retention: RetentionPolicy, skew_tolerance: Duration) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            retention,
            skew_tolerance,
        }
    }

    /// Append a sample to the series identified by `key`
    ///
    /// Fails with `OutOfOrderSample` when `timestamp` is strictly older than
    /// the series tail by more than the skew tolerance. Within the tolerance
    /// the sample is accepted and its timestamp clamped to the tail, keeping
    /// the stored sequence monotonically non-decreasing.
    ///
    /// # Errors
    ///
    /// `StoreError::OutOfOrderSample` for stale samples;
    /// `StoreError::Unavailable` if internal locks are poisoned.
    pub fn write(&self, key: &SeriesKey, timestamp: Timestamp, value: f64) -> Result<(), StoreError> {
        let handle = self.series_handle(key)?;
        let mut series = handle
            .lock()
            .map_err(|_| StoreError::Unavailable("series lock poisoned".to_string()))?;

        let timestamp = match series.last_timestamp() {
            Some(last) if timestamp < last - self.skew_tolerance => {
                return Err(StoreError::OutOfOrderSample {
                    series: key.to_string(),
                    timestamp,
                    last_seen: last,
                });
            }
            // Late within tolerance: clamp so the series stays monotone.
            Some(last) if timestamp < last => last,
            _ => timestamp,
        };

        series.samples.push_back(MetricSample { timestamp, value });
        while series.samples.len() > self.retention.max_samples {
            series.samples.pop_front();
        }
        Ok(())
    }

    /// Samples of one series within `[from, to]`, ascending by timestamp
    ///
    /// Returns an empty vector for unknown series or empty ranges. The result
    /// is a snapshot copy; iterating it never blocks writers.
    pub fn query(&self, key: &SeriesKey, from: Timestamp, to: Timestamp) -> Vec<MetricSample> {
        let handle = {
            let map = match self.series.read() {
                Ok(map) => map,
                Err(_) => return Vec::new(),
            };
            match map.get(key) {
                Some(handle) => Arc::clone(handle),
                None => return Vec::new(),
            }
        };
        let series = match handle.lock() {
            Ok(series) => series,
            Err(_) => return Vec::new(),
        };
        series
            .samples
            .iter()
            .filter(|s| s.timestamp >= from && s.timestamp <= to)
            .copied()
            .collect()
    }

    /// Most recent sample of a series, if any
    pub fn latest(&self, key: &SeriesKey) -> Option<MetricSample> {
        let handle = {
            let map = self.series.read().ok()?;
            Arc::clone(map.get(key)?)
        };
        let series = handle.lock().ok()?;
        series.samples.back().copied()
    }

    /// Series identities matching the label filter, in sorted order
    pub fn list_series(&self, filter: &LabelFilter) -> Vec<SeriesKey> {
        let map = match self.series.read() {
            Ok(map) => map,
            Err(_) => return Vec::new(),
        };
        let mut keys: Vec<SeriesKey> = map.keys().filter(|k| filter.matches(k)).cloned().collect();
        keys.sort();
        keys
    }

    /// Remove samples violating the retention policy
    ///
    /// Each series is pruned under its own lock, so one large series cannot
    /// block writers or readers of another. Idempotent: pruning twice with no
    /// intervening writes removes nothing the second time.
    pub fn prune(&self) -> Result<usize, StoreError> {
        let handles: Vec<Arc<Mutex<Series>>> = {
            let map = self
                .series
                .read()
                .map_err(|_| StoreError::Unavailable("series map lock poisoned".to_string()))?;
            map.values().map(Arc::clone).collect()
        };

        let cutoff = Utc::now() - self.retention.max_age;
        let mut removed = 0;
        for handle in handles {
            let mut series = handle
                .lock()
                .map_err(|_| StoreError::Unavailable("series lock poisoned".to_string()))?;
            while let Some(front) = series.samples.front() {
                if front.timestamp < cutoff {
                    series.samples.pop_front();
                    removed += 1;
                } else {
                    break;
                }
            }
            while series.samples.len() > self.retention.max_samples {
                series.samples.pop_front();
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("pruned {} samples past retention", removed);
        }
        Ok(removed)
    }

    /// Number of known series
    pub fn series_count(&self) -> usize {
        self.series.read().map(|m| m.len()).unwrap_or(0)
    }

    fn series_handle(&self, key: &SeriesKey) -> Result<Arc<Mutex<Series>>, StoreError> {
        {
            let map = self
                .series
                .read()
                .map_err(|_| StoreError::Unavailable("series map lock poisoned".to_string()))?;
            if let Some(handle) = map.get(key) {
                return Ok(Arc::clone(handle));
            }
        }
        let mut map = self
            .series
            .write()
            .map_err(|_| StoreError::Unavailable("series map lock poisoned".to_string()))?;
        Ok(Arc::clone(
            map.entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Series::default()))),
        ))
    }
}
