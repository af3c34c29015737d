//! Span recorder and trace assembly
//!
//! Callers wrap operations they control with `start_span`/`finish_span`; the
//! recorder never instruments third-party call sites. Traces are a derived,
//! read-only view: `get_trace` recomputes the parent/child forest from the
//! span index on every call.

use crate::model::{AttrValue, Span, SpanStatus, Timestamp, TraceContext};
use chrono::{Duration, Utc};
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use uuid::Uuid;

/// In-flight span returned by `start_span`
///
/// Holds everything needed to commit the span except its outcome. Duration
/// is computed at finish time.
#[derive(Debug, Clone)]
pub struct SpanHandle {
    pub trace_id: String,
    pub span_id: String,
    parent_span_id: Option<String>,
    operation: String,
    service: String,
    start_time: Timestamp,
}

impl SpanHandle {
    /// Context for propagating this span to downstream operations
    ///
    /// Callers forward it explicitly; nothing is propagated implicitly.
    pub fn context(&self) -> TraceContext {
        TraceContext {
            trace_id: self.trace_id.clone(),
            parent_span_id: Some(self.span_id.clone()),
        }
    }
}

/// One node of a reconstructed trace: a span and its children
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SpanNode {
    pub span: Span,
    pub children: Vec<SpanNode>,
}

/// Read-only view of all spans sharing a trace id, as a parent/child forest
///
/// A span whose declared parent is missing from the index becomes an
/// additional root rather than an error.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Trace {
    pub trace_id: String,
    pub roots: Vec<SpanNode>,
}

/// Records finished spans into an index keyed by trace id
pub struct TraceRecorder {
    spans: RwLock<HashMap<String, Vec<Span>>>,
    /// Finished spans older than this are pruned
    max_age: Duration,
    /// Spans observed with a missing parent, surfaced as a diagnostic only
    orphan_spans: AtomicU64,
    /// Span ids already counted as orphans, so repeated reads of the same
    /// trace never inflate the diagnostic
    counted_orphans: Mutex<HashSet<String>>,
}

impl TraceRecorder {
    pub fn new(max_age: Duration) -> Self {
        Self {
            spans: RwLock::new(HashMap::new()),
            max_age,
            orphan_spans: AtomicU64::new(0),
            counted_orphans: Mutex::new(HashSet::new()),
        }
    }

    /// Begin a span for an operation the caller controls
    ///
    /// With a context, the span joins the context's trace under its parent
    /// span; without one, a fresh trace id is generated and the span becomes
    /// a new trace root.
    pub fn start_span(
        &self,
        operation: impl Into<String>,
        service: impl Into<String>,
        ctx: Option<&TraceContext>,
    ) -> SpanHandle {
        let (trace_id, parent_span_id) = match ctx {
            Some(ctx) => (ctx.trace_id.clone(), ctx.parent_span_id.clone()),
            None => (Uuid::new_v4().simple().to_string(), None),
        };
        SpanHandle {
            trace_id,
            span_id: Uuid::new_v4().simple().to_string(),
            parent_span_id,
            operation: operation.into(),
            service: service.into(),
            start_time: Utc::now(),
        }
    }

    /// Compute the span's duration and commit it to the index
    pub fn finish_span(
        &self,
        handle: SpanHandle,
        status: SpanStatus,
        attributes: BTreeMap<String, AttrValue>,
    ) {
        let duration_ms = (Utc::now() - handle.start_time)
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or(f64::MAX);
        let span = Span {
            trace_id: handle.trace_id,
            span_id: handle.span_id,
            parent_span_id: handle.parent_span_id,
            operation: handle.operation,
            service: handle.service,
            start_time: handle.start_time,
            duration_ms,
            attributes,
            status,
        };
        self.commit(span);
    }

    /// Commit an already-assembled span, e.g. one reported by a remote caller
    pub fn commit(&self, span: Span) {
        let mut index = match self.spans.write() {
            Ok(index) => index,
            Err(poisoned) => poisoned.into_inner(),
        };
        index.entry(span.trace_id.clone()).or_default().push(span);
    }

    /// Reconstruct the span forest for one trace
    ///
    /// Spans are grouped under their declared parents; a span whose parent is
    /// absent from the index is treated as a second root under the same trace
    /// id. That condition is counted and logged as a data-quality event, never
    /// surfaced as a read failure. Returns `None` for unknown trace ids.
    pub fn get_trace(&self, trace_id: &str) -> Option<Trace> {
        let spans: Vec<Span> = {
            let index = self.spans.read().ok()?;
            index.get(trace_id)?.clone()
        };
        if spans.is_empty() {
            return None;
        }

        let known: HashMap<&str, &Span> =
            spans.iter().map(|s| (s.span_id.as_str(), s)).collect();
        let mut children_of: HashMap<&str, Vec<&Span>> = HashMap::new();
        let mut roots: Vec<&Span> = Vec::new();

        for span in &spans {
            match span.parent_span_id.as_deref() {
                Some(parent) if known.contains_key(parent) => {
                    children_of.entry(parent).or_default().push(span);
                }
                Some(parent) => {
                    self.note_orphan(&span.span_id, trace_id, parent);
                    roots.push(span);
                }
                None => roots.push(span),
            }
        }

        roots.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        let roots = roots
            .into_iter()
            .map(|span| Self::build_node(span, &mut children_of))
            .collect();
        Some(Trace {
            trace_id: trace_id.to_string(),
            roots,
        })
    }

    /// Record a distinct orphaned span in the diagnostic counter
    ///
    /// Each span id is counted at most once, however many times the trace is
    /// re-read.
    fn note_orphan(&self, span_id: &str, trace_id: &str, parent: &str) {
        let mut counted = match self.counted_orphans.lock() {
            Ok(counted) => counted,
            Err(poisoned) => poisoned.into_inner(),
        };
        if counted.insert(span_id.to_string()) {
            let total = self.orphan_spans.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(
                "span {} in trace {} declares missing parent {}; promoting to root ({} orphans total)",
                span_id, trace_id, parent, total
            );
        }
    }

    fn build_node(span: &Span, children_of: &mut HashMap<&str, Vec<&Span>>) -> SpanNode {
        let mut children = children_of.remove(span.span_id.as_str()).unwrap_or_default();
        children.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        SpanNode {
            span: span.clone(),
            children: children
                .into_iter()
                .map(|child| Self::build_node(child, children_of))
                .collect(),
        }
    }

    /// All committed spans, for export
    pub fn all_spans(&self) -> Vec<Span> {
        self.spans
            .read()
            .map(|index| index.values().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Count of spans committed with a parent missing from the index
    pub fn orphan_span_count(&self) -> u64 {
        self.orphan_spans.load(Ordering::Relaxed)
    }

    /// Age-based pruning of finished spans, same cadence as metric retention
    pub fn prune(&self) -> usize {
        let cutoff = Utc::now() - self.max_age;
        let mut index = match self.spans.write() {
            Ok(index) => index,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut removed = 0;
        let mut pruned_ids: Vec<String> = Vec::new();
        index.retain(|_, spans| {
            let before = spans.len();
            spans.retain(|s| {
                if s.start_time >= cutoff {
                    true
                } else {
                    pruned_ids.push(s.span_id.clone());
                    false
                }
            });
            removed += before - spans.len();
            !spans.is_empty()
        });
        if !pruned_ids.is_empty() {
            // The cumulative counter keeps its value; only the dedup set is
            // trimmed alongside the spans it tracked.
            let mut counted = match self.counted_orphans.lock() {
                Ok(counted) => counted,
                Err(poisoned) => poisoned.into_inner(),
            };
            for id in &pruned_ids {
                counted.remove(id);
            }
        }
        if removed > 0 {
            debug!("pruned {} spans past retention", removed);
        }
        removed
    }
}
