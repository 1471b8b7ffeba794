//! Per-probe span storage.
//!
//! Spans of traces that belong to the probe are *tracked*. Everything else a
//! delivered batch carries is kept *pending* until an anchor span ties its
//! trace to the probe, or until the owning result is frozen.
use crate::span::{batch_spans, SpanRecord, TraceBatch};
use opentelemetry::trace::{SpanId, TraceId};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::AddAssign;
use std::time::SystemTime;
use tracing::debug;

/// Spans of one trace keyed by span id.
pub type TraceSpans = HashMap<SpanId, SpanRecord>;

/// Outcome of ingesting one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Spans stored for the first time.
    pub accepted: usize,
    /// Spans already stored under the same trace and span id.
    pub duplicates: usize,
    /// Spans that failed conversion and were skipped.
    pub malformed: usize,
}

impl AddAssign for IngestStats {
    fn add_assign(&mut self, rhs: Self) {
        self.accepted += rhs.accepted;
        self.duplicates += rhs.duplicates;
        self.malformed += rhs.malformed;
    }
}

/// Tracked and pending spans of a single probe.
#[derive(Clone, Debug, Default)]
pub struct SpanStore {
    tracked: HashMap<TraceId, TraceSpans>,
    pending: HashMap<TraceId, TraceSpans>,
}

impl SpanStore {
    /// Creates a store that tracks the given traces from the start.
    pub fn tracking(trace_ids: impl IntoIterator<Item = TraceId>) -> Self {
        SpanStore {
            tracked: trace_ids
                .into_iter()
                .map(|id| (id, TraceSpans::new()))
                .collect(),
            pending: HashMap::new(),
        }
    }

    /// Stores every well-formed span of `batch`, ignoring re-deliveries.
    pub fn ingest(&mut self, batch: &TraceBatch) -> IngestStats {
        let mut stats = IngestStats::default();
        for span in batch_spans(batch) {
            let record = match SpanRecord::try_from(span) {
                Ok(record) => record,
                Err(err) => {
                    debug!(name: "SpanStore.MalformedSpan", reason = %err);
                    stats.malformed += 1;
                    continue;
                }
            };

            let area = if self.tracked.contains_key(&record.trace_id) {
                &mut self.tracked
            } else {
                &mut self.pending
            };
            match area.entry(record.trace_id).or_default().entry(record.span_id) {
                Entry::Occupied(_) => stats.duplicates += 1,
                Entry::Vacant(slot) => {
                    slot.insert(record);
                    stats.accepted += 1;
                }
            }
        }
        stats
    }

    /// Starts tracking `trace_id`, promoting its pending spans. Returns true
    /// if the trace was not tracked before.
    pub fn track(&mut self, trace_id: TraceId) -> bool {
        if self.tracked.contains_key(&trace_id) {
            return false;
        }
        let spans = self.pending.remove(&trace_id).unwrap_or_default();
        self.tracked.insert(trace_id, spans);
        true
    }

    /// Returns true if `trace_id` is tracked.
    pub fn is_tracked(&self, trace_id: &TraceId) -> bool {
        self.tracked.contains_key(trace_id)
    }

    /// Spans of a tracked trace.
    pub fn trace_spans(&self, trace_id: &TraceId) -> impl Iterator<Item = &SpanRecord> {
        self.tracked.get(trace_id).into_iter().flat_map(|spans| spans.values())
    }

    /// Spans of all tracked traces.
    pub fn tracked_spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.tracked.values().flat_map(|spans| spans.values())
    }

    /// Spans of tracked and pending traces.
    pub fn all_spans(&self) -> impl Iterator<Item = &SpanRecord> {
        self.tracked_spans()
            .chain(self.pending.values().flat_map(|spans| spans.values()))
    }

    /// Tracked spans grouped by trace.
    pub fn spans_by_trace(&self) -> &HashMap<TraceId, TraceSpans> {
        &self.tracked
    }

    /// Number of spans waiting in the pending area.
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(HashMap::len).sum()
    }

    /// Drops the pending area.
    pub fn discard_pending(&mut self) {
        self.pending = HashMap::new();
    }
}

/// Returns the earliest start and latest end over `spans`.
pub fn time_range<'a>(
    spans: impl IntoIterator<Item = &'a SpanRecord>,
) -> Option<(SystemTime, SystemTime)> {
    spans.into_iter().fold(None, |range, span| match range {
        None => Some((span.start_time, span.end_time)),
        Some((start, end)) => Some((start.min(span.start_time), end.max(span.end_time))),
    })
}
