use crate::conventions::{DHT_PROVIDE, PROVIDE_KEY};
use crate::result::Accumulator;
use crate::span::TraceBatch;
use crate::store::{time_range, IngestStats, SpanStore, TraceSpans};
use cid::Cid;
use opentelemetry::trace::TraceId;
use std::collections::{HashMap, HashSet};
use std::time::SystemTime;
use tracing::debug;

/// Multicodec code of raw binary blocks.
const RAW_CODEC: u64 = 0x55;

/// Returns the CIDv1 with the raw codec over the multihash of `content_id`.
/// This is the key the node provides to the DHT.
pub fn raw_content_id(content_id: &str) -> Result<String, cid::Error> {
    let parsed = Cid::try_from(content_id)?;
    Ok(Cid::new_v1(RAW_CODEC, parsed.hash().to_owned()).to_string())
}

/// Timing of one upload: adding the content and providing it to the DHT.
#[derive(Clone, Debug)]
pub struct UploadResult {
    content_id: Option<String>,
    raw_content_id: Option<String>,
    file_size: u64,
    add_trace_id: TraceId,
    add_start: Option<SystemTime>,
    add_end: Option<SystemTime>,
    provide_trace_id: Option<TraceId>,
    provide_start: Option<SystemTime>,
    provide_end: Option<SystemTime>,
    error: Option<String>,
    spans: SpanStore,
    populated: bool,
    frozen: bool,
}

impl UploadResult {
    /// Creates the result of an upload of `file_size` bytes traced under
    /// `add_trace_id`.
    pub fn new(add_trace_id: TraceId, file_size: u64) -> Self {
        UploadResult {
            content_id: None,
            raw_content_id: None,
            file_size,
            add_trace_id,
            add_start: None,
            add_end: None,
            provide_trace_id: None,
            provide_start: None,
            provide_end: None,
            error: None,
            spans: SpanStore::tracking([add_trace_id]),
            populated: false,
            frozen: false,
        }
    }

    /// Records the content id the node returned for the upload.
    pub fn set_content_id(&mut self, content_id: impl Into<String>, raw_content_id: impl Into<String>) {
        if self.frozen {
            return;
        }
        self.content_id = Some(content_id.into());
        self.raw_content_id = Some(raw_content_id.into());
        self.recompute();
    }

    /// Records a failure. Multiple failures are joined.
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{previous}; {error}"),
            None => error,
        });
    }

    /// Content id of the uploaded data.
    pub fn content_id(&self) -> Option<&str> {
        self.content_id.as_deref()
    }

    /// Raw codec variant of [`content_id`](Self::content_id).
    pub fn raw_content_id(&self) -> Option<&str> {
        self.raw_content_id.as_deref()
    }

    /// Size of the uploaded data in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Trace of the add request.
    pub fn add_trace_id(&self) -> TraceId {
        self.add_trace_id
    }

    /// Earliest span start in the add trace.
    pub fn add_start(&self) -> Option<SystemTime> {
        self.add_start
    }

    /// Latest span end in the add trace.
    pub fn add_end(&self) -> Option<SystemTime> {
        self.add_end
    }

    /// Trace of the earliest provide of the raw content id.
    pub fn provide_trace_id(&self) -> Option<TraceId> {
        self.provide_trace_id
    }

    /// Earliest span start over all provide traces.
    pub fn provide_start(&self) -> Option<SystemTime> {
        self.provide_start
    }

    /// Latest span end over all provide traces.
    pub fn provide_end(&self) -> Option<SystemTime> {
        self.provide_end
    }

    /// Failure of the upload, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Returns true once both the add and the provide boundaries are known.
    pub fn is_populated(&self) -> bool {
        self.populated
    }

    /// Tracked spans grouped by trace.
    pub fn spans_by_trace(&self) -> &HashMap<TraceId, TraceSpans> {
        self.spans.spans_by_trace()
    }

    fn recompute(&mut self) {
        if let Some(raw) = self.raw_content_id.as_deref() {
            let mut anchors: Vec<(SystemTime, TraceId)> = self
                .spans
                .all_spans()
                .filter(|span| span.name == DHT_PROVIDE && span.has_str_attribute(PROVIDE_KEY, raw))
                .map(|span| (span.start_time, span.trace_id))
                .collect();
            anchors.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.to_bytes().cmp(&b.1.to_bytes())));

            let provide_traces: HashSet<TraceId> = anchors.iter().map(|(_, id)| *id).collect();
            for trace_id in &provide_traces {
                if self.spans.track(*trace_id) {
                    debug!(name: "UploadResult.ProvideTraceTracked", trace_id = %trace_id);
                }
            }

            self.provide_trace_id = anchors.first().map(|(_, id)| *id);
            let range = time_range(
                provide_traces
                    .iter()
                    .flat_map(|trace_id| self.spans.trace_spans(trace_id)),
            );
            self.provide_start = range.map(|(start, _)| start);
            self.provide_end = range.map(|(_, end)| end);
        }

        let range = time_range(self.spans.trace_spans(&self.add_trace_id));
        self.add_start = range.map(|(start, _)| start);
        self.add_end = range.map(|(_, end)| end);

        self.populated |= self.add_start.is_some() && self.provide_start.is_some();
    }
}

impl Accumulator for UploadResult {
    fn parse(&mut self, batch: &TraceBatch) -> IngestStats {
        if self.frozen {
            return IngestStats::default();
        }
        let stats = self.spans.ingest(batch);
        self.recompute();
        stats
    }

    fn is_complete(&self) -> bool {
        self.is_populated()
    }

    fn freeze(&mut self) {
        self.spans.discard_pending();
        self.frozen = true;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }
}
