use crate::conventions::{
    BITSWAP_GET_BLOCK, BITSWAP_HANDLE_INCOMING, CMDS_HANDLER, CONNECTED_TO_PROVIDER,
    DELEGATED_FIND_PROVIDERS, DHT_FIND_PROVIDERS, FIND_PROVIDERS, FIND_PROVIDERS_CID,
    FOUND_PROVIDER, HTTP_STATUS_CODE, IDLE_BROADCAST, PEER, RECEIVED_BLOCK,
};
use crate::result::Accumulator;
use crate::span::{SpanRecord, TraceBatch};
use crate::store::{IngestStats, SpanStore, TraceSpans};
use opentelemetry::trace::TraceId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// How a download located a provider of the content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscoveryMethod {
    /// A DHT provider query started before the first block arrived.
    Dht,
    /// An IPNI query started before the first block arrived.
    Ipni,
    /// The block arrived through a bitswap broadcast to connected peers.
    Bitswap,
}

impl DiscoveryMethod {
    /// Lowercase name of the method.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscoveryMethod::Dht => "dht",
            DiscoveryMethod::Ipni => "ipni",
            DiscoveryMethod::Bitswap => "bitswap",
        }
    }
}

impl fmt::Display for DiscoveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and provider discovery of one download.
#[derive(Clone, Debug)]
pub struct DownloadResult {
    content_id: String,
    cat_trace_id: TraceId,
    cat_start: SystemTime,
    cat_end: Option<SystemTime>,
    time_to_first_byte: Option<Duration>,
    file_size: Option<u64>,
    found_providers_count: usize,
    connected_providers_count: usize,
    first_connected_provider_found_at: Option<SystemTime>,
    first_provider_connected_at: Option<SystemTime>,
    first_connected_provider_peer_id: Option<String>,
    idle_broadcast_started_at: Option<SystemTime>,
    index_query_start: Option<SystemTime>,
    index_query_end: Option<SystemTime>,
    index_query_status: Option<i64>,
    first_block_received_at: Option<SystemTime>,
    discovery_method: Option<DiscoveryMethod>,
    done: bool,
    error: Option<String>,
    spans: SpanStore,
    frozen: bool,
}

/// Fields derived from provider search spans.
#[derive(Default)]
struct Providers {
    found: usize,
    connected: usize,
    first_peer: Option<String>,
    first_found_at: Option<SystemTime>,
    first_connected_at: Option<SystemTime>,
}

impl DownloadResult {
    /// Creates the result of retrieving `content_id` traced under
    /// `cat_trace_id`. The download is considered started now.
    pub fn new(content_id: impl Into<String>, cat_trace_id: TraceId) -> Self {
        DownloadResult {
            content_id: content_id.into(),
            cat_trace_id,
            cat_start: SystemTime::now(),
            cat_end: None,
            time_to_first_byte: None,
            file_size: None,
            found_providers_count: 0,
            connected_providers_count: 0,
            first_connected_provider_found_at: None,
            first_provider_connected_at: None,
            first_connected_provider_peer_id: None,
            idle_broadcast_started_at: None,
            index_query_start: None,
            index_query_end: None,
            index_query_status: None,
            first_block_received_at: None,
            discovery_method: None,
            done: false,
            error: None,
            spans: SpanStore::tracking([cat_trace_id]),
            frozen: false,
        }
    }

    /// Records the end of the payload transfer. Both durations are measured
    /// from the cat start, so the transfer ends at `cat_start + duration`.
    pub fn record_transfer(
        &mut self,
        time_to_first_byte: Option<Duration>,
        duration: Duration,
        file_size: u64,
    ) {
        self.time_to_first_byte = time_to_first_byte;
        self.cat_end = Some(self.cat_start + duration);
        self.file_size = Some(file_size);
    }

    /// Records a failure. Multiple failures are joined.
    pub fn record_error(&mut self, error: impl Into<String>) {
        let error = error.into();
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{previous}; {error}"),
            None => error,
        });
    }

    /// Content id that was retrieved.
    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// Trace of the retrieval request.
    pub fn cat_trace_id(&self) -> TraceId {
        self.cat_trace_id
    }

    /// When the retrieval request was started.
    pub fn cat_start(&self) -> SystemTime {
        self.cat_start
    }

    /// When the payload transfer ended.
    pub fn cat_end(&self) -> Option<SystemTime> {
        self.cat_end
    }

    /// Time from the request start to the first payload byte.
    pub fn time_to_first_byte(&self) -> Option<Duration> {
        self.time_to_first_byte
    }

    /// Number of payload bytes read.
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    /// Number of distinct providers found.
    pub fn found_providers_count(&self) -> usize {
        self.found_providers_count
    }

    /// Number of found providers a connection was established to.
    pub fn connected_providers_count(&self) -> usize {
        self.connected_providers_count
    }

    /// When the first connected provider was found.
    pub fn first_connected_provider_found_at(&self) -> Option<SystemTime> {
        self.first_connected_provider_found_at
    }

    /// When the first connection to a provider was established.
    pub fn first_provider_connected_at(&self) -> Option<SystemTime> {
        self.first_provider_connected_at
    }

    /// Peer id of the first connected provider.
    pub fn first_connected_provider_peer_id(&self) -> Option<&str> {
        self.first_connected_provider_peer_id.as_deref()
    }

    /// When the want was first broadcast to all connected peers.
    pub fn idle_broadcast_started_at(&self) -> Option<SystemTime> {
        self.idle_broadcast_started_at
    }

    /// Start of the earliest index query.
    pub fn index_query_start(&self) -> Option<SystemTime> {
        self.index_query_start
    }

    /// End of the earliest index query.
    pub fn index_query_end(&self) -> Option<SystemTime> {
        self.index_query_end
    }

    /// HTTP status of the earliest index query.
    pub fn index_query_status(&self) -> Option<i64> {
        self.index_query_status
    }

    /// When the first data block arrived.
    pub fn first_block_received_at(&self) -> Option<SystemTime> {
        self.first_block_received_at
    }

    /// How the provider was located. Unknown until the result is done, then
    /// reclassified from the full span set on every later batch.
    pub fn discovery_method(&self) -> Option<DiscoveryMethod> {
        self.discovery_method
    }

    /// Returns true once the span enclosing the retrieval has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Failure of the download, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Tracked spans grouped by trace.
    pub fn spans_by_trace(&self) -> &HashMap<TraceId, TraceSpans> {
        self.spans.spans_by_trace()
    }

    fn is_anchor(&self, span: &SpanRecord) -> bool {
        span.name == FIND_PROVIDERS && span.has_str_attribute(FIND_PROVIDERS_CID, &self.content_id)
    }

    fn recompute(&mut self) {
        let search_traces: HashSet<TraceId> = self
            .spans
            .all_spans()
            .filter(|span| self.is_anchor(span))
            .map(|span| span.trace_id)
            .collect();
        for trace_id in &search_traces {
            if self.spans.track(*trace_id) {
                debug!(name: "DownloadResult.SearchTraceTracked", trace_id = %trace_id);
            }
        }

        let providers = self.providers(&search_traces);
        self.found_providers_count = providers.found;
        self.connected_providers_count = providers.connected;
        self.first_connected_provider_peer_id = providers.first_peer;
        self.first_connected_provider_found_at = providers.first_found_at;
        self.first_provider_connected_at = providers.first_connected_at;

        let index_query = search_traces
            .iter()
            .flat_map(|trace_id| self.spans.trace_spans(trace_id))
            .filter(|span| span.name == DELEGATED_FIND_PROVIDERS)
            .min_by(|a, b| {
                a.start_time
                    .cmp(&b.start_time)
                    .then_with(|| a.span_id.to_bytes().cmp(&b.span_id.to_bytes()))
            });
        self.index_query_start = index_query.map(|span| span.start_time);
        self.index_query_end = index_query.map(|span| span.end_time);
        self.index_query_status = index_query.and_then(|span| span.int_attribute(HTTP_STATUS_CODE));

        self.first_block_received_at = self.earliest_cat_event(BITSWAP_HANDLE_INCOMING, RECEIVED_BLOCK);
        self.idle_broadcast_started_at = self.earliest_cat_event(BITSWAP_GET_BLOCK, IDLE_BROADCAST);
        self.done |= self
            .spans
            .trace_spans(&self.cat_trace_id)
            .any(|span| span.name == CMDS_HANDLER);

        if self.done {
            self.discovery_method = Some(self.classify());
        }
    }

    fn providers(&self, search_traces: &HashSet<TraceId>) -> Providers {
        let mut found: HashMap<&str, SystemTime> = HashMap::new();
        let mut connected: HashMap<&str, SystemTime> = HashMap::new();
        let anchors = search_traces
            .iter()
            .flat_map(|trace_id| self.spans.trace_spans(trace_id))
            .filter(|span| self.is_anchor(span));
        for span in anchors {
            for event in &span.events {
                let peers = match event.name.as_str() {
                    FOUND_PROVIDER => &mut found,
                    CONNECTED_TO_PROVIDER => &mut connected,
                    _ => continue,
                };
                if let Some(peer) = event.str_attribute(PEER) {
                    peers
                        .entry(peer)
                        .and_modify(|at| *at = (*at).min(event.time))
                        .or_insert(event.time);
                }
            }
        }

        let connected_found: Vec<(&str, SystemTime)> = connected
            .into_iter()
            .filter(|(peer, _)| found.contains_key(peer))
            .collect();
        let first = connected_found
            .iter()
            .min_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Providers {
            found: found.len(),
            connected: connected_found.len(),
            first_peer: first.map(|(peer, _)| peer.to_string()),
            first_found_at: first.and_then(|(peer, _)| found.get(peer).copied()),
            first_connected_at: first.map(|(_, at)| *at),
        }
    }

    fn earliest_cat_event(&self, span_name: &str, event_name: &str) -> Option<SystemTime> {
        self.spans
            .trace_spans(&self.cat_trace_id)
            .filter(|span| span.name == span_name)
            .flat_map(|span| span.events_named(event_name))
            .map(|event| event.time)
            .min()
    }

    fn classify(&self) -> DiscoveryMethod {
        let before_first_block = |start: SystemTime| match self.first_block_received_at {
            Some(first_block) => start < first_block,
            None => true,
        };

        let dht_start = self
            .spans
            .tracked_spans()
            .filter(|span| span.name == DHT_FIND_PROVIDERS)
            .map(|span| span.start_time)
            .min();

        if dht_start.is_some_and(before_first_block) {
            DiscoveryMethod::Dht
        } else if self.index_query_start.is_some_and(before_first_block) {
            DiscoveryMethod::Ipni
        } else {
            DiscoveryMethod::Bitswap
        }
    }
}

impl Accumulator for DownloadResult {
    fn parse(&mut self, batch: &TraceBatch) -> IngestStats {
        if self.frozen {
            return IngestStats::default();
        }
        let stats = self.spans.ingest(batch);
        self.recompute();
        stats
    }

    /// Done and the payload transfer has ended.
    fn is_complete(&self) -> bool {
        self.done && self.cat_end.is_some()
    }

    fn freeze(&mut self) {
        self.spans.discard_pending();
        self.frozen = true;
    }

    fn is_frozen(&self) -> bool {
        self.frozen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::to_unix_nanos;
    use crate::testing::{batch, event, int_attr, str_attr, SpanFixture};
    use opentelemetry_proto::tonic::trace::v1::span::Event;

    const CID: &str = "bafkreigmes4fo2xnpixfk4syb5m27iok7rusrh6yziod4y5kunfhb6mf5e";
    const CAT_TRACE: u128 = 0x100;
    const SEARCH_TRACE: u128 = 0x200;
    const T0: u64 = 1760467600000000000;
    const MS: u64 = 1_000_000;

    fn peer(i: usize) -> String {
        format!("12D3KooWProvider{i:02}")
    }

    fn peer_event(name: &str, i: usize, at: u64) -> Event {
        event(name, at, vec![str_attr(PEER, peer(i))])
    }

    fn search_span(span_id: u64, found: std::ops::Range<usize>, connected: &[usize], offset: u64) -> SpanFixture {
        let mut span = SpanFixture::new(TraceId::from(SEARCH_TRACE), span_id, FIND_PROVIDERS, T0 + MS, T0 + 900 * MS)
            .attr(str_attr(FIND_PROVIDERS_CID, CID));
        for i in found {
            span = span.event(peer_event(FOUND_PROVIDER, i, T0 + offset + i as u64 * MS));
        }
        for &i in connected {
            span = span.event(peer_event(CONNECTED_TO_PROVIDER, i, T0 + offset + 100 * MS + i as u64 * MS));
        }
        span
    }

    fn index_path_batches() -> Vec<TraceBatch> {
        vec![
            batch(vec![search_span(1, 0..40, &[0, 1, 2, 3, 4, 5], 10 * MS).build()]),
            batch(vec![search_span(2, 30..66, &[6, 7, 8, 9, 0], 20 * MS).build()]),
            batch(vec![
                SpanFixture::new(TraceId::from(SEARCH_TRACE), 3, DELEGATED_FIND_PROVIDERS, T0 + 2 * MS, T0 + 300 * MS)
                    .parent(1)
                    .attr(int_attr(HTTP_STATUS_CODE, 200))
                    .build(),
                SpanFixture::new(TraceId::from(SEARCH_TRACE), 4, DELEGATED_FIND_PROVIDERS, T0 + 50 * MS, T0 + 310 * MS)
                    .parent(2)
                    .attr(int_attr(HTTP_STATUS_CODE, 404))
                    .build(),
            ]),
            batch(vec![
                SpanFixture::new(TraceId::from(CAT_TRACE), 1, CMDS_HANDLER, T0, T0 + 1200 * MS).build(),
                SpanFixture::new(TraceId::from(CAT_TRACE), 2, BITSWAP_GET_BLOCK, T0 + MS, T0 + 400 * MS)
                    .parent(1)
                    .event(event(IDLE_BROADCAST, T0 + 5 * MS, vec![]))
                    .build(),
                SpanFixture::new(TraceId::from(CAT_TRACE), 3, BITSWAP_HANDLE_INCOMING, T0 + 340 * MS, T0 + 420 * MS)
                    .event(event(RECEIVED_BLOCK, T0 + 400 * MS, vec![]))
                    .event(event(RECEIVED_BLOCK, T0 + 350 * MS, vec![]))
                    .build(),
            ]),
        ]
    }

    fn direct_path_batch() -> TraceBatch {
        batch(vec![
            SpanFixture::new(TraceId::from(CAT_TRACE), 1, CMDS_HANDLER, T0, T0 + 80 * MS).build(),
            SpanFixture::new(TraceId::from(CAT_TRACE), 2, BITSWAP_HANDLE_INCOMING, T0 + 20 * MS, T0 + 30 * MS)
                .event(event(RECEIVED_BLOCK, T0 + 25 * MS, vec![]))
                .build(),
        ])
    }

    fn new_result() -> DownloadResult {
        DownloadResult::new(CID, TraceId::from(CAT_TRACE))
    }

    fn assert_index_path(result: &DownloadResult) {
        assert!(result.is_done());
        assert_eq!(result.found_providers_count(), 66);
        assert_eq!(result.connected_providers_count(), 10);
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Ipni));
        assert_eq!(result.index_query_status(), Some(200));
        assert_eq!(to_unix_nanos(result.index_query_start().unwrap()), T0 + 2 * MS);
        assert_eq!(to_unix_nanos(result.index_query_end().unwrap()), T0 + 300 * MS);
        assert_eq!(to_unix_nanos(result.first_block_received_at().unwrap()), T0 + 350 * MS);
        assert_eq!(to_unix_nanos(result.idle_broadcast_started_at().unwrap()), T0 + 5 * MS);
        assert_eq!(result.first_connected_provider_peer_id(), Some(peer(0).as_str()));
        assert_eq!(
            to_unix_nanos(result.first_provider_connected_at().unwrap()),
            T0 + 110 * MS
        );
        assert_eq!(
            to_unix_nanos(result.first_connected_provider_found_at().unwrap()),
            T0 + 10 * MS
        );
    }

    fn permutations(n: usize) -> Vec<Vec<usize>> {
        if n == 0 {
            return vec![vec![]];
        }
        let mut all = Vec::new();
        for rest in permutations(n - 1) {
            for pos in 0..=rest.len() {
                let mut order = rest.clone();
                order.insert(pos, n - 1);
                all.push(order);
            }
        }
        all
    }

    #[test]
    fn index_path() {
        let mut result = new_result();
        for delivery in index_path_batches() {
            result.parse(&delivery);
        }
        assert_index_path(&result);
        assert!(!result.is_complete());

        result.record_transfer(Some(Duration::from_millis(420)), Duration::from_millis(900), 1024);
        assert!(result.is_complete());
    }

    #[test]
    fn index_path_in_any_order() {
        let batches = index_path_batches();
        for order in permutations(batches.len()) {
            let mut result = new_result();
            for i in order {
                result.parse(&batches[i]);
            }
            assert_index_path(&result);
        }
    }

    #[test]
    fn index_path_is_idempotent() {
        let mut result = new_result();
        for delivery in index_path_batches() {
            result.parse(&delivery);
            let again = result.parse(&delivery);
            assert_eq!(again.accepted, 0);
        }
        assert_index_path(&result);
    }

    #[test]
    fn direct_path() {
        let mut result = new_result();
        result.parse(&direct_path_batch());

        assert!(result.is_done());
        assert_eq!(result.found_providers_count(), 0);
        assert_eq!(result.connected_providers_count(), 0);
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Bitswap));
        assert_eq!(to_unix_nanos(result.first_block_received_at().unwrap()), T0 + 25 * MS);
        assert!(result.index_query_start().is_none());
        assert!(result.first_connected_provider_peer_id().is_none());
    }

    #[test]
    fn discovery_unknown_until_done() {
        let mut result = new_result();
        let batches = index_path_batches();
        for delivery in &batches[..3] {
            result.parse(delivery);
        }
        assert!(!result.is_done());
        assert_eq!(result.discovery_method(), None);
        assert_eq!(result.found_providers_count(), 66);
    }

    #[test]
    fn dht_query_before_first_block() {
        let mut result = new_result();
        for delivery in index_path_batches() {
            result.parse(&delivery);
        }
        result.parse(&batch(vec![SpanFixture::new(
            TraceId::from(SEARCH_TRACE),
            9,
            DHT_FIND_PROVIDERS,
            T0 + MS,
            T0 + 700 * MS,
        )
        .build()]));
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Dht));
    }

    #[test]
    fn dht_query_without_block() {
        let mut result = new_result();
        result.parse(&batch(vec![
            SpanFixture::new(TraceId::from(CAT_TRACE), 1, CMDS_HANDLER, T0, T0 + 80 * MS).build(),
            SpanFixture::new(TraceId::from(CAT_TRACE), 2, DHT_FIND_PROVIDERS, T0 + MS, T0 + 70 * MS).build(),
        ]));
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Dht));
    }

    #[test]
    fn late_index_query_is_bitswap() {
        let mut result = new_result();
        result.parse(&direct_path_batch());
        result.parse(&batch(vec![search_span(1, 0..2, &[0], 0).build()]));
        result.parse(&batch(vec![SpanFixture::new(
            TraceId::from(SEARCH_TRACE),
            3,
            DELEGATED_FIND_PROVIDERS,
            T0 + 60 * MS,
            T0 + 70 * MS,
        )
        .attr(str_attr(HTTP_STATUS_CODE, "200"))
        .build()]));

        assert_eq!(result.index_query_status(), Some(200));
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Bitswap));
    }

    #[test]
    fn first_connection_tie_picks_smallest_peer() {
        let mut result = new_result();
        let span = SpanFixture::new(TraceId::from(SEARCH_TRACE), 1, FIND_PROVIDERS, T0, T0 + 10 * MS)
            .attr(str_attr(FIND_PROVIDERS_CID, CID))
            .event(peer_event(FOUND_PROVIDER, 7, T0 + MS))
            .event(peer_event(FOUND_PROVIDER, 3, T0 + 2 * MS))
            .event(peer_event(CONNECTED_TO_PROVIDER, 7, T0 + 5 * MS))
            .event(peer_event(CONNECTED_TO_PROVIDER, 3, T0 + 5 * MS))
            .event(peer_event(CONNECTED_TO_PROVIDER, 9, T0 + 4 * MS))
            .build();
        result.parse(&batch(vec![span]));

        assert_eq!(result.found_providers_count(), 2);
        assert_eq!(result.connected_providers_count(), 2);
        assert_eq!(result.first_connected_provider_peer_id(), Some(peer(3).as_str()));
        assert_eq!(
            to_unix_nanos(result.first_connected_provider_found_at().unwrap()),
            T0 + 2 * MS
        );
    }

    #[test]
    fn other_content_ids_are_not_anchors() {
        let mut result = new_result();
        let span = SpanFixture::new(TraceId::from(0x300u128), 1, FIND_PROVIDERS, T0, T0 + MS)
            .attr(str_attr(FIND_PROVIDERS_CID, "bafkreiother"))
            .event(peer_event(FOUND_PROVIDER, 1, T0))
            .build();
        result.parse(&batch(vec![span]));

        assert_eq!(result.found_providers_count(), 0);
        assert!(!result.spans_by_trace().contains_key(&TraceId::from(0x300u128)));
    }

    #[test]
    fn done_never_reverts() {
        let mut result = new_result();
        result.parse(&direct_path_batch());
        assert!(result.is_done());
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Bitswap));
        for delivery in index_path_batches() {
            result.parse(&delivery);
            assert!(result.is_done());
            assert!(result.discovery_method().is_some());
        }

        // The index query started before the earliest block, whichever
        // delivery carried it.
        assert_eq!(result.discovery_method(), Some(DiscoveryMethod::Ipni));
        let mut reordered = new_result();
        for delivery in index_path_batches().into_iter().rev() {
            reordered.parse(&delivery);
        }
        reordered.parse(&direct_path_batch());
        assert_eq!(reordered.discovery_method(), result.discovery_method());
    }

    #[test]
    fn serializes_discovery_method() {
        assert_eq!(serde_json::to_string(&DiscoveryMethod::Ipni).unwrap(), r#""ipni""#);
        assert_eq!(DiscoveryMethod::Bitswap.to_string(), "bitswap");
    }
}
