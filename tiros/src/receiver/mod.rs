//! OTLP/gRPC trace receiver.
//!
//! The node exports its traces here. Every batch is optionally dumped and
//! forwarded, then scanned against the matchers of the probe in flight. The
//! first matching span hands the whole batch to the driver over the match
//! channel. The export call is always acknowledged as fully accepted.
mod dump;
mod forward;
mod registry;

pub(crate) use registry::MatcherRegistry;

use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::span::TraceBatch;
use dump::TraceDump;
use forward::Forwarder;
use opentelemetry_proto::tonic::collector::trace::v1::{
    trace_service_server::{TraceService, TraceServiceServer},
    ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
};
use registry::Scan;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::metadata::MetadataMap;
use tonic::transport::Server;
use tracing::{debug, info, warn};

const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";

/// A batch that satisfied one of the registered matchers.
#[derive(Clone, Debug)]
pub struct TraceMatch {
    /// Index of the first satisfied matcher in the registered list.
    pub matcher_index: usize,
    /// Session that registered the matchers.
    pub session_id: u64,
    /// The complete batch, not only the matching span.
    pub batch: Arc<TraceBatch>,
}

/// Counters of a [`TraceReceiver`].
#[derive(Debug, Default)]
pub struct ReceiverStats {
    received: AtomicU64,
    scanned: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
}

/// Point in time copy of [`ReceiverStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReceiverStatsSnapshot {
    /// Export calls handled.
    pub received: u64,
    /// Batches scanned against registered matchers.
    pub scanned: u64,
    /// Matches delivered to the match channel.
    pub forwarded: u64,
    /// Matches dropped because the channel was full or closed.
    pub dropped: u64,
}

impl ReceiverStats {
    /// Reads all counters.
    pub fn snapshot(&self) -> ReceiverStatsSnapshot {
        ReceiverStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Implements the OTLP `TraceService` for the node under test.
///
/// Created together with its [`Correlator`](crate::Correlator).
#[derive(Clone, Debug)]
pub struct TraceReceiver {
    registry: Arc<MatcherRegistry>,
    matches: mpsc::Sender<TraceMatch>,
    send_timeout: Duration,
    stats: Arc<ReceiverStats>,
    dump: Option<TraceDump>,
    forwarder: Option<Forwarder>,
}

impl TraceReceiver {
    pub(crate) fn new(
        config: &ReceiverConfig,
        registry: Arc<MatcherRegistry>,
        matches: mpsc::Sender<TraceMatch>,
    ) -> Result<Self> {
        let dump = config
            .trace_dump_dir
            .as_ref()
            .map(TraceDump::create)
            .transpose()?;
        let forwarder = config
            .forward_endpoint
            .as_ref()
            .map(|endpoint| Forwarder::connect_lazy(endpoint.as_str(), config.send_timeout))
            .transpose()?;

        Ok(TraceReceiver {
            registry,
            matches,
            send_timeout: config.send_timeout,
            stats: Arc::new(ReceiverStats::default()),
            dump,
            forwarder,
        })
    }

    /// Shared handle to the receiver counters.
    pub fn stats(&self) -> Arc<ReceiverStats> {
        Arc::clone(&self.stats)
    }

    /// Serves the receiver on `addr` until `shutdown` is cancelled.
    pub async fn serve(self, addr: SocketAddr, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_with_listener(listener, shutdown).await
    }

    /// Serves the receiver on an already bound listener until `shutdown` is
    /// cancelled.
    pub async fn serve_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            name: "TraceReceiver.Listening",
            addr = %listener.local_addr()?,
        );
        Server::builder()
            .add_service(TraceServiceServer::new(self))
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;
        info!(name: "TraceReceiver.Stopped", "trace receiver stopped");
        Ok(())
    }

    async fn deliver(&self, trace_match: TraceMatch, deadline: Duration) {
        let (matcher_index, session_id) = (trace_match.matcher_index, trace_match.session_id);
        match tokio::time::timeout(deadline, self.matches.send(trace_match)).await {
            Ok(Ok(())) => {
                self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                debug!(
                    name: "TraceReceiver.MatchForwarded",
                    matcher_index,
                    session_id,
                );
            }
            Ok(Err(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name: "TraceReceiver.MatchDropped",
                    session_id,
                    reason = "match channel closed",
                );
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    name: "TraceReceiver.MatchDropped",
                    session_id,
                    reason = "send deadline expired",
                    deadline = ?deadline,
                );
            }
        }
    }
}

#[tonic::async_trait]
impl TraceService for TraceReceiver {
    async fn export(
        &self,
        request: tonic::Request<ExportTraceServiceRequest>,
    ) -> std::result::Result<tonic::Response<ExportTraceServiceResponse>, tonic::Status> {
        let deadline = grpc_timeout(request.metadata())
            .map_or(self.send_timeout, |timeout| timeout.min(self.send_timeout));
        let batch = Arc::new(request.into_inner());
        self.stats.received.fetch_add(1, Ordering::Relaxed);

        if let Some(dump) = &self.dump {
            if let Err(err) = dump.write(&batch).await {
                warn!(name: "TraceReceiver.DumpFailed", error = %err);
            }
        }
        if let Some(forwarder) = &self.forwarder {
            forwarder.forward(Arc::clone(&batch));
        }

        match self.registry.scan(&batch) {
            Scan::Skipped => {}
            Scan::NoMatch => {
                self.stats.scanned.fetch_add(1, Ordering::Relaxed);
            }
            Scan::Matched {
                matcher_index,
                session_id,
            } => {
                self.stats.scanned.fetch_add(1, Ordering::Relaxed);
                let trace_match = TraceMatch {
                    matcher_index,
                    session_id,
                    batch,
                };
                self.deliver(trace_match, deadline).await;
            }
        }

        Ok(tonic::Response::new(ExportTraceServiceResponse {
            partial_success: Some(ExportTracePartialSuccess {
                rejected_spans: 0,
                error_message: String::new(),
            }),
        }))
    }
}

/// Reads the caller's deadline from the `grpc-timeout` header.
fn grpc_timeout(metadata: &MetadataMap) -> Option<Duration> {
    parse_grpc_timeout(metadata.get(GRPC_TIMEOUT_HEADER)?.to_str().ok()?)
}

/// Parses a gRPC timeout value: at most 8 digits followed by a unit.
fn parse_grpc_timeout(value: &str) -> Option<Duration> {
    if value.len() < 2 || value.len() > 9 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    let timeout = match unit {
        "H" => Duration::from_secs(amount.checked_mul(3600)?),
        "M" => Duration::from_secs(amount.checked_mul(60)?),
        "S" => Duration::from_secs(amount),
        "m" => Duration::from_millis(amount),
        "u" => Duration::from_micros(amount),
        "n" => Duration::from_nanos(amount),
        _ => return None,
    };
    Some(timeout)
}
