//! Drives one probe through arm, act, drain and finalize.
//!
//! The driver holds the [`Session`](crate::Session) for the whole probe.
//! The action and the match channel are polled from the same task, so
//! telemetry that arrives while the action is still running is consumed
//! right away. Draining ends when the result is complete, when the drain
//! deadline passes, or on cancellation. Whatever the result holds at that
//! point is frozen and returned.
mod download;
mod upload;

use crate::config::DriverConfig;
use crate::invoker::ActionInvoker;
use crate::session::Correlator;
use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const PROBE_CANCELLED: &str = "probe cancelled";

/// Trace context of one action, propagated to the node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeContext {
    /// Trace the node's telemetry of the action will carry.
    pub trace_id: TraceId,
    /// Remote parent span of the action.
    pub span_id: SpanId,
}

impl ProbeContext {
    /// Generates a random context.
    pub fn generate() -> Self {
        let ids = RandomIdGenerator::default();
        ProbeContext {
            trace_id: ids.new_trace_id(),
            span_id: ids.new_span_id(),
        }
    }

    /// The sampled remote span context to inject into requests.
    pub fn span_context(&self) -> SpanContext {
        SpanContext::new(
            self.trace_id,
            self.span_id,
            TraceFlags::SAMPLED,
            true,
            TraceState::default(),
        )
    }
}

/// Runs upload and download probes against a node.
#[derive(Debug)]
pub struct ActionDriver<I: ?Sized> {
    correlator: Correlator,
    invoker: Arc<I>,
    config: DriverConfig,
    shutdown: CancellationToken,
}

impl<I: ActionInvoker + ?Sized> ActionDriver<I> {
    /// Creates a driver. Cancelling `shutdown` ends any running probe.
    pub fn new(
        correlator: Correlator,
        invoker: Arc<I>,
        config: DriverConfig,
        shutdown: CancellationToken,
    ) -> Self {
        ActionDriver {
            correlator,
            invoker,
            config,
            shutdown,
        }
    }

    /// The invoker actions are performed with.
    pub fn invoker(&self) -> &Arc<I> {
        &self.invoker
    }
}
