//! Builders for OTLP trace batches and a scripted [`ActionInvoker`].
use crate::driver::ProbeContext;
use crate::invoker::{ActionError, ActionInvoker, ByteStream};
use crate::span::TraceBatch;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{span::Event, ResourceSpans, ScopeSpans, Span};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// A string attribute.
pub fn str_attr(key: impl Into<String>, value: impl Into<String>) -> KeyValue {
    KeyValue {
        key: key.into(),
        value: Some(AnyValue {
            value: Some(any_value::Value::StringValue(value.into())),
        }),
    }
}

/// An integer attribute.
pub fn int_attr(key: impl Into<String>, value: i64) -> KeyValue {
    KeyValue {
        key: key.into(),
        value: Some(AnyValue {
            value: Some(any_value::Value::IntValue(value)),
        }),
    }
}

/// A span event at `time_unix_nano`.
pub fn event(name: impl Into<String>, time_unix_nano: u64, attributes: Vec<KeyValue>) -> Event {
    Event {
        name: name.into(),
        time_unix_nano,
        attributes,
        ..Default::default()
    }
}

/// Wraps `spans` into a batch with a single resource and scope.
pub fn batch(spans: Vec<Span>) -> TraceBatch {
    TraceBatch {
        resource_spans: vec![ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }],
    }
}

/// Builds an OTLP span.
#[derive(Clone, Debug)]
pub struct SpanFixture {
    span: Span,
}

impl SpanFixture {
    /// A root span of `trace_id` lasting from `start` to `end` unix nanoseconds.
    pub fn new(trace_id: TraceId, span_id: u64, name: impl Into<String>, start: u64, end: u64) -> Self {
        SpanFixture {
            span: Span {
                trace_id: trace_id.to_bytes().to_vec(),
                span_id: SpanId::from(span_id).to_bytes().to_vec(),
                name: name.into(),
                start_time_unix_nano: start,
                end_time_unix_nano: end,
                ..Default::default()
            },
        }
    }

    /// Sets the parent span.
    pub fn parent(mut self, span_id: u64) -> Self {
        self.span.parent_span_id = SpanId::from(span_id).to_bytes().to_vec();
        self
    }

    /// Adds an attribute.
    pub fn attr(mut self, attribute: KeyValue) -> Self {
        self.span.attributes.push(attribute);
        self
    }

    /// Adds an event.
    pub fn event(mut self, event: Event) -> Self {
        self.span.events.push(event);
        self
    }

    /// The span.
    pub fn build(self) -> Span {
        self.span
    }
}

type InvokeHook = Arc<dyn Fn(&ProbeContext) + Send + Sync>;

/// An [`ActionInvoker`] replaying a scripted outcome.
///
/// Every invocation is recorded, then the hook set with
/// [`on_invoke`](MockInvoker::on_invoke) runs, then the configured delay
/// elapses before the scripted outcome is returned.
#[derive(Clone, Default)]
pub struct MockInvoker {
    content_id: Option<String>,
    chunks: Vec<Bytes>,
    delay: Option<Duration>,
    failure: Option<String>,
    hook: Option<InvokeHook>,
    calls: Arc<Mutex<Vec<ProbeContext>>>,
}

impl fmt::Debug for MockInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockInvoker")
            .field("content_id", &self.content_id)
            .field("chunks", &self.chunks.len())
            .field("delay", &self.delay)
            .field("failure", &self.failure)
            .finish()
    }
}

impl MockInvoker {
    /// An invoker without scripted outcome. Uploads fail, downloads are empty.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uploads return `content_id`.
    pub fn with_content_id(mut self, content_id: impl Into<String>) -> Self {
        self.content_id = Some(content_id.into());
        self
    }

    /// Downloads yield `chunks`.
    pub fn with_chunks(mut self, chunks: Vec<Bytes>) -> Self {
        self.chunks = chunks;
        self
    }

    /// Every action takes `delay` before it returns.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every action fails with `reason`.
    pub fn failing(mut self, reason: impl Into<String>) -> Self {
        self.failure = Some(reason.into());
        self
    }

    /// Runs `hook` with the context of every invocation.
    pub fn on_invoke<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ProbeContext) + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// Contexts of all invocations so far.
    pub fn calls(&self) -> Vec<ProbeContext> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn invoke(&self, cx: &ProbeContext) -> Result<(), ActionError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(*cx);
        if let Some(hook) = &self.hook {
            hook(cx);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.failure {
            Some(reason) => Err(ActionError::Other(reason.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ActionInvoker for MockInvoker {
    async fn upload(&self, cx: &ProbeContext, _content: Bytes) -> Result<String, ActionError> {
        self.invoke(cx).await?;
        self.content_id
            .clone()
            .ok_or_else(|| ActionError::Other("no content id scripted".into()))
    }

    async fn download(&self, cx: &ProbeContext, _content_id: &str) -> Result<ByteStream, ActionError> {
        self.invoke(cx).await?;
        Ok(stream::iter(self.chunks.clone().into_iter().map(Ok)).boxed())
    }
}
