//! Span records extracted from OTLP trace batches.
//!
//! The receiver hands batches around as raw OTLP messages. Accumulators
//! convert every span into a [`SpanRecord`] before interpreting it, which is
//! where malformed spans are detected and skipped.
use opentelemetry::trace::{SpanId, TraceId};
use opentelemetry::{StringValue, Value};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{span, Span};
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// One delivery of nested spans, exactly as received from the node.
pub type TraceBatch = ExportTraceServiceRequest;

/// Reasons a span is rejected during conversion.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SpanError {
    /// Trace ids must be 16 bytes and not all zero.
    #[error("invalid trace id of {0} bytes")]
    InvalidTraceId(usize),

    /// Span ids must be 8 bytes and not all zero.
    #[error("invalid span id of {0} bytes")]
    InvalidSpanId(usize),

    /// The span carries no start timestamp.
    #[error("span {0:?} has no start time")]
    MissingStartTime(String),

    /// The span ended before it started.
    #[error("span {name:?} ends at {end} before it starts at {start}")]
    EndBeforeStart {
        /// Span name.
        name: String,
        /// Start timestamp in unix nanoseconds.
        start: u64,
        /// End timestamp in unix nanoseconds.
        end: u64,
    },

    /// An attribute with an empty key.
    #[error("span {0:?} has an attribute without key")]
    EmptyAttributeKey(String),

    /// An event without timestamp.
    #[error("event {event:?} of span {span:?} has no timestamp")]
    MissingEventTime {
        /// Span name.
        span: String,
        /// Event name.
        event: String,
    },
}

/// A timed annotation on a span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanEvent {
    /// Event name.
    pub name: String,
    /// When the event happened.
    pub time: SystemTime,
    /// Scalar event attributes.
    pub attributes: HashMap<String, Value>,
}

/// Immutable view of a well-formed span.
#[derive(Clone, Debug, PartialEq)]
pub struct SpanRecord {
    /// Trace the span belongs to.
    pub trace_id: TraceId,
    /// Unique span id within the trace.
    pub span_id: SpanId,
    /// Parent span id, [`SpanId::INVALID`] for root spans.
    pub parent_span_id: SpanId,
    /// Span name.
    pub name: String,
    /// Span start time.
    pub start_time: SystemTime,
    /// Span end time.
    pub end_time: SystemTime,
    /// Scalar span attributes.
    pub attributes: HashMap<String, Value>,
    /// Span events in receipt order.
    pub events: Vec<SpanEvent>,
}

impl SpanRecord {
    /// Returns the attribute stored under `key`.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Returns true if the string attribute `key` equals `value`.
    pub fn has_str_attribute(&self, key: &str, value: &str) -> bool {
        str_value(self.attributes.get(key)) == Some(value)
    }

    /// Returns the integer attribute `key`, parsing string encoded numbers.
    pub fn int_attribute(&self, key: &str) -> Option<i64> {
        match self.attributes.get(key)? {
            Value::I64(v) => Some(*v),
            Value::F64(v) if v.fract() == 0.0 => Some(*v as i64),
            Value::String(v) => v.as_str().parse().ok(),
            _ => None,
        }
    }

    /// Events with the given name.
    pub fn events_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SpanEvent> + 'a {
        self.events.iter().filter(move |evt| evt.name == name)
    }
}

impl SpanEvent {
    /// Returns the string attribute `key`.
    pub fn str_attribute(&self, key: &str) -> Option<&str> {
        str_value(self.attributes.get(key))
    }
}

fn str_value(value: Option<&Value>) -> Option<&str> {
    match value? {
        Value::String(s) => Some(s.as_str()),
        _ => None,
    }
}

impl TryFrom<&Span> for SpanRecord {
    type Error = SpanError;

    fn try_from(span: &Span) -> Result<Self, Self::Error> {
        let trace_id = trace_id_from_bytes(&span.trace_id)
            .ok_or(SpanError::InvalidTraceId(span.trace_id.len()))?;
        let span_id = span_id_from_bytes(&span.span_id)
            .ok_or(SpanError::InvalidSpanId(span.span_id.len()))?;
        let parent_span_id = span_id_from_bytes(&span.parent_span_id).unwrap_or(SpanId::INVALID);

        if span.start_time_unix_nano == 0 {
            return Err(SpanError::MissingStartTime(span.name.clone()));
        }
        if span.end_time_unix_nano < span.start_time_unix_nano {
            return Err(SpanError::EndBeforeStart {
                name: span.name.clone(),
                start: span.start_time_unix_nano,
                end: span.end_time_unix_nano,
            });
        }

        let attributes = convert_attributes(&span.attributes)
            .ok_or_else(|| SpanError::EmptyAttributeKey(span.name.clone()))?;
        let events = span
            .events
            .iter()
            .map(|evt| convert_event(&span.name, evt))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SpanRecord {
            trace_id,
            span_id,
            parent_span_id,
            name: span.name.clone(),
            start_time: from_unix_nanos(span.start_time_unix_nano),
            end_time: from_unix_nanos(span.end_time_unix_nano),
            attributes,
            events,
        })
    }
}

fn convert_event(span_name: &str, evt: &span::Event) -> Result<SpanEvent, SpanError> {
    if evt.time_unix_nano == 0 {
        return Err(SpanError::MissingEventTime {
            span: span_name.to_string(),
            event: evt.name.clone(),
        });
    }
    let attributes = convert_attributes(&evt.attributes)
        .ok_or_else(|| SpanError::EmptyAttributeKey(span_name.to_string()))?;
    Ok(SpanEvent {
        name: evt.name.clone(),
        time: from_unix_nanos(evt.time_unix_nano),
        attributes,
    })
}

/// Converts scalar attributes. Attributes without a value or with a
/// structured value are ignored; `None` signals an attribute without key.
fn convert_attributes(attributes: &[KeyValue]) -> Option<HashMap<String, Value>> {
    let mut converted = HashMap::with_capacity(attributes.len());
    for kv in attributes {
        if kv.key.is_empty() {
            return None;
        }
        let value = match kv.value.as_ref().and_then(|v| v.value.as_ref()) {
            Some(any_value::Value::StringValue(s)) => Value::String(StringValue::from(s.clone())),
            Some(any_value::Value::IntValue(i)) => Value::I64(*i),
            Some(any_value::Value::DoubleValue(d)) => Value::F64(*d),
            Some(any_value::Value::BoolValue(b)) => Value::Bool(*b),
            _ => continue,
        };
        converted.insert(kv.key.clone(), value);
    }
    Some(converted)
}

/// Parses a 16 byte OTLP trace id, rejecting the invalid all-zero id.
pub fn trace_id_from_bytes(bytes: &[u8]) -> Option<TraceId> {
    let bytes: [u8; 16] = bytes.try_into().ok()?;
    let id = TraceId::from_bytes(bytes);
    (id != TraceId::INVALID).then_some(id)
}

/// Parses an 8 byte OTLP span id, rejecting the invalid all-zero id.
pub fn span_id_from_bytes(bytes: &[u8]) -> Option<SpanId> {
    let bytes: [u8; 8] = bytes.try_into().ok()?;
    let id = SpanId::from_bytes(bytes);
    (id != SpanId::INVALID).then_some(id)
}

/// Converts an OTLP timestamp.
pub fn from_unix_nanos(nanos: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_nanos(nanos)
}

/// Converts a timestamp back to unix nanoseconds, saturating at the epoch.
pub fn to_unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

/// Iterates over every span of a batch in receipt order.
pub fn batch_spans(batch: &TraceBatch) -> impl Iterator<Item = &Span> {
    batch
        .resource_spans
        .iter()
        .flat_map(|rs| rs.scope_spans.iter())
        .flat_map(|ss| ss.spans.iter())
}
