//! Span predicates that tie incoming telemetry to the probe in flight.
use opentelemetry::trace::TraceId;
use opentelemetry_proto::tonic::common::v1::any_value;
use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans, Span};
use serde::{Deserialize, Serialize};

/// A predicate over a received span.
///
/// Matching is exact: trace ids compare byte for byte, names and attribute
/// values compare as strings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceMatcher {
    /// The span belongs to the given trace.
    TraceId(#[serde(with = "hex_trace_id")] TraceId),
    /// The span carries a string attribute `key` equal to `value`.
    Attribute {
        /// Attribute key.
        key: String,
        /// Expected string value.
        value: String,
    },
    /// The span has the given name.
    Name(String),
}

impl TraceMatcher {
    /// Shorthand for [`TraceMatcher::Attribute`].
    pub fn attribute(key: impl Into<String>, value: impl Into<String>) -> Self {
        TraceMatcher::Attribute {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Shorthand for [`TraceMatcher::Name`].
    pub fn name(name: impl Into<String>) -> Self {
        TraceMatcher::Name(name.into())
    }

    /// Evaluates the predicate for `span` nested in `resource` and `scope`.
    pub fn matches(&self, _resource: &ResourceSpans, _scope: &ScopeSpans, span: &Span) -> bool {
        match self {
            TraceMatcher::TraceId(trace_id) => span.trace_id == trace_id.to_bytes(),
            TraceMatcher::Attribute { key, value } => span.attributes.iter().any(|kv| {
                kv.key == *key
                    && matches!(
                        kv.value.as_ref().and_then(|v| v.value.as_ref()),
                        Some(any_value::Value::StringValue(s)) if s == value
                    )
            }),
            TraceMatcher::Name(name) => span.name == *name,
        }
    }
}

/// Finds the first span of `resource_spans` satisfying one of `matchers`.
///
/// Spans are visited resource first, then scope, then span; for each span
/// matchers are tried in order. Returns the index of the satisfied matcher.
pub fn first_match(resource_spans: &[ResourceSpans], matchers: &[TraceMatcher]) -> Option<usize> {
    for resource in resource_spans {
        for scope in &resource.scope_spans {
            for span in &scope.spans {
                if let Some(index) = matchers
                    .iter()
                    .position(|matcher| matcher.matches(resource, scope, span))
                {
                    return Some(index);
                }
            }
        }
    }
    None
}

mod hex_trace_id {
    use opentelemetry::trace::TraceId;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(id: &TraceId, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{id:032x}"))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<TraceId, D::Error> {
        let hex = String::deserialize(deserializer)?;
        if hex.len() != 32 {
            return Err(D::Error::custom(format!("trace id {hex:?} is not 32 hex digits")));
        }
        TraceId::from_hex(&hex).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{str_attr, SpanFixture};
    use opentelemetry_proto::tonic::trace::v1::{ResourceSpans, ScopeSpans};
    use rstest::rstest;

    fn nest(spans: Vec<Span>) -> ResourceSpans {
        ResourceSpans {
            scope_spans: vec![ScopeSpans {
                spans,
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[rstest]
    #[case(TraceMatcher::TraceId(TraceId::from(0xabu128)), true)]
    #[case(TraceMatcher::TraceId(TraceId::from(0xacu128)), false)]
    #[case(TraceMatcher::name("IpfsDHT.Provide"), true)]
    #[case(TraceMatcher::name("ipfsdht.provide"), false)]
    #[case(TraceMatcher::attribute("key", "bafkreiraw"), true)]
    #[case(TraceMatcher::attribute("key", "bafkrei"), false)]
    #[case(TraceMatcher::attribute("other", "bafkreiraw"), false)]
    fn evaluates_predicates(#[case] matcher: TraceMatcher, #[case] expected: bool) {
        let span = SpanFixture::new(TraceId::from(0xabu128), 1, "IpfsDHT.Provide", 1, 2)
            .attr(str_attr("peer", "12D3"))
            .attr(str_attr("key", "bafkreiraw"))
            .build();
        let resource = nest(vec![span.clone()]);
        let scope = &resource.scope_spans[0];
        assert_eq!(matcher.matches(&resource, scope, &span), expected);
    }

    #[test]
    fn first_match_stops_at_first_span() {
        let trace_id = TraceId::from(5u128);
        let resource = nest(vec![
            SpanFixture::new(trace_id, 1, "corehttp.cmdsHandler", 1, 2).build(),
            SpanFixture::new(TraceId::from(6u128), 2, "IpfsDHT.Provide", 1, 2).build(),
        ]);
        let matchers = vec![
            TraceMatcher::name("IpfsDHT.Provide"),
            TraceMatcher::TraceId(trace_id),
        ];
        assert_eq!(first_match(&[resource], &matchers), Some(1));
    }

    #[test]
    fn first_match_without_hit() {
        let resource = nest(vec![SpanFixture::new(TraceId::from(5u128), 1, "x", 1, 2).build()]);
        assert_eq!(first_match(&[resource], &[TraceMatcher::name("y")]), None);
        assert_eq!(first_match(&[], &[TraceMatcher::name("x")]), None);
    }

    #[test]
    fn serializes_trace_id_as_hex() {
        let matchers = vec![
            TraceMatcher::TraceId(TraceId::from(0x0102u128)),
            TraceMatcher::attribute("key", "v"),
            TraceMatcher::name("n"),
        ];
        let json = serde_json::to_string(&matchers).unwrap();
        assert_eq!(
            json,
            r#"[{"trace_id":"00000000000000000000000000000102"},{"attribute":{"key":"key","value":"v"}},{"name":"n"}]"#
        );
        let decoded: Vec<TraceMatcher> = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, matchers);
    }

    #[test]
    fn rejects_short_hex() {
        let result: Result<TraceMatcher, _> = serde_json::from_str(r#"{"trace_id":"0102"}"#);
        assert!(result.is_err());
    }
}
