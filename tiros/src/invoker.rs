//! The seam between the drivers and the node under test.
use crate::driver::ProbeContext;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use std::time::Duration;
use thiserror::Error;

/// Payload of a download, yielded chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes, ActionError>>;

/// Failure of the measured action. Recorded on the result, never fatal.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ActionError {
    /// The action did not finish in time.
    #[error("action timed out after {0:?}")]
    Timeout(Duration),

    /// The node returned something that is not a content id.
    #[error("invalid content id {content_id:?}: {reason}")]
    InvalidContentId {
        /// What the node returned.
        content_id: String,
        /// Why it could not be parsed.
        reason: String,
    },

    /// The request to the node failed.
    #[error(transparent)]
    Request(#[from] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Other failures not covered by the variants above.
    #[error("{0}")]
    Other(String),
}

/// Performs upload and download actions against a node.
///
/// Implementations must propagate `cx` to the node (for HTTP, as a W3C
/// `traceparent` header) so that the node's telemetry of the action lands
/// in the probe's trace.
#[async_trait]
pub trait ActionInvoker: Send + Sync {
    /// Adds `content` to the node and returns its content id.
    async fn upload(&self, cx: &ProbeContext, content: Bytes) -> Result<String, ActionError>;

    /// Starts retrieving `content_id` and returns the payload stream.
    async fn download(&self, cx: &ProbeContext, content_id: &str) -> Result<ByteStream, ActionError>;
}
