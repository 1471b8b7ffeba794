use std::time::Duration;
use thiserror::Error;
use tiros::ActionError;

/// Errors of the Kubo RPC client.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum KuboError {
    /// The request could not be sent or its response not be read.
    #[error("kubo request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Kubo answered with an RPC error.
    #[error("kubo rpc error ({status}): {message}")]
    Rpc {
        /// HTTP status of the response.
        status: u16,
        /// Error message reported by Kubo.
        message: String,
        /// Numeric error code reported by Kubo.
        code: i64,
        /// Error type reported by Kubo.
        kind: String,
    },

    /// A response body did not have the expected shape.
    #[error("unexpected kubo response: {0}")]
    Decode(#[from] serde_json::Error),

    /// `add` returned no entry for the uploaded content.
    #[error("kubo add returned no content id")]
    EmptyAddResponse,

    /// Kubo did not answer within the wait timeout.
    #[error("kubo not available after {0:?}")]
    Unavailable(Duration),
}

impl From<KuboError> for ActionError {
    fn from(err: KuboError) -> Self {
        ActionError::Request(Box::new(err))
    }
}
