//! Errors surfaced by the correlation engine.
//!
//! Only conditions that stop a probe (or the whole process) are errors here.
//! Failures of the measured action itself are recorded on the result, see
//! [`ActionError`](crate::invoker::ActionError), and a drain that runs out of
//! time is a normal terminal state.
use thiserror::Error;

/// Result type used across this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the receiver, the session and the action drivers.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The match channel was closed while a probe was draining it. The
    /// receiver is gone, so no further telemetry can arrive.
    #[error("trace receiver closed the match channel")]
    ChannelClosed,

    /// The gRPC server could not be bound or stopped serving.
    #[error("trace receiver transport failed: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// Writing a trace dump or a record failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A record could not be encoded.
    #[error(transparent)]
    Encode(#[from] serde_json::Error),

    /// A configuration value is invalid.
    #[error("{name}: {reason}")]
    InvalidConfig {
        /// The configuration name.
        name: String,
        /// The reason the configuration is invalid.
        reason: String,
    },
}
