//! # Tiros
//!
//! Measures upload and download performance of a content-addressed storage
//! node by correlating each action with the telemetry the node emits for it.
//!
//! The node exports its spans over OTLP/gRPC to a [`TraceReceiver`]. A probe
//! acquires a [`Session`] from the [`Correlator`], registers
//! [`TraceMatcher`]s describing the telemetry it is interested in, performs
//! the action through an [`ActionInvoker`] and feeds every matching batch
//! into an accumulator until the result is complete or the drain deadline
//! passes. [`ActionDriver`] runs this cycle for uploads and downloads.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use tiros::{ActionDriver, ActionInvoker, Correlator, DriverConfig, ReceiverConfig};
//! # use tokio_util::sync::CancellationToken;
//! # async fn run(invoker: Arc<dyn ActionInvoker>) -> tiros::Result<()> {
//! let shutdown = CancellationToken::new();
//! let (correlator, receiver) = Correlator::new(ReceiverConfig::default())?;
//! tokio::spawn(receiver.serve("0.0.0.0:4317".parse().unwrap(), shutdown.clone()));
//!
//! let driver = ActionDriver::new(correlator, invoker, DriverConfig::default(), shutdown);
//! let upload = driver.upload(bytes::Bytes::from_static(b"payload")).await?;
//! println!("provide took until {:?}", upload.provide_end());
//! # Ok(())
//! # }
//! ```
#![warn(
    future_incompatible,
    missing_debug_implementations,
    missing_docs,
    nonstandard_style,
    rust_2018_idioms,
    unused
)]
#![cfg_attr(docsrs, feature(doc_cfg), deny(rustdoc::broken_intra_doc_links))]

pub mod config;
pub mod conventions;
mod driver;
mod error;
mod invoker;
pub mod matcher;
mod receiver;
pub mod record;
pub mod result;
mod session;
pub mod span;
pub mod store;
#[cfg(any(test, feature = "testing"))]
#[doc(hidden)]
pub mod testing;

pub use config::{DriverConfig, DriverConfigBuilder, ReceiverConfig, ReceiverConfigBuilder};
pub use driver::{ActionDriver, ProbeContext};
pub use error::{Error, Result};
pub use invoker::{ActionError, ActionInvoker, ByteStream};
pub use matcher::TraceMatcher;
pub use receiver::{ReceiverStats, ReceiverStatsSnapshot, TraceMatch, TraceReceiver};
pub use result::{Accumulator, DiscoveryMethod, DownloadResult, UploadResult};
pub use session::{Correlator, Session};
