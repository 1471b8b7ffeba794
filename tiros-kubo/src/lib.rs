//! Performs tiros probe actions against a [Kubo](https://github.com/ipfs/kubo)
//! node through its RPC API.
//!
//! [`KuboClient`] implements [`tiros::ActionInvoker`]: uploads are `add`
//! calls that pin the content, downloads are streaming `cat` calls. Both carry
//! the probe's trace context, so the node's spans for the request end up in
//! the probe's trace. The client also exposes the node maintenance calls a
//! probe loop needs between iterations.
//!
//! ```no_run
//! # async fn run() -> Result<(), tiros_kubo::KuboError> {
//! use std::time::Duration;
//! use tiros_kubo::KuboClient;
//!
//! let kubo = KuboClient::new("http://127.0.0.1:5001")?;
//! let version = kubo.wait_available(Duration::from_secs(60)).await?;
//! println!("kubo {} is online", version.version);
//! kubo.reset().await?;
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

mod client;
mod error;
mod model;

pub use client::{KuboClient, Result};
pub use error::KuboError;
pub use model::{PeerInfo, VersionInfo};
