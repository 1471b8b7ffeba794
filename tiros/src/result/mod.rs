//! Stateful probe results fed by delivered trace batches.
//!
//! A result owns the spans of its probe and recomputes every derived field
//! from the complete span set after each batch, so repeated, overlapping or
//! reordered deliveries converge to the same values.
mod download;
mod upload;

pub use download::{DiscoveryMethod, DownloadResult};
pub use upload::{raw_content_id, UploadResult};

use crate::span::TraceBatch;
use crate::store::IngestStats;

/// Common surface of [`UploadResult`] and [`DownloadResult`].
pub trait Accumulator {
    /// Ingests every well-formed span of `batch` and recomputes derived fields.
    fn parse(&mut self, batch: &TraceBatch) -> IngestStats;

    /// Returns true once the result holds everything the probe waits for.
    fn is_complete(&self) -> bool;

    /// Drops pending spans. Later batches are ignored.
    fn freeze(&mut self);

    /// Returns true once the result has been frozen.
    fn is_frozen(&self) -> bool;
}
