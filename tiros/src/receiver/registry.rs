use crate::matcher::{first_match, TraceMatcher};
use crate::span::TraceBatch;
use std::sync::{PoisonError, RwLock};

/// Outcome of scanning one batch against the registry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    /// Nothing is registered, the batch was not looked at.
    Skipped,
    /// The batch was scanned without a hit.
    NoMatch,
    /// The matcher at `matcher_index` registered by `session_id` hit.
    Matched {
        matcher_index: usize,
        session_id: u64,
    },
}

#[derive(Debug, Default)]
struct Registered {
    session_id: u64,
    matchers: Vec<TraceMatcher>,
}

/// The matchers of the probe currently in flight.
///
/// Scans take the read lock and run in parallel, registration takes the
/// write lock. The lock is only held for the duration of a scan.
#[derive(Debug, Default)]
pub(crate) struct MatcherRegistry {
    inner: RwLock<Registered>,
}

impl MatcherRegistry {
    /// Replaces the active matchers.
    pub(crate) fn register(&self, session_id: u64, matchers: Vec<TraceMatcher>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.session_id = session_id;
        inner.matchers = matchers;
    }

    /// Clears the active matchers.
    pub(crate) fn reset(&self) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = Registered::default();
    }

    pub(crate) fn scan(&self, batch: &TraceBatch) -> Scan {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        if inner.matchers.is_empty() {
            return Scan::Skipped;
        }
        match first_match(&batch.resource_spans, &inner.matchers) {
            Some(matcher_index) => Scan::Matched {
                matcher_index,
                session_id: inner.session_id,
            },
            None => Scan::NoMatch,
        }
    }
}
