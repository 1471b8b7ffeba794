//! Exclusive access to the matcher registry and the match channel.
//!
//! Only one probe may be in flight at a time. A [`Session`] is that probe's
//! claim: it is the only way to register matchers and to read matches, and
//! dropping it clears the registry.
use crate::config::ReceiverConfig;
use crate::error::Result;
use crate::matcher::TraceMatcher;
use crate::receiver::{MatcherRegistry, TraceMatch, TraceReceiver};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tracing::debug;

/// Hands out [`Session`]s, one at a time.
#[derive(Debug)]
pub struct Correlator {
    registry: Arc<MatcherRegistry>,
    matches: Arc<Mutex<mpsc::Receiver<TraceMatch>>>,
    next_session_id: AtomicU64,
}

impl Correlator {
    /// Creates a correlator and the receiver feeding it.
    ///
    /// Must be called within a tokio runtime when a forward endpoint is
    /// configured.
    pub fn new(config: ReceiverConfig) -> Result<(Self, TraceReceiver)> {
        let registry = Arc::new(MatcherRegistry::default());
        let (tx, rx) = mpsc::channel(config.match_queue_size);
        let receiver = TraceReceiver::new(&config, Arc::clone(&registry), tx)?;
        let correlator = Correlator {
            registry,
            matches: Arc::new(Mutex::new(rx)),
            next_session_id: AtomicU64::new(1),
        };
        Ok((correlator, receiver))
    }

    /// Waits until no other session is active and starts a new one.
    pub async fn acquire(&self) -> Session {
        let matches = Arc::clone(&self.matches).lock_owned().await;
        self.start(matches)
    }

    /// Starts a new session if no other session is active.
    pub fn try_acquire(&self) -> Option<Session> {
        let matches = Arc::clone(&self.matches).try_lock_owned().ok()?;
        Some(self.start(matches))
    }

    fn start(&self, matches: OwnedMutexGuard<mpsc::Receiver<TraceMatch>>) -> Session {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        debug!(name: "Session.Started", session_id = id);
        Session {
            id,
            registry: Arc::clone(&self.registry),
            matches,
        }
    }
}

/// The active probe's claim on the registry and the match channel.
#[derive(Debug)]
pub struct Session {
    id: u64,
    registry: Arc<MatcherRegistry>,
    matches: OwnedMutexGuard<mpsc::Receiver<TraceMatch>>,
}

impl Session {
    /// The id matches of this session are tagged with.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Replaces the registered matchers. Call before starting the action
    /// whose telemetry they are meant to catch.
    pub fn register(&self, matchers: Vec<TraceMatcher>) {
        debug!(
            name: "Session.MatchersRegistered",
            session_id = self.id,
            count = matchers.len(),
        );
        self.registry.register(self.id, matchers);
    }

    /// Clears the registered matchers.
    pub fn reset(&self) {
        self.registry.reset();
    }

    /// Receives the next match of this session. Matches left over from
    /// earlier sessions are discarded. Returns `None` once the receiver is
    /// gone.
    pub async fn recv(&mut self) -> Option<TraceMatch> {
        loop {
            let trace_match = self.matches.recv().await?;
            if trace_match.session_id == self.id {
                return Some(trace_match);
            }
            debug!(
                name: "Session.StaleMatchDiscarded",
                session_id = self.id,
                match_session_id = trace_match.session_id,
            );
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.registry.reset();
        debug!(name: "Session.Ended", session_id = self.id);
    }
}
