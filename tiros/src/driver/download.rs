use super::{ActionDriver, ProbeContext, PROBE_CANCELLED};
use crate::conventions::{DELEGATED_FIND_PROVIDERS, FIND_PROVIDERS};
use crate::error::{Error, Result};
use crate::invoker::{ActionError, ActionInvoker};
use crate::matcher::TraceMatcher;
use crate::result::{Accumulator, DownloadResult};
use futures_util::StreamExt;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{sleep, Instant, Sleep};
use tracing::{debug, info, warn};

/// What the payload transfer of a download observed.
#[derive(Debug)]
struct Transfer {
    time_to_first_byte: Option<Duration>,
    duration: Duration,
    size: u64,
    error: Option<ActionError>,
}

#[derive(Debug, Default)]
struct Progress {
    first_byte: Option<Duration>,
    size: u64,
}

impl<I: ActionInvoker + ?Sized> ActionDriver<I> {
    /// Retrieves `content_id` and waits until the node's telemetry shows the
    /// retrieval has finished.
    ///
    /// The payload is read up to the configured byte limit under the
    /// download action timeout. The drain deadline is pushed out to at
    /// least the tail wait when the transfer ends and when the first
    /// telemetry arrives.
    pub async fn download(&self, content_id: &str) -> Result<DownloadResult> {
        let mut session = self.correlator.acquire().await;
        let cx = ProbeContext::generate();
        session.register(vec![
            TraceMatcher::TraceId(cx.trace_id),
            TraceMatcher::name(FIND_PROVIDERS),
            TraceMatcher::name(DELEGATED_FIND_PROVIDERS),
        ]);

        let mut result = DownloadResult::new(content_id, cx.trace_id);
        info!(
            name: "ActionDriver.DownloadStarted",
            trace_id = %cx.trace_id,
            content_id = content_id,
        );

        let started = Instant::now();
        let transfer = transfer(
            &*self.invoker,
            started,
            &cx,
            content_id,
            self.config.download_action_timeout,
            self.config.download_max_bytes,
        );
        tokio::pin!(transfer);
        let mut transferring = true;

        let deadline = sleep(self.config.download_drain_timeout);
        tokio::pin!(deadline);
        let mut telemetry_seen = false;

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    result.record_error(PROBE_CANCELLED);
                    break;
                }
                transfer = &mut transfer, if transferring => {
                    transferring = false;
                    if let Some(err) = &transfer.error {
                        warn!(name: "ActionDriver.DownloadFailed", error = %err);
                        result.record_error(err.to_string());
                    }
                    debug!(
                        name: "ActionDriver.TransferEnded",
                        size = transfer.size,
                        time_to_first_byte = ?transfer.time_to_first_byte,
                    );
                    result.record_transfer(transfer.time_to_first_byte, transfer.duration, transfer.size);
                    extend_deadline(deadline.as_mut(), self.config.tail_wait);
                    if result.is_complete() {
                        break;
                    }
                }
                _ = &mut deadline => {
                    debug!(name: "ActionDriver.DrainTimeout", trace_id = %cx.trace_id);
                    break;
                }
                delivery = session.recv() => {
                    let Some(trace_match) = delivery else {
                        return Err(Error::ChannelClosed);
                    };
                    let stats = result.parse(&trace_match.batch);
                    debug!(
                        name: "ActionDriver.BatchParsed",
                        matcher_index = trace_match.matcher_index,
                        accepted = stats.accepted,
                        duplicates = stats.duplicates,
                        malformed = stats.malformed,
                    );
                    if !telemetry_seen {
                        telemetry_seen = true;
                        extend_deadline(deadline.as_mut(), self.config.tail_wait);
                    }
                    if result.is_complete() {
                        break;
                    }
                }
            }
        }

        result.freeze();
        session.reset();
        info!(
            name: "ActionDriver.DownloadFinished",
            trace_id = %cx.trace_id,
            done = result.is_done(),
            discovery_method = result.discovery_method().map(|m| m.as_str()).unwrap_or("unknown"),
            error = result.error().unwrap_or_default(),
        );
        Ok(result)
    }
}

/// Moves `deadline` to at least `now + tail_wait`. Never shortens it.
fn extend_deadline(deadline: Pin<&mut Sleep>, tail_wait: Duration) {
    let target = Instant::now() + tail_wait;
    if deadline.deadline() < target {
        deadline.reset(target);
    }
}

async fn transfer<I: ActionInvoker + ?Sized>(
    invoker: &I,
    started: Instant,
    cx: &ProbeContext,
    content_id: &str,
    timeout: Duration,
    max_bytes: u64,
) -> Transfer {
    let mut progress = Progress::default();
    let outcome = tokio::time::timeout(
        timeout,
        read_payload(invoker, started, cx, content_id, max_bytes, &mut progress),
    )
    .await;
    let error = match outcome {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(_) => Some(ActionError::Timeout(timeout)),
    };
    Transfer {
        time_to_first_byte: progress.first_byte,
        duration: started.elapsed(),
        size: progress.size,
        error,
    }
}

async fn read_payload<I: ActionInvoker + ?Sized>(
    invoker: &I,
    started: Instant,
    cx: &ProbeContext,
    content_id: &str,
    max_bytes: u64,
    progress: &mut Progress,
) -> std::result::Result<(), ActionError> {
    let mut payload = invoker.download(cx, content_id).await?;
    while let Some(chunk) = payload.next().await {
        let chunk = chunk?;
        if chunk.is_empty() {
            continue;
        }
        progress.first_byte.get_or_insert_with(|| started.elapsed());
        progress.size = progress.size.saturating_add(chunk.len() as u64).min(max_bytes);
        if progress.size >= max_bytes {
            debug!(name: "ActionDriver.ByteLimitReached", max_bytes);
            break;
        }
    }
    Ok(())
}
