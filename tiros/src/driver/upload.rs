use super::{ActionDriver, ProbeContext, PROBE_CANCELLED};
use crate::conventions::{DHT_PROVIDE, PROVIDE_KEY};
use crate::error::{Error, Result};
use crate::invoker::{ActionError, ActionInvoker};
use crate::matcher::TraceMatcher;
use crate::result::{raw_content_id, Accumulator, UploadResult};
use bytes::Bytes;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

impl<I: ActionInvoker + ?Sized> ActionDriver<I> {
    /// Uploads `content` and waits until the add and the provide of the
    /// content are both visible in the node's telemetry.
    ///
    /// The drain timer starts once the upload action returned. Failures of
    /// the action are recorded on the returned result.
    pub async fn upload(&self, content: Bytes) -> Result<UploadResult> {
        let mut session = self.correlator.acquire().await;
        let cx = ProbeContext::generate();
        session.register(vec![
            TraceMatcher::TraceId(cx.trace_id),
            TraceMatcher::name(DHT_PROVIDE),
        ]);

        let mut result = UploadResult::new(cx.trace_id, content.len() as u64);
        info!(
            name: "ActionDriver.UploadStarted",
            trace_id = %cx.trace_id,
            size = content.len(),
        );

        let action_timeout = self.config.upload_action_timeout;
        let action = tokio::time::timeout(action_timeout, self.invoker.upload(&cx, content));
        tokio::pin!(action);
        let mut acting = true;

        let drain_timeout = self.config.upload_drain_timeout;
        let deadline = sleep(drain_timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    result.record_error(PROBE_CANCELLED);
                    break;
                }
                outcome = &mut action, if acting => {
                    acting = false;
                    deadline.as_mut().reset(Instant::now() + drain_timeout);
                    let added = outcome.unwrap_or_else(|_| Err(ActionError::Timeout(action_timeout)));
                    match added.and_then(|content_id| {
                        let raw = raw_content_id(&content_id).map_err(|err| {
                            ActionError::InvalidContentId {
                                content_id: content_id.clone(),
                                reason: err.to_string(),
                            }
                        })?;
                        Ok((content_id, raw))
                    }) {
                        Ok((content_id, raw)) => {
                            info!(
                                name: "ActionDriver.ContentAdded",
                                content_id = %content_id,
                                raw_content_id = %raw,
                            );
                            session.register(vec![
                                TraceMatcher::TraceId(cx.trace_id),
                                TraceMatcher::attribute(PROVIDE_KEY, raw.clone()),
                            ]);
                            result.set_content_id(content_id, raw);
                        }
                        Err(err) => {
                            warn!(name: "ActionDriver.UploadFailed", error = %err);
                            result.record_error(err.to_string());
                        }
                    }
                    if result.is_complete() {
                        break;
                    }
                }
                _ = &mut deadline, if !acting => {
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
                    if result.is_complete() {
                        break;
                    }
                }
            }
        }

        result.freeze();
        session.reset();
        info!(
            name: "ActionDriver.UploadFinished",
            trace_id = %cx.trace_id,
            populated = result.is_populated(),
            error = result.error().unwrap_or_default(),
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::{DriverConfigBuilder, ReceiverConfigBuilder};
    use crate::conventions::{DHT_PROVIDE, PROVIDE_KEY};
    use crate::driver::ActionDriver;
    use crate::error::Error;
    use crate::result::Accumulator;
    use crate::session::Correlator;
    use crate::span::to_unix_nanos;
    use crate::testing::{batch, str_attr, MockInvoker, SpanFixture};
    use crate::TraceReceiver;
    use bytes::Bytes;
    use opentelemetry::trace::TraceId;
    use opentelemetry_proto::tonic::collector::trace::v1::trace_service_server::TraceService;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const CONTENT_ID: &str = "QmPrRV2DJHJCneS6Xyjg4y1FkoGidzAbSQxkwjcXi5rpiu";
    const RAW_CONTENT_ID: &str = "bafkreiawpquc5mteo7z4hpzwlgy6ryckjbqr54r3nzmd6s2xvptsjb6eui";

    fn correlator() -> (Correlator, TraceReceiver) {
        Correlator::new(
            ReceiverConfigBuilder::default()
                .with_match_queue_size(8)
                .with_send_timeout(Duration::from_secs(1))
                .build(),
        )
        .unwrap()
    }

    fn driver(
        correlator: Correlator,
        invoker: MockInvoker,
    ) -> (ActionDriver<MockInvoker>, CancellationToken) {
        let config = DriverConfigBuilder::default()
            .with_upload_action_timeout(Duration::from_secs(1))
            .with_upload_drain_timeout(Duration::from_millis(300))
            .build();
        let shutdown = CancellationToken::new();
        (
            ActionDriver::new(correlator, Arc::new(invoker), config, shutdown.clone()),
            shutdown,
        )
    }

    /// Exports add and provide telemetry shortly after the upload is invoked.
    fn exporting(receiver: &TraceReceiver) -> MockInvoker {
        let receiver = receiver.clone();
        MockInvoker::new()
            .with_content_id(CONTENT_ID)
            .on_invoke(move |cx| {
                let receiver = receiver.clone();
                let add = batch(vec![SpanFixture::new(
                    cx.trace_id,
                    1,
                    "corehttp.cmdsHandler",
                    1760467560212211000,
                    1760467560383873125,
                )
                .build()]);
                let provide = batch(vec![SpanFixture::new(
                    TraceId::from(0xbu128),
                    1,
                    DHT_PROVIDE,
                    1760467560383876000,
                    1760467571513163084,
                )
                .attr(str_attr(PROVIDE_KEY, RAW_CONTENT_ID))
                .build()]);
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    for delivery in [add, provide] {
                        receiver
                            .export(tonic::Request::new(delivery))
                            .await
                            .unwrap();
                    }
                });
            })
    }

    #[tokio::test]
    async fn upload_completes_from_telemetry() {
        let (correlator, receiver) = correlator();
        let (driver, _shutdown) = driver(correlator, exporting(&receiver));

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert!(result.is_populated());
        assert!(result.error().is_none());
        assert_eq!(result.content_id(), Some(CONTENT_ID));
        assert_eq!(result.raw_content_id(), Some(RAW_CONTENT_ID));
        assert_eq!(result.file_size(), 5);
        assert_eq!(to_unix_nanos(result.add_start().unwrap()), 1760467560212211000);
        assert_eq!(to_unix_nanos(result.provide_end().unwrap()), 1760467571513163084);
        assert_eq!(result.provide_trace_id(), Some(TraceId::from(0xbu128)));
        assert_eq!(driver.invoker().calls().len(), 1);
        assert_eq!(driver.invoker().calls()[0].trace_id, result.add_trace_id());
    }

    #[tokio::test(start_paused = true)]
    async fn upload_without_telemetry_times_out() {
        let (correlator, _receiver) = correlator();
        let (driver, _shutdown) = driver(correlator, MockInvoker::new().with_content_id(CONTENT_ID));

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert!(!result.is_populated());
        assert!(result.add_start().is_none());
        assert_eq!(result.content_id(), Some(CONTENT_ID));
        assert!(result.is_frozen());
    }

    #[tokio::test(start_paused = true)]
    async fn action_error_is_recorded() {
        let (correlator, _receiver) = correlator();
        let (driver, _shutdown) = driver(correlator, MockInvoker::new().failing("connection refused"));

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(result.error(), Some("connection refused"));
        assert!(result.content_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_content_id_is_recorded() {
        let (correlator, _receiver) = correlator();
        let (driver, _shutdown) = driver(correlator, MockInvoker::new().with_content_id("nope"));

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert!(result
            .error()
            .unwrap()
            .starts_with("invalid content id \"nope\""));
    }

    #[tokio::test(start_paused = true)]
    async fn action_timeout_is_recorded() {
        let (correlator, _receiver) = correlator();
        let (driver, _shutdown) = driver(
            correlator,
            MockInvoker::new()
                .with_content_id(CONTENT_ID)
                .with_delay(Duration::from_secs(5)),
        );

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(result.error(), Some("action timed out after 1s"));
    }

    #[tokio::test]
    async fn cancellation_returns_partial_result() {
        let (correlator, _receiver) = correlator();
        let (driver, shutdown) = driver(
            correlator,
            MockInvoker::new()
                .with_content_id(CONTENT_ID)
                .with_delay(Duration::from_secs(5)),
        );
        shutdown.cancel();

        let result = driver.upload(Bytes::from_static(b"hello")).await.unwrap();

        assert_eq!(result.error(), Some("probe cancelled"));
        assert!(result.is_frozen());
    }

    #[tokio::test]
    async fn closed_channel_is_fatal() {
        let (correlator, receiver) = correlator();
        let (driver, _shutdown) = driver(correlator, MockInvoker::new().with_content_id(CONTENT_ID));
        drop(receiver);

        let outcome = driver.upload(Bytes::from_static(b"hello")).await;

        assert!(matches!(outcome, Err(Error::ChannelClosed)));
    }
}
