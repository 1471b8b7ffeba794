use crate::error::Result;
use crate::span::TraceBatch;
use opentelemetry_proto::tonic::collector::trace::v1::trace_service_client::TraceServiceClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, warn};

/// Maximum number of batches being forwarded at the same time.
pub(crate) const FORWARD_MAX_IN_FLIGHT: usize = 64;

/// Relays received batches to a downstream OTLP/gRPC collector.
#[derive(Clone, Debug)]
pub(crate) struct Forwarder {
    client: TraceServiceClient<Channel>,
    timeout: Duration,
    in_flight: Arc<Semaphore>,
}

impl Forwarder {
    /// Connects lazily to `endpoint`. Every forward is bounded by `timeout`.
    /// Must be called within a tokio runtime.
    pub(crate) fn connect_lazy(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        Self::with_capacity(endpoint, timeout, FORWARD_MAX_IN_FLIGHT)
    }

    fn with_capacity(
        endpoint: impl Into<String>,
        timeout: Duration,
        max_in_flight: usize,
    ) -> Result<Self> {
        let channel = Endpoint::from_shared(endpoint.into())?
            .connect_timeout(timeout)
            .timeout(timeout)
            .connect_lazy();
        Ok(Forwarder {
            client: TraceServiceClient::new(channel),
            timeout,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
        })
    }

    /// Spawns the export of `batch` without waiting for it. Returns false if
    /// too many forwards are in flight and the batch was dropped.
    pub(crate) fn forward(&self, batch: Arc<TraceBatch>) -> bool {
        let Ok(permit) = Arc::clone(&self.in_flight).try_acquire_owned() else {
            warn!(
                name: "TraceReceiver.ForwardDropped",
                reason = "too many forwards in flight",
            );
            return false;
        };
        let mut client = self.client.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            let exported = tokio::time::timeout(timeout, client.export(TraceBatch::clone(&batch))).await;
            match exported {
                Ok(Ok(_)) => debug!(name: "TraceReceiver.BatchForwarded", "batch forwarded"),
                Ok(Err(status)) => warn!(
                    name: "TraceReceiver.ForwardFailed",
                    code = ?status.code(),
                    reason = status.message(),
                ),
                Err(_) => warn!(
                    name: "TraceReceiver.ForwardFailed",
                    reason = "timed out",
                    timeout = ?timeout,
                ),
            }
            drop(permit);
        });
        true
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.in_flight.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, SpanFixture};
    use opentelemetry::trace::TraceId;
    use tokio::net::TcpListener;

    /// Accepts connections and keeps them open without ever answering.
    async fn silent_collector() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut open = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                open.push(socket);
            }
        });
        format!("http://{addr}")
    }

    fn delivery() -> Arc<TraceBatch> {
        Arc::new(batch(vec![SpanFixture::new(
            TraceId::from(1u128),
            1,
            "corehttp.cmdsHandler",
            1,
            2,
        )
        .build()]))
    }

    #[tokio::test]
    async fn drops_forwards_beyond_capacity() {
        let endpoint = silent_collector().await;
        let forwarder = Forwarder::with_capacity(endpoint, Duration::from_secs(30), 2).unwrap();

        assert!(forwarder.forward(delivery()));
        assert!(forwarder.forward(delivery()));
        assert!(!forwarder.forward(delivery()));
        assert_eq!(forwarder.available(), 0);
    }

    #[tokio::test]
    async fn stalled_forward_releases_after_timeout() {
        let endpoint = silent_collector().await;
        let forwarder = Forwarder::with_capacity(endpoint, Duration::from_millis(100), 1).unwrap();

        assert!(forwarder.forward(delivery()));
        assert_eq!(forwarder.available(), 0);

        tokio::time::timeout(Duration::from_secs(5), async {
            while forwarder.available() == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(forwarder.forward(delivery()));
    }
}
