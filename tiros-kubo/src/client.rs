use crate::error::KuboError;
use crate::model::{AddEntry, PeerInfo, PinList, RpcErrorBody, VersionInfo};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use opentelemetry::propagation::TextMapPropagator;
use opentelemetry::trace::TraceContextExt;
use opentelemetry_http::HeaderInjector;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use reqwest::header::HeaderMap;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use std::time::Duration;
use tiros::{ActionError, ActionInvoker, ByteStream, ProbeContext};
use tracing::{debug, info, warn};

const API_PREFIX: &str = "/api/v0/";
const WAIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const UPLOAD_FILE_NAME: &str = "tiros-probe";

/// Result of Kubo RPC calls.
pub type Result<T> = std::result::Result<T, KuboError>;

/// Client of the Kubo RPC API.
///
/// Requests made on behalf of a probe carry the probe's W3C `traceparent`,
/// so Kubo records its spans for the request under the probe's trace.
#[derive(Clone, Debug)]
pub struct KuboClient {
    http: Client,
    base_url: String,
    propagator: TraceContextPropagator,
}

impl KuboClient {
    /// Creates a client of the RPC API served at `endpoint`, e.g.
    /// `http://127.0.0.1:5001`.
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        Ok(Self::with_client(Client::builder().build()?, endpoint))
    }

    /// Creates a client sending requests with `http`.
    pub fn with_client(http: Client, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        KuboClient {
            http,
            base_url: format!("{}{API_PREFIX}", endpoint.trim_end_matches('/')),
            propagator: TraceContextPropagator::new(),
        }
    }

    /// Adds and pins `content`. Returns the root content id.
    pub async fn add(&self, cx: &ProbeContext, content: Bytes) -> Result<String> {
        let pin_name = uuid::Uuid::new_v4().to_string();
        let form = Form::new().part("file", Part::stream(content).file_name(UPLOAD_FILE_NAME));
        let response = self
            .call(
                "add",
                &[
                    ("pin", "true"),
                    ("pin-name", pin_name.as_str()),
                    ("fscache", "false"),
                    ("quieter", "true"),
                ],
                Some(cx),
                Some(form),
            )
            .await?;
        let body = response.text().await?;
        let root = body
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .ok_or(KuboError::EmptyAddResponse)?;
        let entry: AddEntry = serde_json::from_str(root)?;
        Ok(entry.hash)
    }

    /// Starts retrieving `content_id` and returns the payload as it arrives.
    pub async fn cat(
        &self,
        cx: &ProbeContext,
        content_id: &str,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let response = self
            .call("cat", &[("arg", content_id)], Some(cx), None)
            .await?;
        Ok(response.bytes_stream().map_err(KuboError::from).boxed())
    }

    /// Version information of the node.
    pub async fn version(&self) -> Result<VersionInfo> {
        Ok(self.call("version", &[], None, None).await?.json().await?)
    }

    /// Identity of the node.
    pub async fn id(&self) -> Result<PeerInfo> {
        Ok(self.call("id", &[], None, None).await?.json().await?)
    }

    /// Polls the node every second until it answers or `timeout` passes.
    pub async fn wait_available(&self, timeout: Duration) -> Result<VersionInfo> {
        let poll = async {
            loop {
                match self.version().await {
                    Ok(version) => return version,
                    Err(err) => debug!(
                        name: "KuboClient.NotAvailable",
                        endpoint = %self.base_url,
                        error = %err,
                    ),
                }
                tokio::time::sleep(WAIT_POLL_INTERVAL).await;
            }
        };
        let version = tokio::time::timeout(timeout, poll)
            .await
            .map_err(|_| KuboError::Unavailable(timeout))?;
        info!(name: "KuboClient.Available", version = %version.version);
        Ok(version)
    }

    /// Removes all recursive and direct pins, then collects garbage.
    /// Returns the number of removed pins. Pins that fail to be removed are
    /// logged and skipped.
    pub async fn reset(&self) -> Result<usize> {
        let pins: PinList = self
            .call("pin/ls", &[("type", "all")], None, None)
            .await?
            .json()
            .await?;

        let mut unpinned = 0;
        for (content_id, pin) in &pins.keys {
            let recursive = match pin.kind.as_str() {
                "recursive" => "true",
                "direct" => "false",
                _ => continue,
            };
            let removed = self
                .call(
                    "pin/rm",
                    &[("arg", content_id.as_str()), ("recursive", recursive)],
                    None,
                    None,
                )
                .await;
            match removed {
                Ok(_) => {
                    unpinned += 1;
                    debug!(name: "KuboClient.Unpinned", content_id = %content_id);
                }
                Err(err) => {
                    warn!(name: "KuboClient.UnpinFailed", content_id = %content_id, error = %err);
                }
            }
        }

        // Garbage collection streams the removed keys. Drain it to wait for completion.
        self.call("repo/gc", &[], None, None).await?.bytes().await?;
        info!(name: "KuboClient.Reset", unpinned);
        Ok(unpinned)
    }

    fn traceparent(&self, cx: &ProbeContext) -> HeaderMap {
        let otel_cx = opentelemetry::Context::new().with_remote_span_context(cx.span_context());
        let mut headers = HeaderMap::new();
        self.propagator
            .inject_context(&otel_cx, &mut HeaderInjector(&mut headers));
        headers
    }

    async fn call(
        &self,
        command: &str,
        query: &[(&str, &str)],
        cx: Option<&ProbeContext>,
        form: Option<Form>,
    ) -> Result<Response> {
        let mut request = self
            .http
            .post(format!("{}{command}", self.base_url))
            .query(query);
        if let Some(cx) = cx {
            request = request.headers(self.traceparent(cx));
        }
        if let Some(form) = form {
            request = request.multipart(form);
        }
        debug!(name: "KuboClient.Request", command);
        check_status(request.send().await?).await
    }
}

/// Turns non-success responses into [`KuboError::Rpc`].
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.bytes().await?;
    let rpc = serde_json::from_slice::<RpcErrorBody>(&body).unwrap_or_else(|_| RpcErrorBody {
        message: String::from_utf8_lossy(&body).trim().to_owned(),
        code: 0,
        kind: String::new(),
    });
    Err(KuboError::Rpc {
        status: status.as_u16(),
        message: rpc.message,
        code: rpc.code,
        kind: rpc.kind,
    })
}

#[async_trait]
impl ActionInvoker for KuboClient {
    async fn upload(
        &self,
        cx: &ProbeContext,
        content: Bytes,
    ) -> std::result::Result<String, ActionError> {
        Ok(self.add(cx, content).await?)
    }

    async fn download(
        &self,
        cx: &ProbeContext,
        content_id: &str,
    ) -> std::result::Result<ByteStream, ActionError> {
        let payload = self.cat(cx, content_id).await?;
        Ok(payload.map_err(ActionError::from).boxed())
    }
}
