//! Receiver and driver configuration.
//!
//! Both configurations start from defaults that are overridden by
//! environment variables, and can be adjusted further through their
//! builders.
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Capacity of the match channel between receiver and driver.
pub const TIROS_MATCH_QUEUE_SIZE: &str = "TIROS_MATCH_QUEUE_SIZE";
/// Default match channel capacity.
pub const TIROS_MATCH_QUEUE_SIZE_DEFAULT: usize = 32;
/// Upper bound in milliseconds for delivering a match to the driver.
pub const TIROS_MATCH_SEND_TIMEOUT: &str = "TIROS_MATCH_SEND_TIMEOUT";
/// Default match send timeout in milliseconds.
pub const TIROS_MATCH_SEND_TIMEOUT_DEFAULT: u64 = 10_000;
/// Directory to write every received batch to.
pub const TIROS_TRACES_OUT: &str = "TIROS_TRACES_OUT";
/// Downstream OTLP/gRPC endpoint every received batch is forwarded to.
pub const TIROS_TRACES_FORWARD_ENDPOINT: &str = "TIROS_TRACES_FORWARD_ENDPOINT";

/// Time in milliseconds to wait for upload telemetry.
pub const TIROS_UPLOAD_DRAIN_TIMEOUT: &str = "TIROS_UPLOAD_DRAIN_TIMEOUT";
/// Default upload drain timeout in milliseconds.
pub const TIROS_UPLOAD_DRAIN_TIMEOUT_DEFAULT: u64 = 60_000;
/// Time in milliseconds the upload action may take.
pub const TIROS_UPLOAD_ACTION_TIMEOUT: &str = "TIROS_UPLOAD_ACTION_TIMEOUT";
/// Default upload action timeout in milliseconds.
pub const TIROS_UPLOAD_ACTION_TIMEOUT_DEFAULT: u64 = 60_000;
/// Time in milliseconds to wait for download telemetry.
pub const TIROS_DOWNLOAD_DRAIN_TIMEOUT: &str = "TIROS_DOWNLOAD_DRAIN_TIMEOUT";
/// Default download drain timeout in milliseconds.
pub const TIROS_DOWNLOAD_DRAIN_TIMEOUT_DEFAULT: u64 = 30_000;
/// Time in milliseconds the download request and payload read may take.
pub const TIROS_DOWNLOAD_ACTION_TIMEOUT: &str = "TIROS_DOWNLOAD_ACTION_TIMEOUT";
/// Default download action timeout in milliseconds.
pub const TIROS_DOWNLOAD_ACTION_TIMEOUT_DEFAULT: u64 = 10_000;
/// Minimum time in milliseconds to keep draining after the transfer ended.
pub const TIROS_DOWNLOAD_TAIL_WAIT: &str = "TIROS_DOWNLOAD_TAIL_WAIT";
/// Default tail wait in milliseconds. The node exports every 10 seconds.
pub const TIROS_DOWNLOAD_TAIL_WAIT_DEFAULT: u64 = 12_000;
/// Maximum number of payload bytes read per download.
pub const TIROS_DOWNLOAD_MAX_BYTES: &str = "TIROS_DOWNLOAD_MAX_BYTES";
/// Default download byte limit.
pub const TIROS_DOWNLOAD_MAX_BYTES_DEFAULT: u64 = 100 * 1024 * 1024;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| T::from_str(value.trim()).ok())
}

fn env_millis(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_millis)
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Trace receiver configuration.
/// Use [`ReceiverConfigBuilder`] to configure your own instance.
#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Capacity of the match channel.
    pub(crate) match_queue_size: usize,

    /// Upper bound for delivering a match. The caller's own `grpc-timeout`
    /// shortens it further.
    pub(crate) send_timeout: Duration,

    /// Where to write received batches, if anywhere.
    pub(crate) trace_dump_dir: Option<PathBuf>,

    /// Downstream OTLP endpoint, if any.
    pub(crate) forward_endpoint: Option<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        ReceiverConfigBuilder::default().build()
    }
}

/// A builder for creating [`ReceiverConfig`] instances.
#[derive(Debug)]
pub struct ReceiverConfigBuilder {
    match_queue_size: usize,
    send_timeout: Duration,
    trace_dump_dir: Option<PathBuf>,
    forward_endpoint: Option<String>,
}

impl Default for ReceiverConfigBuilder {
    /// Create a new [`ReceiverConfigBuilder`] initialized with the default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `TIROS_MATCH_QUEUE_SIZE`
    /// * `TIROS_MATCH_SEND_TIMEOUT`
    /// * `TIROS_TRACES_OUT`
    /// * `TIROS_TRACES_FORWARD_ENDPOINT`
    fn default() -> Self {
        ReceiverConfigBuilder {
            match_queue_size: TIROS_MATCH_QUEUE_SIZE_DEFAULT,
            send_timeout: Duration::from_millis(TIROS_MATCH_SEND_TIMEOUT_DEFAULT),
            trace_dump_dir: None,
            forward_endpoint: None,
        }
        .init_from_env_vars()
    }
}

impl ReceiverConfigBuilder {
    /// Set the capacity of the match channel. The default value is 32.
    pub fn with_match_queue_size(mut self, match_queue_size: usize) -> Self {
        self.match_queue_size = match_queue_size;
        self
    }

    /// Set the upper bound for delivering a match to the driver.
    /// The default value is 10 seconds.
    pub fn with_send_timeout(mut self, send_timeout: Duration) -> Self {
        self.send_timeout = send_timeout;
        self
    }

    /// Write every received batch as OTLP JSON into `dir`.
    pub fn with_trace_dump_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dump_dir = Some(dir.into());
        self
    }

    /// Forward every received batch to the OTLP/gRPC `endpoint`.
    pub fn with_forward_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.forward_endpoint = Some(endpoint.into());
        self
    }

    /// Builds a `ReceiverConfig`. The match queue holds at least one entry.
    pub fn build(self) -> ReceiverConfig {
        ReceiverConfig {
            match_queue_size: self.match_queue_size.max(1),
            send_timeout: self.send_timeout,
            trace_dump_dir: self.trace_dump_dir,
            forward_endpoint: self.forward_endpoint,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(match_queue_size) = env_parse(TIROS_MATCH_QUEUE_SIZE) {
            self.match_queue_size = match_queue_size;
        }

        if let Some(send_timeout) = env_millis(TIROS_MATCH_SEND_TIMEOUT) {
            self.send_timeout = send_timeout;
        }

        if let Some(dir) = env_non_empty(TIROS_TRACES_OUT) {
            self.trace_dump_dir = Some(PathBuf::from(dir));
        }

        if let Some(endpoint) = env_non_empty(TIROS_TRACES_FORWARD_ENDPOINT) {
            self.forward_endpoint = Some(endpoint);
        }

        self
    }
}

/// Timeouts and limits of the action drivers.
/// Use [`DriverConfigBuilder`] to configure your own instance.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub(crate) upload_drain_timeout: Duration,
    pub(crate) upload_action_timeout: Duration,
    pub(crate) download_drain_timeout: Duration,
    pub(crate) download_action_timeout: Duration,
    pub(crate) tail_wait: Duration,
    pub(crate) download_max_bytes: u64,
}

impl Default for DriverConfig {
    fn default() -> Self {
        DriverConfigBuilder::default().build()
    }
}

/// A builder for creating [`DriverConfig`] instances.
#[derive(Debug)]
pub struct DriverConfigBuilder {
    upload_drain_timeout: Duration,
    upload_action_timeout: Duration,
    download_drain_timeout: Duration,
    download_action_timeout: Duration,
    tail_wait: Duration,
    download_max_bytes: u64,
}

impl Default for DriverConfigBuilder {
    /// Create a new [`DriverConfigBuilder`] initialized with the default values.
    /// The values are overridden by environment variables if set.
    /// The supported environment variables are:
    /// * `TIROS_UPLOAD_DRAIN_TIMEOUT`
    /// * `TIROS_UPLOAD_ACTION_TIMEOUT`
    /// * `TIROS_DOWNLOAD_DRAIN_TIMEOUT`
    /// * `TIROS_DOWNLOAD_ACTION_TIMEOUT`
    /// * `TIROS_DOWNLOAD_TAIL_WAIT`
    /// * `TIROS_DOWNLOAD_MAX_BYTES`
    fn default() -> Self {
        DriverConfigBuilder {
            upload_drain_timeout: Duration::from_millis(TIROS_UPLOAD_DRAIN_TIMEOUT_DEFAULT),
            upload_action_timeout: Duration::from_millis(TIROS_UPLOAD_ACTION_TIMEOUT_DEFAULT),
            download_drain_timeout: Duration::from_millis(TIROS_DOWNLOAD_DRAIN_TIMEOUT_DEFAULT),
            download_action_timeout: Duration::from_millis(TIROS_DOWNLOAD_ACTION_TIMEOUT_DEFAULT),
            tail_wait: Duration::from_millis(TIROS_DOWNLOAD_TAIL_WAIT_DEFAULT),
            download_max_bytes: TIROS_DOWNLOAD_MAX_BYTES_DEFAULT,
        }
        .init_from_env_vars()
    }
}

impl DriverConfigBuilder {
    /// Set how long to wait for upload telemetry. The default value is 60 seconds.
    pub fn with_upload_drain_timeout(mut self, timeout: Duration) -> Self {
        self.upload_drain_timeout = timeout;
        self
    }

    /// Set how long the upload action may take. The default value is 60 seconds.
    pub fn with_upload_action_timeout(mut self, timeout: Duration) -> Self {
        self.upload_action_timeout = timeout;
        self
    }

    /// Set how long to wait for download telemetry. The default value is 30 seconds.
    pub fn with_download_drain_timeout(mut self, timeout: Duration) -> Self {
        self.download_drain_timeout = timeout;
        self
    }

    /// Set how long the download request and payload read may take.
    /// The default value is 10 seconds.
    pub fn with_download_action_timeout(mut self, timeout: Duration) -> Self {
        self.download_action_timeout = timeout;
        self
    }

    /// Set the minimum time to keep draining once the transfer ended or the
    /// first telemetry arrived. The default value is 12 seconds.
    pub fn with_tail_wait(mut self, tail_wait: Duration) -> Self {
        self.tail_wait = tail_wait;
        self
    }

    /// Set the maximum number of payload bytes read per download.
    /// The default value is 100 MiB.
    pub fn with_download_max_bytes(mut self, max_bytes: u64) -> Self {
        self.download_max_bytes = max_bytes;
        self
    }

    /// Builds a `DriverConfig`.
    pub fn build(self) -> DriverConfig {
        DriverConfig {
            upload_drain_timeout: self.upload_drain_timeout,
            upload_action_timeout: self.upload_action_timeout,
            download_drain_timeout: self.download_drain_timeout,
            download_action_timeout: self.download_action_timeout,
            tail_wait: self.tail_wait,
            download_max_bytes: self.download_max_bytes,
        }
    }

    fn init_from_env_vars(mut self) -> Self {
        if let Some(timeout) = env_millis(TIROS_UPLOAD_DRAIN_TIMEOUT) {
            self.upload_drain_timeout = timeout;
        }

        if let Some(timeout) = env_millis(TIROS_UPLOAD_ACTION_TIMEOUT) {
            self.upload_action_timeout = timeout;
        }

        if let Some(timeout) = env_millis(TIROS_DOWNLOAD_DRAIN_TIMEOUT) {
            self.download_drain_timeout = timeout;
        }

        if let Some(timeout) = env_millis(TIROS_DOWNLOAD_ACTION_TIMEOUT) {
            self.download_action_timeout = timeout;
        }

        if let Some(tail_wait) = env_millis(TIROS_DOWNLOAD_TAIL_WAIT) {
            self.tail_wait = tail_wait;
        }

        if let Some(max_bytes) = env_parse(TIROS_DOWNLOAD_MAX_BYTES) {
            self.download_max_bytes = max_bytes;
        }

        self
    }
}
