//! Probe loop configuration, read from `TIROS_PROBE_*` environment variables.
//!
//! Receiver and driver settings are read by [`tiros::ReceiverConfig`] and
//! [`tiros::DriverConfig`] from their own `TIROS_*` variables.
use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Size of the uploaded file in MiB.
pub(crate) const TIROS_PROBE_UPLOAD_FILE_SIZE_MIB: &str = "TIROS_PROBE_UPLOAD_FILE_SIZE_MIB";
/// Time in milliseconds between the starts of two iterations.
pub(crate) const TIROS_PROBE_INTERVAL: &str = "TIROS_PROBE_INTERVAL";
/// Number of iterations after which the probe stops. 0 runs forever.
pub(crate) const TIROS_PROBE_MAX_ITERATIONS: &str = "TIROS_PROBE_MAX_ITERATIONS";
/// Host of the Kubo RPC API.
pub(crate) const TIROS_PROBE_KUBO_HOST: &str = "TIROS_PROBE_KUBO_HOST";
/// Port of the Kubo RPC API.
pub(crate) const TIROS_PROBE_KUBO_API_PORT: &str = "TIROS_PROBE_KUBO_API_PORT";
/// Address the trace receiver listens on.
pub(crate) const TIROS_PROBE_TRACE_RECEIVER_HOST: &str = "TIROS_PROBE_TRACE_RECEIVER_HOST";
/// Port the trace receiver listens on.
pub(crate) const TIROS_PROBE_TRACE_RECEIVER_PORT: &str = "TIROS_PROBE_TRACE_RECEIVER_PORT";
/// Directory to write newline delimited JSON records to.
pub(crate) const TIROS_PROBE_JSON_OUT: &str = "TIROS_PROBE_JSON_OUT";
/// Discard all records.
pub(crate) const TIROS_PROBE_DRY_RUN: &str = "TIROS_PROBE_DRY_RUN";
/// Only run upload probes.
pub(crate) const TIROS_PROBE_UPLOAD_ONLY: &str = "TIROS_PROBE_UPLOAD_ONLY";
/// Only run download probes.
pub(crate) const TIROS_PROBE_DOWNLOAD_ONLY: &str = "TIROS_PROBE_DOWNLOAD_ONLY";
/// Region recorded with every record.
pub(crate) const TIROS_PROBE_REGION: &str = "TIROS_PROBE_REGION";
/// Comma separated content ids to download.
pub(crate) const TIROS_PROBE_DOWNLOAD_CIDS: &str = "TIROS_PROBE_DOWNLOAD_CIDS";
/// Number of downloads per iteration.
pub(crate) const TIROS_PROBE_DOWNLOADS_PER_ITERATION: &str = "TIROS_PROBE_DOWNLOADS_PER_ITERATION";
/// Time in milliseconds to wait for Kubo to come online.
pub(crate) const TIROS_PROBE_KUBO_WAIT_TIMEOUT: &str = "TIROS_PROBE_KUBO_WAIT_TIMEOUT";

const MIB: u64 = 1024 * 1024;

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| T::from_str(value.trim()).ok())
}

fn env_non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn env_flag(name: &str) -> Option<bool> {
    let value = env_non_empty(name)?;
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Which probes an iteration runs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ProbeMode {
    Both,
    UploadOnly,
    DownloadOnly,
}

impl ProbeMode {
    pub(crate) fn uploads(self) -> bool {
        self != ProbeMode::DownloadOnly
    }

    pub(crate) fn downloads(self) -> bool {
        self != ProbeMode::UploadOnly
    }
}

/// Settings of the probe loop.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct ProbeConfig {
    pub(crate) file_size: u64,
    pub(crate) interval: Duration,
    pub(crate) max_iterations: u64,
    pub(crate) kubo_endpoint: String,
    pub(crate) kubo_wait_timeout: Duration,
    pub(crate) receiver_addr: SocketAddr,
    pub(crate) json_out: Option<PathBuf>,
    pub(crate) dry_run: bool,
    pub(crate) mode: ProbeMode,
    pub(crate) region: String,
    pub(crate) download_cids: Vec<String>,
    pub(crate) downloads_per_iteration: usize,
}

impl ProbeConfig {
    /// Defaults overridden by the `TIROS_PROBE_*` environment variables.
    pub(crate) fn from_env() -> anyhow::Result<Self> {
        let upload_only = env_flag(TIROS_PROBE_UPLOAD_ONLY).unwrap_or(false);
        let download_only = env_flag(TIROS_PROBE_DOWNLOAD_ONLY).unwrap_or(false);
        let mode = match (upload_only, download_only) {
            (false, false) => ProbeMode::Both,
            (true, false) => ProbeMode::UploadOnly,
            (false, true) => ProbeMode::DownloadOnly,
            (true, true) => anyhow::bail!(
                "{TIROS_PROBE_UPLOAD_ONLY} and {TIROS_PROBE_DOWNLOAD_ONLY} are mutually exclusive"
            ),
        };

        let kubo_host = env_non_empty(TIROS_PROBE_KUBO_HOST).unwrap_or_else(|| "127.0.0.1".into());
        let kubo_port: u16 = env_parse(TIROS_PROBE_KUBO_API_PORT).unwrap_or(5001);
        let receiver_host: IpAddr =
            env_parse(TIROS_PROBE_TRACE_RECEIVER_HOST).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let receiver_port: u16 = env_parse(TIROS_PROBE_TRACE_RECEIVER_PORT).unwrap_or(4317);

        let file_size_mib: u64 = env_parse(TIROS_PROBE_UPLOAD_FILE_SIZE_MIB).unwrap_or(100);
        let file_size = file_size_mib.checked_mul(MIB).ok_or_else(|| {
            anyhow::anyhow!("{TIROS_PROBE_UPLOAD_FILE_SIZE_MIB}: {file_size_mib} MiB is too large")
        })?;

        Ok(ProbeConfig {
            file_size,
            interval: Duration::from_millis(env_parse(TIROS_PROBE_INTERVAL).unwrap_or(10_000)),
            max_iterations: env_parse(TIROS_PROBE_MAX_ITERATIONS).unwrap_or(0),
            kubo_endpoint: format!("http://{kubo_host}:{kubo_port}"),
            kubo_wait_timeout: Duration::from_millis(
                env_parse(TIROS_PROBE_KUBO_WAIT_TIMEOUT).unwrap_or(60_000),
            ),
            receiver_addr: SocketAddr::new(receiver_host, receiver_port),
            json_out: env_non_empty(TIROS_PROBE_JSON_OUT).map(PathBuf::from),
            dry_run: env_flag(TIROS_PROBE_DRY_RUN).unwrap_or(false),
            mode,
            region: env_non_empty(TIROS_PROBE_REGION).unwrap_or_default(),
            download_cids: env_non_empty(TIROS_PROBE_DOWNLOAD_CIDS)
                .map(|cids| {
                    cids.split(',')
                        .map(str::trim)
                        .filter(|cid| !cid.is_empty())
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default(),
            downloads_per_iteration: env_parse(TIROS_PROBE_DOWNLOADS_PER_ITERATION).unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: &[&str] = &[
        TIROS_PROBE_UPLOAD_FILE_SIZE_MIB,
        TIROS_PROBE_INTERVAL,
        TIROS_PROBE_MAX_ITERATIONS,
        TIROS_PROBE_KUBO_HOST,
        TIROS_PROBE_KUBO_API_PORT,
        TIROS_PROBE_TRACE_RECEIVER_HOST,
        TIROS_PROBE_TRACE_RECEIVER_PORT,
        TIROS_PROBE_JSON_OUT,
        TIROS_PROBE_DRY_RUN,
        TIROS_PROBE_UPLOAD_ONLY,
        TIROS_PROBE_DOWNLOAD_ONLY,
        TIROS_PROBE_REGION,
        TIROS_PROBE_DOWNLOAD_CIDS,
        TIROS_PROBE_DOWNLOADS_PER_ITERATION,
        TIROS_PROBE_KUBO_WAIT_TIMEOUT,
    ];

    #[test]
    fn defaults() {
        temp_env::with_vars_unset(ALL, || {
            let config = ProbeConfig::from_env().unwrap();
            assert_eq!(config.file_size, 100 * MIB);
            assert_eq!(config.interval, Duration::from_secs(10));
            assert_eq!(config.max_iterations, 0);
            assert_eq!(config.kubo_endpoint, "http://127.0.0.1:5001");
            assert_eq!(config.receiver_addr, "127.0.0.1:4317".parse().unwrap());
            assert_eq!(config.json_out, None);
            assert!(!config.dry_run);
            assert_eq!(config.mode, ProbeMode::Both);
            assert!(config.download_cids.is_empty());
            assert_eq!(config.downloads_per_iteration, 1);
        });
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                (TIROS_PROBE_UPLOAD_FILE_SIZE_MIB, Some("2")),
                (TIROS_PROBE_INTERVAL, Some("500")),
                (TIROS_PROBE_MAX_ITERATIONS, Some("3")),
                (TIROS_PROBE_KUBO_HOST, Some("kubo")),
                (TIROS_PROBE_KUBO_API_PORT, Some("15001")),
                (TIROS_PROBE_TRACE_RECEIVER_HOST, Some("0.0.0.0")),
                (TIROS_PROBE_TRACE_RECEIVER_PORT, Some("14317")),
                (TIROS_PROBE_JSON_OUT, Some("/tmp/tiros")),
                (TIROS_PROBE_DRY_RUN, Some("true")),
                (TIROS_PROBE_UPLOAD_ONLY, Some("1")),
                (TIROS_PROBE_REGION, Some("eu-central-1")),
                (TIROS_PROBE_DOWNLOAD_CIDS, Some(" bafkreia, ,QmB ")),
            ],
            || {
                let config = ProbeConfig::from_env().unwrap();
                assert_eq!(config.file_size, 2 * MIB);
                assert_eq!(config.interval, Duration::from_millis(500));
                assert_eq!(config.max_iterations, 3);
                assert_eq!(config.kubo_endpoint, "http://kubo:15001");
                assert_eq!(config.receiver_addr, "0.0.0.0:14317".parse().unwrap());
                assert_eq!(config.json_out, Some(PathBuf::from("/tmp/tiros")));
                assert!(config.dry_run);
                assert_eq!(config.mode, ProbeMode::UploadOnly);
                assert_eq!(config.region, "eu-central-1");
                assert_eq!(config.download_cids, ["bafkreia", "QmB"]);
            },
        );
    }

    #[test]
    fn exclusive_modes_are_rejected() {
        temp_env::with_vars(
            [
                (TIROS_PROBE_UPLOAD_ONLY, Some("true")),
                (TIROS_PROBE_DOWNLOAD_ONLY, Some("true")),
            ],
            || assert!(ProbeConfig::from_env().is_err()),
        );
    }

    #[test]
    fn oversized_upload_is_rejected() {
        temp_env::with_vars(
            [(TIROS_PROBE_UPLOAD_FILE_SIZE_MIB, Some("18446744073709551615"))],
            || {
                let err = ProbeConfig::from_env().unwrap_err();
                assert!(err.to_string().contains(TIROS_PROBE_UPLOAD_FILE_SIZE_MIB));
            },
        );
    }

    #[test]
    fn unparsable_values_keep_defaults() {
        temp_env::with_vars(
            [
                (TIROS_PROBE_INTERVAL, Some("soon")),
                (TIROS_PROBE_DRY_RUN, Some("maybe")),
            ],
            || {
                let config = ProbeConfig::from_env().unwrap();
                assert_eq!(config.interval, Duration::from_secs(10));
                assert!(!config.dry_run);
            },
        );
    }
}
