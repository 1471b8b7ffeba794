//! Flat records of finished probes and where they are written to.
//!
//! Records carry wall-clock timestamps and durations in seconds. Fields the
//! probe could not observe are `None`.
use crate::error::Result;
use crate::result::{DiscoveryMethod, DownloadResult, UploadResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Describes the probe run and the node every record of it belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunInfo {
    /// Unique id of the run.
    pub run_id: String,
    /// Where the probe runs.
    pub region: String,
    /// Version of the probe.
    pub tiros_version: String,
    /// Version reported by the node.
    pub node_version: String,
    /// Peer id of the node.
    pub node_peer_id: String,
}

/// One upload probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UploadRecord {
    /// Run the probe belongs to.
    #[serde(flatten)]
    pub run: RunInfo,
    /// Size of the uploaded content in bytes.
    pub file_size_b: u64,
    /// Content id returned by the node.
    pub cid: Option<String>,
    /// Raw-codec content id the node provides.
    pub raw_cid: Option<String>,
    /// Trace of the add request.
    pub add_trace_id: String,
    /// Start of the add.
    pub add_start: Option<DateTime<Utc>>,
    /// Duration of the add.
    pub add_duration_s: Option<f64>,
    /// Earliest trace providing the content.
    pub provide_trace_id: Option<String>,
    /// Start of providing.
    pub provide_start: Option<DateTime<Utc>>,
    /// Duration of providing.
    pub provide_duration_s: Option<f64>,
    /// Time between the end of the add and the start of providing.
    pub provide_delay_s: Option<f64>,
    /// Time from the start of the add to the end of providing.
    pub upload_duration_s: Option<f64>,
    /// Failures of the probe.
    pub error: Option<String>,
}

impl UploadRecord {
    /// Flattens `result`.
    pub fn from_result(run: &RunInfo, result: &UploadResult) -> Self {
        UploadRecord {
            run: run.clone(),
            file_size_b: result.file_size(),
            cid: result.content_id().map(str::to_owned),
            raw_cid: result.raw_content_id().map(str::to_owned),
            add_trace_id: result.add_trace_id().to_string(),
            add_start: result.add_start().map(DateTime::from),
            add_duration_s: seconds_between(result.add_start(), result.add_end()),
            provide_trace_id: result.provide_trace_id().map(|id| id.to_string()),
            provide_start: result.provide_start().map(DateTime::from),
            provide_duration_s: seconds_between(result.provide_start(), result.provide_end()),
            provide_delay_s: seconds_between(result.add_end(), result.provide_start()),
            upload_duration_s: seconds_between(result.add_start(), result.provide_end()),
            error: result.error().map(str::to_owned),
        }
    }
}

/// One download probe.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DownloadRecord {
    /// Run the probe belongs to.
    #[serde(flatten)]
    pub run: RunInfo,
    /// Retrieved content id.
    pub cid: String,
    /// Where the content id was picked from.
    pub cid_source: String,
    /// Trace of the cat request.
    pub cat_trace_id: String,
    /// Bytes read from the payload.
    pub file_size_b: Option<u64>,
    /// Start of the cat request.
    pub cat_start: DateTime<Utc>,
    /// Time to the first payload byte.
    pub cat_ttfb_s: Option<f64>,
    /// Time until the payload transfer ended.
    pub cat_duration_s: Option<f64>,
    /// Start of the first bitswap broadcast to connected peers.
    pub idle_broadcast_start: Option<DateTime<Utc>>,
    /// Distinct providers found.
    pub found_prov_count: usize,
    /// Distinct found providers the node connected to.
    pub conn_prov_count: usize,
    /// When the first connected provider was found.
    pub first_conn_prov_found_at: Option<DateTime<Utc>>,
    /// When the node first connected to a provider.
    pub first_prov_conn_at: Option<DateTime<Utc>>,
    /// Peer id of the first connected provider.
    pub first_prov_peer_id: Option<String>,
    /// Start of the index query.
    pub ipni_start: Option<DateTime<Utc>>,
    /// Duration of the index query.
    pub ipni_duration_s: Option<f64>,
    /// HTTP status of the index query.
    pub ipni_status: Option<i64>,
    /// When the first block arrived.
    pub first_block_rec_at: Option<DateTime<Utc>>,
    /// How the content was located.
    pub discovery_method: Option<DiscoveryMethod>,
    /// Whether the node finished handling the request.
    pub done: bool,
    /// Failures of the probe.
    pub error: Option<String>,
}

impl DownloadRecord {
    /// Flattens `result`. `cid_source` names where the content id came from.
    pub fn from_result(run: &RunInfo, cid_source: &str, result: &DownloadResult) -> Self {
        let cat_start = result.cat_start();
        DownloadRecord {
            run: run.clone(),
            cid: result.content_id().to_owned(),
            cid_source: cid_source.to_owned(),
            cat_trace_id: result.cat_trace_id().to_string(),
            file_size_b: result.file_size(),
            cat_start: DateTime::from(cat_start),
            cat_ttfb_s: result.time_to_first_byte().map(|ttfb| ttfb.as_secs_f64()),
            cat_duration_s: seconds_between(Some(cat_start), result.cat_end()),
            idle_broadcast_start: result.idle_broadcast_started_at().map(DateTime::from),
            found_prov_count: result.found_providers_count(),
            conn_prov_count: result.connected_providers_count(),
            first_conn_prov_found_at: result.first_connected_provider_found_at().map(DateTime::from),
            first_prov_conn_at: result.first_provider_connected_at().map(DateTime::from),
            first_prov_peer_id: result.first_connected_provider_peer_id().map(str::to_owned),
            ipni_start: result.index_query_start().map(DateTime::from),
            ipni_duration_s: seconds_between(result.index_query_start(), result.index_query_end()),
            ipni_status: result.index_query_status(),
            first_block_rec_at: result.first_block_received_at().map(DateTime::from),
            discovery_method: result.discovery_method(),
            done: result.is_done(),
            error: result.error().map(str::to_owned),
        }
    }
}

/// Signed seconds from `start` to `end`.
fn seconds_between(start: Option<SystemTime>, end: Option<SystemTime>) -> Option<f64> {
    let (start, end) = (start?, end?);
    Some(match end.duration_since(start) {
        Ok(elapsed) => elapsed.as_secs_f64(),
        Err(err) => -err.duration().as_secs_f64(),
    })
}

/// Destination of probe records.
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Writes an upload record.
    async fn write_upload(&self, record: &UploadRecord) -> Result<()>;

    /// Writes a download record.
    async fn write_download(&self, record: &DownloadRecord) -> Result<()>;
}

/// Discards all records.
#[derive(Debug, Default)]
pub struct NoopSink;

#[async_trait]
impl RecordSink for NoopSink {
    async fn write_upload(&self, _record: &UploadRecord) -> Result<()> {
        Ok(())
    }

    async fn write_download(&self, _record: &DownloadRecord) -> Result<()> {
        Ok(())
    }
}

/// Logs every record as a JSON document.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl RecordSink for LogSink {
    async fn write_upload(&self, record: &UploadRecord) -> Result<()> {
        info!(name: "LogSink.Upload", record = %serde_json::to_string(record)?);
        Ok(())
    }

    async fn write_download(&self, record: &DownloadRecord) -> Result<()> {
        info!(name: "LogSink.Download", record = %serde_json::to_string(record)?);
        Ok(())
    }
}

/// Appends records as newline delimited JSON to one file per record kind.
#[derive(Debug)]
pub struct JsonLinesSink {
    uploads_path: PathBuf,
    downloads_path: PathBuf,
    uploads: Mutex<File>,
    downloads: Mutex<File>,
}

impl JsonLinesSink {
    /// Creates `<dir>/<prefix>_uploads.ndjson` and
    /// `<dir>/<prefix>_downloads.ndjson`, where the prefix is the current
    /// UTC minute.
    pub async fn create(dir: impl AsRef<Path>) -> Result<Self> {
        let prefix = Utc::now().format("%Y-%m-%dT%H%M").to_string();
        Self::with_prefix(dir, &prefix).await
    }

    /// Creates the sink files with the given `prefix`. Existing files are
    /// truncated.
    pub async fn with_prefix(dir: impl AsRef<Path>, prefix: &str) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;
        let uploads_path = dir.join(format!("{prefix}_uploads.ndjson"));
        let downloads_path = dir.join(format!("{prefix}_downloads.ndjson"));
        let uploads = open_append(&uploads_path).await?;
        let downloads = open_append(&downloads_path).await?;
        info!(
            name: "JsonLinesSink.Created",
            uploads = %uploads_path.display(),
            downloads = %downloads_path.display(),
        );
        Ok(JsonLinesSink {
            uploads_path,
            downloads_path,
            uploads: Mutex::new(uploads),
            downloads: Mutex::new(downloads),
        })
    }

    /// File upload records are appended to.
    pub fn uploads_path(&self) -> &Path {
        &self.uploads_path
    }

    /// File download records are appended to.
    pub fn downloads_path(&self) -> &Path {
        &self.downloads_path
    }
}

async fn append_line<T: Serialize>(file: &Mutex<File>, record: &T) -> Result<()> {
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    let mut file = file.lock().await;
    file.write_all(&line).await?;
    file.flush().await?;
    debug!(name: "JsonLinesSink.RecordWritten", bytes = line.len());
    Ok(())
}

#[async_trait]
impl RecordSink for JsonLinesSink {
    async fn write_upload(&self, record: &UploadRecord) -> Result<()> {
        append_line(&self.uploads, record).await
    }

    async fn write_download(&self, record: &DownloadRecord) -> Result<()> {
        append_line(&self.downloads, record).await
    }
}

async fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conventions::{
        BITSWAP_HANDLE_INCOMING, CMDS_HANDLER, DHT_PROVIDE, PROVIDE_KEY, RECEIVED_BLOCK,
    };
    use crate::result::Accumulator;
    use crate::span::from_unix_nanos;
    use crate::testing::{batch, event, str_attr, SpanFixture};
    use opentelemetry::trace::TraceId;
    use std::time::Duration;

    const CONTENT_ID: &str = "QmPrRV2DJHJCneS6Xyjg4y1FkoGidzAbSQxkwjcXi5rpiu";
    const RAW_CONTENT_ID: &str = "bafkreiawpquc5mteo7z4hpzwlgy6ryckjbqr54r3nzmd6s2xvptsjb6eui";
    const T0: u64 = 1_760_467_560_000_000_000;
    const SEC: u64 = 1_000_000_000;

    fn run() -> RunInfo {
        RunInfo {
            run_id: "run-1".into(),
            region: "eu-central-1".into(),
            tiros_version: "0.1.0".into(),
            node_version: "0.38.1".into(),
            node_peer_id: "12D3KooWNode".into(),
        }
    }

    fn upload_result() -> UploadResult {
        let mut result = UploadResult::new(TraceId::from(0x0au128), 1024);
        result.set_content_id(CONTENT_ID, RAW_CONTENT_ID);
        result.parse(&batch(vec![
            SpanFixture::new(TraceId::from(0x0au128), 1, CMDS_HANDLER, T0, T0 + 2 * SEC).build(),
            SpanFixture::new(TraceId::from(0x0bu128), 1, DHT_PROVIDE, T0 + 3 * SEC, T0 + 10 * SEC)
                .attr(str_attr(PROVIDE_KEY, RAW_CONTENT_ID))
                .build(),
        ]));
        result
    }

    #[test]
    fn upload_record_flattens_durations() {
        let record = UploadRecord::from_result(&run(), &upload_result());

        assert_eq!(record.file_size_b, 1024);
        assert_eq!(record.cid.as_deref(), Some(CONTENT_ID));
        assert_eq!(record.raw_cid.as_deref(), Some(RAW_CONTENT_ID));
        assert_eq!(record.add_trace_id, "0000000000000000000000000000000a");
        assert_eq!(
            record.provide_trace_id.as_deref(),
            Some("0000000000000000000000000000000b")
        );
        assert_eq!(record.add_start, Some(DateTime::from(from_unix_nanos(T0))));
        assert_eq!(record.add_duration_s, Some(2.0));
        assert_eq!(record.provide_duration_s, Some(7.0));
        assert_eq!(record.provide_delay_s, Some(1.0));
        assert_eq!(record.upload_duration_s, Some(10.0));
        assert_eq!(record.error, None);
    }

    #[test]
    fn unobserved_upload_fields_are_none() {
        let mut result = UploadResult::new(TraceId::from(0x0au128), 1024);
        result.record_error("connection refused");

        let record = UploadRecord::from_result(&run(), &result);

        assert_eq!(record.cid, None);
        assert_eq!(record.add_duration_s, None);
        assert_eq!(record.provide_delay_s, None);
        assert_eq!(record.upload_duration_s, None);
        assert_eq!(record.error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn provide_before_add_end_has_negative_delay() {
        assert_eq!(
            seconds_between(Some(from_unix_nanos(T0 + 2 * SEC)), Some(from_unix_nanos(T0 + SEC))),
            Some(-1.0)
        );
    }

    #[test]
    fn download_record_flattens_result() {
        let cat_trace = TraceId::from(0x100u128);
        let mut result = DownloadResult::new("bafkreigmes4fo2xnpixfk4syb5m27iok7rusrh6yziod4y5kunfhb6mf5e", cat_trace);
        result.parse(&batch(vec![
            SpanFixture::new(cat_trace, 1, CMDS_HANDLER, T0, T0 + SEC).build(),
            SpanFixture::new(cat_trace, 2, BITSWAP_HANDLE_INCOMING, T0, T0 + SEC)
                .event(event(RECEIVED_BLOCK, T0 + SEC / 2, vec![]))
                .build(),
        ]));
        result.record_transfer(Some(Duration::from_millis(250)), Duration::from_millis(1500), 4096);

        let record = DownloadRecord::from_result(&run(), "static", &result);

        assert_eq!(record.cid_source, "static");
        assert_eq!(record.file_size_b, Some(4096));
        assert_eq!(record.cat_ttfb_s, Some(0.25));
        assert_eq!(record.cat_duration_s, Some(1.5));
        assert_eq!(record.discovery_method, Some(DiscoveryMethod::Bitswap));
        assert_eq!(record.found_prov_count, 0);
        assert_eq!(record.ipni_start, None);
        assert_eq!(record.ipni_duration_s, None);
        assert_eq!(
            record.first_block_rec_at,
            Some(DateTime::from(from_unix_nanos(T0 + SEC / 2)))
        );
        assert!(record.done);
    }

    #[test]
    fn records_serialize_flat() {
        let record = UploadRecord::from_result(&run(), &upload_result());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["run_id"], "run-1");
        assert_eq!(json["node_peer_id"], "12D3KooWNode");
        assert_eq!(json["upload_duration_s"], 10.0);
        assert!(json["error"].is_null());
        assert!(json.get("run").is_none());
    }

    #[tokio::test]
    async fn json_lines_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonLinesSink::with_prefix(dir.path().join("out"), "2025-10-14T1846")
            .await
            .unwrap();
        let record = UploadRecord::from_result(&run(), &upload_result());

        sink.write_upload(&record).await.unwrap();
        sink.write_upload(&record).await.unwrap();

        assert!(sink
            .uploads_path()
            .ends_with("out/2025-10-14T1846_uploads.ndjson"));
        let contents = std::fs::read_to_string(sink.uploads_path()).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let decoded: UploadRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(std::fs::read_to_string(sink.downloads_path()).unwrap(), "");
    }

    #[tokio::test]
    async fn json_lines_sink_keeps_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let record = UploadRecord::from_result(&run(), &upload_result());

        let first = JsonLinesSink::with_prefix(dir.path(), "2025-10-14T1846")
            .await
            .unwrap();
        first.write_upload(&record).await.unwrap();
        drop(first);

        let reopened = JsonLinesSink::with_prefix(dir.path(), "2025-10-14T1846")
            .await
            .unwrap();
        reopened.write_upload(&record).await.unwrap();

        let contents = std::fs::read_to_string(reopened.uploads_path()).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn discarding_sinks_accept_records() {
        let record = UploadRecord::from_result(&run(), &upload_result());
        NoopSink.write_upload(&record).await.unwrap();
        LogSink.write_upload(&record).await.unwrap();
    }
}
