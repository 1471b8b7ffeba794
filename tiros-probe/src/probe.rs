use crate::cids::StaticCidProvider;
use crate::config::ProbeConfig;
use bytes::Bytes;
use rand::RngCore;
use std::sync::Arc;
use tiros::record::{DownloadRecord, RecordSink, RunInfo, UploadRecord};
use tiros::{ActionDriver, Error};
use tiros_kubo::KuboClient;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs upload and download probes against Kubo until cancelled or the
/// configured number of iterations is reached.
pub(crate) struct ProbeLoop {
    pub(crate) config: ProbeConfig,
    pub(crate) driver: ActionDriver<KuboClient>,
    pub(crate) sink: Box<dyn RecordSink>,
    pub(crate) run: RunInfo,
    pub(crate) cids: StaticCidProvider,
    pub(crate) shutdown: CancellationToken,
}

impl ProbeLoop {
    pub(crate) async fn run(mut self) -> anyhow::Result<()> {
        let kubo: Arc<KuboClient> = Arc::clone(self.driver.invoker());
        let mut next_start = Instant::now();
        let mut iteration: u64 = 0;

        while self.config.max_iterations == 0 || iteration < self.config.max_iterations {
            if let Err(err) = kubo.reset().await {
                warn!(name: "ProbeLoop.ResetFailed", error = %err);
            }

            let wait = next_start.saturating_duration_since(Instant::now());
            if !wait.is_zero() {
                info!(name: "ProbeLoop.Waiting", iteration, wait = ?wait);
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = sleep_until(next_start) => {}
            }
            next_start = Instant::now() + self.config.interval;

            if self.config.mode.uploads() {
                self.upload(iteration).await?;
            }
            if self.config.mode.downloads() {
                for _ in 0..self.config.downloads_per_iteration {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    self.download(iteration).await?;
                }
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            iteration += 1;
        }

        info!(name: "ProbeLoop.Stopped", iterations = iteration);
        Ok(())
    }

    async fn upload(&self, iteration: u64) -> anyhow::Result<()> {
        let mut content = vec![0u8; usize::try_from(self.config.file_size)?];
        rand::rng().fill_bytes(&mut content);

        let result = match self.driver.upload(Bytes::from(content)).await {
            Ok(result) => result,
            Err(Error::ChannelClosed) => {
                error!(name: "ProbeLoop.UploadAborted", iteration, error = %Error::ChannelClosed);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let record = UploadRecord::from_result(&self.run, &result);
        info!(
            name: "ProbeLoop.UploadFinished",
            iteration,
            cid = record.cid.as_deref().unwrap_or_default(),
            upload_duration_s = ?record.upload_duration_s,
            error = record.error.as_deref().unwrap_or_default(),
        );
        self.sink.write_upload(&record).await?;
        Ok(())
    }

    async fn download(&mut self, iteration: u64) -> anyhow::Result<()> {
        let content_id = self.cids.next_cid().to_owned();
        let result = match self.driver.download(&content_id).await {
            Ok(result) => result,
            Err(Error::ChannelClosed) => {
                error!(name: "ProbeLoop.DownloadAborted", iteration, error = %Error::ChannelClosed);
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let record = DownloadRecord::from_result(&self.run, StaticCidProvider::SOURCE, &result);
        info!(
            name: "ProbeLoop.DownloadFinished",
            iteration,
            cid = %record.cid,
            discovery_method = ?record.discovery_method,
            cat_duration_s = ?record.cat_duration_s,
            error = record.error.as_deref().unwrap_or_default(),
        );
        self.sink.write_download(&record).await?;
        Ok(())
    }
}
