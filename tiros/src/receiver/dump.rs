use crate::error::Result;
use crate::span::TraceBatch;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Writes every received batch as OTLP JSON to `trace-<n>.json`.
#[derive(Clone, Debug)]
pub(crate) struct TraceDump {
    dir: Arc<PathBuf>,
    counter: Arc<AtomicU64>,
}

impl TraceDump {
    /// Creates `dir` if it does not exist yet.
    pub(crate) fn create(dir: impl AsRef<Path>) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(TraceDump {
            dir: Arc::new(dir.as_ref().to_path_buf()),
            counter: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Writes `batch` and returns the file it was written to.
    pub(crate) async fn write(&self, batch: &TraceBatch) -> Result<PathBuf> {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let path = self.dir.join(format!("trace-{n}.json"));
        let json = serde_json::to_vec_pretty(batch)?;
        tokio::fs::write(&path, json).await?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{batch, SpanFixture};
    use opentelemetry::trace::TraceId;

    #[tokio::test]
    async fn writes_numbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let dump = TraceDump::create(dir.path().join("traces")).unwrap();
        let delivery = batch(vec![SpanFixture::new(
            TraceId::from(0xffu128),
            1,
            "corehttp.cmdsHandler",
            1,
            2,
        )
        .build()]);

        let first = dump.write(&delivery).await.unwrap();
        let second = dump.write(&delivery).await.unwrap();

        assert!(first.ends_with("trace-0.json"));
        assert!(second.ends_with("trace-1.json"));
        let json = std::fs::read_to_string(first).unwrap();
        assert!(json.contains("corehttp.cmdsHandler"));
        let decoded: TraceBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, delivery);
    }
}
