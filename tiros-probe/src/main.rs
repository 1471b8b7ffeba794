//! Periodically uploads random content to and downloads known content from a
//! Kubo node, and records how long each step took according to the node's
//! own telemetry.
//!
//! Kubo must export its traces over OTLP/gRPC to the receiver address of
//! this probe, e.g. with `OTEL_EXPORTER_OTLP_ENDPOINT=http://<probe>:4317`.
mod cids;
mod config;
mod probe;

use anyhow::Context;
use cids::StaticCidProvider;
use config::ProbeConfig;
use probe::ProbeLoop;
use std::sync::Arc;
use tiros::record::{JsonLinesSink, LogSink, NoopSink, RecordSink, RunInfo};
use tiros::{ActionDriver, Correlator, DriverConfig, ReceiverConfig};
use tiros_kubo::KuboClient;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_logging() -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive("hyper=error".parse()?)
            .add_directive("h2=error".parse()?)
            .add_directive("tonic=error".parse()?)
            .add_directive("reqwest=error".parse()?),
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_filter(filter))
        .init();
    Ok(())
}

async fn record_sink(config: &ProbeConfig) -> anyhow::Result<Box<dyn RecordSink>> {
    if config.dry_run {
        info!(name: "Probe.DryRun", "records are discarded");
        return Ok(Box::new(NoopSink));
    }
    match &config.json_out {
        Some(dir) => {
            let sink = JsonLinesSink::create(dir)
                .await
                .with_context(|| format!("creating record files in {}", dir.display()))?;
            Ok(Box::new(sink))
        }
        None => Ok(Box::new(LogSink)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging()?;
    let config = ProbeConfig::from_env()?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!(name: "Probe.Interrupted", "stopping after the current probe");
            }
            shutdown.cancel();
        }
    });

    let (correlator, receiver) = Correlator::new(ReceiverConfig::default())?;
    let listener = TcpListener::bind(config.receiver_addr)
        .await
        .with_context(|| format!("binding trace receiver to {}", config.receiver_addr))?;
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let served = receiver.serve_with_listener(listener, shutdown.clone()).await;
            if let Err(err) = &served {
                error!(name: "Probe.ReceiverFailed", error = %err);
                shutdown.cancel();
            }
            served
        }
    });

    let kubo = KuboClient::new(config.kubo_endpoint.as_str())?;
    let version = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        version = kubo.wait_available(config.kubo_wait_timeout) => version?,
    };
    let peer = kubo.id().await?;

    let run = RunInfo {
        run_id: uuid::Uuid::new_v4().to_string(),
        region: config.region.clone(),
        tiros_version: env!("CARGO_PKG_VERSION").to_owned(),
        node_version: version.version,
        node_peer_id: peer.id,
    };
    info!(
        name: "Probe.Started",
        run_id = %run.run_id,
        node_version = %run.node_version,
        node_peer_id = %run.node_peer_id,
    );

    let probe = ProbeLoop {
        sink: record_sink(&config).await?,
        cids: StaticCidProvider::new(config.download_cids.clone()),
        driver: ActionDriver::new(
            correlator,
            Arc::new(kubo),
            DriverConfig::default(),
            shutdown.clone(),
        ),
        run,
        config,
        shutdown: shutdown.clone(),
    };
    let outcome = probe.run().await;

    shutdown.cancel();
    server.await??;
    outcome
}
