//! Sentinel relay daemon.
//!
//! Consumes scan tool output from `nsqd`, reschedules follow-up work, and
//! serves the pipeline counters over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Every stage with default tiers, nsqd on localhost
//! sentinel-relay
//!
//! # Pipeline file and remote broker
//! sentinel-relay --config /etc/sentinel/pipeline.yaml --nsqd-host nsq.internal
//! ```
//!
//! # Graceful Shutdown
//!
//! SIGINT and SIGTERM stop every stage after its current message, stop the
//! stats server, and flush both stores before exiting.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sentinel_core::metrics::{init_metrics, set_gauge, start_metrics_server};
use sentinel_relay::{NsqBroker, NsqConfig, PipelineConfig, PipelineGraph};
use sentinel_serve::AppState;
use sentinel_store::{CounterStore, ResultLog};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Sentinel relay daemon.
#[derive(Parser, Debug)]
#[command(name = "sentinel-relay")]
#[command(about = "Relay and reschedule daemon for certificate, DNS and probe scans")]
#[command(version)]
struct Args {
    /// Pipeline YAML file (every stage enabled with default tiers if omitted)
    #[arg(long, short, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// nsqd host, with optional port (default port 4150)
    #[arg(long, env = "SENTINEL_NSQD_HOST", default_value = "127.0.0.1")]
    nsqd_host: String,

    /// Stats HTTP bind address
    #[arg(long, env = "SENTINEL_STATS_ADDR", default_value = "127.0.0.1:8000")]
    stats_addr: SocketAddr,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "SENTINEL_METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Path to .env file (optional)
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)
            .with_context(|| format!("Failed to load {}", args.dotenv))?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,sentinel_relay=debug")),
        )
        .init();

    tracing::info!("Sentinel relay starting...");

    let config = match &args.config {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load pipeline config {}", path.display()))?,
        None => PipelineConfig::all_enabled(),
    };

    if args.metrics_port > 0 {
        let metrics_handle = init_metrics();
        start_metrics_server(args.metrics_port, metrics_handle).await?;
    }

    let counters_path = config.counters_path();
    let results_path = config.results_path();
    let counters = Arc::new(
        CounterStore::open(&counters_path)
            .with_context(|| format!("Failed to open counter store {}", counters_path.display()))?,
    );
    let results = Arc::new(
        ResultLog::open(&results_path)
            .with_context(|| format!("Failed to open result log {}", results_path.display()))?,
    );

    let nsq = NsqConfig::for_host(&args.nsqd_host);

    tracing::info!("Configuration:");
    tracing::info!("  nsqd: {}", nsq.nsqd_addr);
    tracing::info!(
        "  Counters: {} (~{} keys)",
        counters_path.display(),
        counters.approximate_count().unwrap_or(0)
    );
    tracing::info!("  Results: {}", results_path.display());
    tracing::info!("  Stats: {}", args.stats_addr);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    ctrlc::set_handler(move || {
        tracing::info!("Shutdown signal received, stopping gracefully...");
        signal_token.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let graph = PipelineGraph::from_config(
        &config,
        Arc::new(NsqBroker::new(nsq)),
        Arc::clone(&counters),
        Arc::clone(&results),
    )
    .context("Failed to build pipeline")?;
    if graph.is_empty() {
        tracing::warn!("No stages enabled; serving stats only");
    }
    for stage in graph.stages() {
        tracing::info!(
            "  Stage {}: {} -> delay {}s",
            stage.name,
            stage.input_topic,
            stage.delay_secs
        );
    }

    let listener = tokio::net::TcpListener::bind(args.stats_addr)
        .await
        .with_context(|| format!("Failed to bind stats server on {}", args.stats_addr))?;

    let running = graph
        .start(shutdown.clone())
        .await
        .context("Failed to start pipeline")?;
    set_gauge("relay_running", 1.0);

    let server = tokio::spawn(sentinel_serve::serve(
        listener,
        AppState::new(Arc::clone(&counters)),
        shutdown.clone(),
    ));

    shutdown.cancelled().await;
    running.stop();

    let failed = running.join().await;
    if !failed.is_empty() {
        tracing::error!(stages = ?failed, "stages exited abnormally");
    }

    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "stats server failed"),
        Err(e) => tracing::error!(error = %e, "stats server task failed"),
    }
    set_gauge("relay_running", 0.0);

    counters.flush().context("Failed to flush counter store")?;
    results.flush().context("Failed to flush result log")?;

    tracing::info!("Sentinel relay stopped");
    Ok(())
}
