//! agent-worker — ingestion agent pulling fetch jobs from the control plane.
//!
//! Every interval: heartbeat, pull pending job requests, accept and hand
//! them to the local engine, then report job status back.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use sluice_agent::{AgentControlService, HttpControlPlaneClient, HttpFetchController, LocalIngestionEngine};
use sluice_core::config::{load_dotenv, parse_reserved_filter, Config};

// ── CLI ─────────────────────────────────────────────────────────────

/// Ingestion agent — registers with the control plane and runs fetch jobs.
#[derive(Parser, Debug)]
#[command(name = "agent-worker", version, about)]
struct Cli {
    /// Agent id. Overrides `AGENT_ID`.
    #[arg(long)]
    agent_id: Option<String>,

    /// Seconds between control ticks. Overrides `AGENT_SCHEDULING_INTERVAL_SECS`.
    #[arg(long)]
    interval: Option<u64>,

    /// Reserved-job filter: `true`, `false`, or `all`.
    #[arg(long)]
    reserved: Option<String>,

    /// Timeout for fetch jobs, in seconds.
    #[arg(long, env = "AGENT_FETCH_TIMEOUT_SECS", default_value_t = 60)]
    fetch_timeout: u64,
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();
    let config = Config::from_env();
    config.log_summary();

    let mut settings = config.agent.clone();
    if let Some(agent_id) = cli.agent_id {
        settings.agent_id = agent_id;
    }
    if let Some(interval) = cli.interval {
        settings.scheduling_interval_secs = interval;
    }
    if let Some(raw) = cli.reserved.as_deref() {
        settings.reserved_jobs = parse_reserved_filter(Some(raw));
    }

    let engine = LocalIngestionEngine::new(settings.max_concurrent_jobs, settings.max_submissions_per_sec)
        .with_controller(HttpFetchController::new(Duration::from_secs(cli.fetch_timeout))?);
    let client = HttpControlPlaneClient::from_config(&config.control_plane)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    info!(agent_id = %settings.agent_id, "agent-worker starting");
    let mut service = AgentControlService::new(Arc::new(client), Arc::new(engine), settings);
    service.run(shutdown_rx).await;
    info!("agent-worker exited cleanly");

    Ok(())
}
