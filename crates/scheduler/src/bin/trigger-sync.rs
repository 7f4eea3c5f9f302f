//! trigger-sync — keeps job definitions in step with control-plane triggers.
//!
//! Every interval: fetch all ingestion triggers, then create, reactivate or
//! deactivate job definitions so the schedule matches them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use sluice_core::config::{load_dotenv, Config};
use sluice_scheduler::{
    HttpTriggerSource, StaticParameterSupplier, SupplierRegistry, SyncRunner, TriggerSynchronizer, Whitelists,
};
use sluice_storage::PgJobStore;

// ── CLI ─────────────────────────────────────────────────────────────

/// Trigger synchronizer — reconciles ingestion triggers into job definitions.
#[derive(Parser, Debug)]
#[command(name = "trigger-sync", version, about)]
struct Cli {
    /// Integration types to schedule, as `type=processor` (repeatable).
    #[arg(long = "supplier", env = "SLUICE_SUPPLIERS", value_delimiter = ',')]
    suppliers: Vec<String>,

    /// Seconds between passes. Overrides `SYNC_INTERVAL_SECS`.
    #[arg(long)]
    interval: Option<u64>,

    /// Run a single pass and exit.
    #[arg(long, default_value_t = false)]
    once: bool,
}

fn parse_suppliers(raw: &[String]) -> anyhow::Result<SupplierRegistry> {
    let mut registry = SupplierRegistry::new();
    for item in raw.iter().map(|s| s.trim()).filter(|s| !s.is_empty()) {
        let (integration_type, processor) = item
            .split_once('=')
            .with_context(|| format!("supplier `{item}` must look like type=processor"))?;
        registry.register(StaticParameterSupplier::new(integration_type, processor.trim()));
    }
    Ok(registry)
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

    let suppliers = parse_suppliers(&cli.suppliers)?;
    if suppliers.is_empty() {
        anyhow::bail!("no suppliers configured; pass --supplier type=processor");
    }
    if !config.postgres.is_configured() {
        anyhow::bail!("PostgreSQL is not configured (set PG_USERNAME)");
    }

    let store = Arc::new(
        PgJobStore::connect(&config.postgres)
            .await
            .context("failed to connect to PostgreSQL")?,
    );
    let source = Arc::new(HttpTriggerSource::from_config(&config.control_plane)?);
    let synchronizer = TriggerSynchronizer::new(store, suppliers, Whitelists::from_config(&config.sync));
    let interval = Duration::from_secs(cli.interval.unwrap_or(config.sync.interval_secs));
    let runner = SyncRunner::new(source, synchronizer, interval);

    if cli.once {
        let report = runner.run_once().await?;
        info!(writes = report.writes(), "single pass finished");
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    runner.run(shutdown_rx).await;
    info!("trigger-sync exited cleanly");
    Ok(())
}
