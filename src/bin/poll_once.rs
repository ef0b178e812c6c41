use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use pullwatch::config;
use pullwatch::db::Store;
use pullwatch::hub::HubClient;
use pullwatch::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Run a single scheduler tick against every due target and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let store = Store::open(&cfg.database_url())
        .await
        .context("failed to open storage")?;
    let client = HubClient::from_config(&cfg)?;
    let scheduler =
        Scheduler::new(store, Arc::new(client)).with_target_timeout(cfg.target_timeout());

    let summary = scheduler.tick().await;
    info!(?summary, "tick complete");
    println!(
        "polled {} target(s): {} snapshot(s) recorded, {} repo failure(s), {} target failure(s); {} not due, {} disabled",
        summary.polled,
        summary.repos_recorded,
        summary.repos_failed,
        summary.failed_targets,
        summary.not_due,
        summary.disabled,
    );
    Ok(())
}
