use anyhow::{anyhow, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use pullwatch::config::{self, Config};
use pullwatch::db::Store;
use pullwatch::hub::HubClient;
use pullwatch::model::{Target, TargetMode};
use pullwatch::scheduler::Scheduler;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the poll scheduler until Ctrl-C (default)
    Serve,
    /// Manage monitoring targets
    #[command(subcommand)]
    Targets(TargetsCommand),
    /// List repositories observed so far
    Repos,
    /// Show recent snapshots and deltas for NAMESPACE/REPO
    History {
        repo: String,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
}

#[derive(Debug, Subcommand)]
enum TargetsCommand {
    List,
    Add(TargetFields),
    /// Replace every editable field of an existing target
    Edit {
        id: i64,
        #[command(flatten)]
        fields: TargetFields,
    },
    Remove {
        id: i64,
    },
}

#[derive(Debug, ClapArgs)]
struct TargetFields {
    #[arg(long)]
    name: String,
    #[arg(long)]
    namespace: String,
    /// Comma-separated repositories; omit to watch the whole namespace
    #[arg(long, value_delimiter = ',')]
    repos: Vec<String>,
    /// Seconds between runs; non-positive means the 15 minute default
    #[arg(long, default_value_t = pullwatch::model::DEFAULT_INTERVAL_SECS, allow_negative_numbers = true)]
    interval: i64,
    #[arg(long)]
    disabled: bool,
}

impl TargetFields {
    fn into_target(self, id: Option<i64>) -> Target {
        let mut target = if self.repos.is_empty() {
            Target::namespace_wide(self.name, self.namespace)
        } else {
            Target::explicit(self.name, self.namespace, self.repos)
        };
        target.id = id;
        target.interval_secs = self.interval;
        target.enabled = !self.disabled;
        target
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    cfg.ensure_dirs()?;

    let store = Store::open(&cfg.database_url())
        .await
        .context("failed to open storage")?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(&cfg, store).await,
        Command::Targets(cmd) => targets(&store, cmd).await,
        Command::Repos => {
            for repo in store.list_repositories().await? {
                println!("{:>6}  {}", repo.id, repo);
            }
            Ok(())
        }
        Command::History { repo, limit } => history(&store, &repo, limit).await,
    }
}

async fn serve(cfg: &Config, store: Store) -> Result<()> {
    let client = HubClient::from_config(cfg)?;
    let handle = Scheduler::new(store, Arc::new(client))
        .with_tick_period(cfg.tick_period())
        .with_target_timeout(cfg.target_timeout())
        .spawn();

    info!("watching; press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    info!("stopped");
    Ok(())
}

async fn targets(store: &Store, cmd: TargetsCommand) -> Result<()> {
    match cmd {
        TargetsCommand::List => {
            for t in store.list_targets().await? {
                let repos = match &t.mode {
                    TargetMode::NamespaceWide => "*".to_string(),
                    TargetMode::ExplicitList(repos) => repos.join(","),
                };
                println!(
                    "{:>4}  {:<20} {}/{}  every {}s  {}  last run: {}  {}",
                    t.id.unwrap_or_default(),
                    t.name,
                    t.namespace,
                    repos,
                    t.interval_secs,
                    if t.enabled { "enabled" } else { "disabled" },
                    t.last_run_at
                        .map(|ts| ts.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                    t.last_error.unwrap_or_default(),
                );
            }
        }
        TargetsCommand::Add(fields) => {
            let id = store.upsert_target(&fields.into_target(None)).await?;
            println!("created target {id}");
        }
        TargetsCommand::Edit { id, fields } => {
            store.upsert_target(&fields.into_target(Some(id))).await?;
            println!("updated target {id}");
        }
        TargetsCommand::Remove { id } => {
            store.delete_target(id).await?;
            println!("removed target {id}");
        }
    }
    Ok(())
}

async fn history(store: &Store, full_name: &str, limit: i64) -> Result<()> {
    let (namespace, name) = full_name
        .split_once('/')
        .ok_or_else(|| anyhow!("expected NAMESPACE/REPO, got {full_name:?}"))?;
    let repo = store
        .get_repository(namespace, name)
        .await?
        .ok_or_else(|| anyhow!("{full_name} has not been observed yet"))?;

    println!("snapshots for {repo}:");
    for s in store.list_snapshots(repo.id, limit).await? {
        println!(
            "  {}  pulls={}  stars={}",
            s.observed_at.to_rfc3339(),
            s.pull_count,
            s.star_count.map(|c| c.to_string()).unwrap_or_else(|| "-".into()),
        );
    }

    println!("deltas for {repo}:");
    for d in store.list_deltas(repo.id, limit).await? {
        println!(
            "  {} -> {}  {:+} over {}s  ({:.2}/h)",
            d.from_ts.to_rfc3339(),
            d.to_ts.to_rfc3339(),
            d.delta,
            d.seconds,
            d.per_hour,
        );
    }
    Ok(())
}
