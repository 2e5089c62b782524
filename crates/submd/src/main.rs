use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use tracing_subscriber::EnvFilter;

use subm_connectors::ConnectorRegistry;
use subm_core::config::{load_engine_config, EngineConfig};
use subm_core::types::{RunId, TargetId, TriggeredBy, WorkerId};
use subm_core::validation::Validate;
use submd::{JsonlEventLog, Operations, SqliteStore, WorkerService};

#[derive(Debug, Parser)]
#[command(name = "submd", about = "Directory submission worker daemon")]
struct Cli {
    /// Path to the engine config file.
    #[arg(long, default_value = "config/subm.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Poll and process runs until interrupted.
    Run,
    /// Execute exactly one worker tick and exit.
    Tick,
    /// Queue a new run for a target.
    Enqueue { target_id: String },
    /// Print run counts per status.
    Status,
    /// Print the event history of a run.
    Events { run_id: String },
    /// List registered connector keys.
    Connectors,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = if cli.config.exists() {
        load_engine_config(&cli.config)?
    } else {
        EngineConfig::default()
    };
    for issue in config.validate() {
        tracing::warn!(code = issue.code, "{}", issue.message);
    }

    match cli.command {
        Command::Run => run_daemon(&config),
        Command::Tick => {
            let worker = build_worker(&config)?;
            let report = worker.tick_once()?;
            println!(
                "requeued {} processed {} succeeded {} failed {} skipped {}",
                report.requeued, report.processed, report.succeeded, report.failed, report.skipped
            );
            Ok(())
        }
        Command::Enqueue { target_id } => {
            let worker = build_worker(&config)?;
            let run = worker.state_machine().create_run(
                &TargetId::new(target_id),
                TriggeredBy::User,
                None,
                None,
            )?;
            println!("{}", run.id);
            Ok(())
        }
        Command::Status => {
            let (store, log) = open_store(&config)?;
            let ops = Operations::new(store, log);
            for (status, count) in ops.status_counts()? {
                println!("{status:>14} {count}");
            }
            Ok(())
        }
        Command::Events { run_id } => {
            let (store, log) = open_store(&config)?;
            let ops = Operations::new(store, log);
            for event in ops.run_events(&RunId::new(run_id))? {
                println!("{}", serde_json::to_string(&event)?);
            }
            Ok(())
        }
        Command::Connectors => {
            for key in ConnectorRegistry::default().list() {
                println!("{key}");
            }
            Ok(())
        }
    }
}

fn open_store(config: &EngineConfig) -> anyhow::Result<(Arc<SqliteStore>, JsonlEventLog)> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let store = SqliteStore::open(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    store.migrate().context("running migrations")?;
    Ok((Arc::new(store), JsonlEventLog::new(&config.event_log_root)))
}

fn build_worker(config: &EngineConfig) -> anyhow::Result<WorkerService> {
    let (store, log) = open_store(config)?;
    let worker_id = WorkerId::generate(&config.worker.id_prefix);
    Ok(WorkerService::new(
        store,
        log,
        Arc::new(ConnectorRegistry::default()),
        config,
        worker_id,
    ))
}

fn run_daemon(config: &EngineConfig) -> anyhow::Result<()> {
    let worker = build_worker(config)?;
    tracing::info!(worker_id = %worker.worker_id(), "worker started");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))
        .context("registering SIGINT handler")?;
    signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))
        .context("registering SIGTERM handler")?;

    let poll_interval = Duration::from_millis(config.worker.poll_interval_ms);
    while !shutdown.load(Ordering::Relaxed) {
        match worker.cleanup_expired_locks() {
            Ok(reclaimed) if reclaimed > 0 => {
                tracing::info!(reclaimed, "reclaimed expired leases");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "lease cleanup failed"),
        }
        match worker.expire_overdue_actions() {
            Ok(expired) if expired > 0 => {
                tracing::info!(expired, "expired overdue actions");
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "action expiry failed"),
        }
        match worker.tick_once() {
            Ok(report) if report.processed > 0 || report.requeued > 0 => {
                tracing::info!(
                    requeued = report.requeued,
                    processed = report.processed,
                    succeeded = report.succeeded,
                    failed = report.failed,
                    skipped = report.skipped,
                    "tick complete"
                );
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(%error, "tick failed"),
        }
        std::thread::sleep(poll_interval);
    }

    tracing::info!("worker shutting down");
    Ok(())
}
