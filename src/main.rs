use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::cli::{CommonArgs, utils};
use common::config::{Configuration, ProcessBy};
use common::storage::create_partition_store;
use futures::{Stream, stream};
use syncer::{ObjectStoreCatalog, PgConnector, ShutdownTrigger, SyncRunner, escalate_signals};

/// Conventional exit status after SIGINT
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "partsync")]
#[command(about = "Incrementally sync partitioned object storage files into a warehouse table")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one sync cycle
    #[command(alias = "copy-s3-data-to-redshift")]
    Sync {
        /// Reconcile whole dates or individual (date, org) partitions
        #[arg(long, value_name = "date|dateorg")]
        process_by: Option<ProcessBy>,

        /// Print the worklist without loading anything
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the effective configuration
    Config {
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration
    Validate,
    /// Show version information
    Version,
}

/// Shutdown signals (SIGINT or SIGTERM) as a stream. Handlers are installed
/// once so a repeated signal is never missed.
#[cfg(unix)]
fn shutdown_signals() -> Result<impl Stream<Item = ()> + Send + 'static> {
    use tokio::signal::unix::{SignalKind, signal};

    let sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    Ok(stream::unfold((sigint, sigterm), |(mut sigint, mut sigterm)| async move {
        let name = tokio::select! {
            received = sigint.recv() => received.map(|()| "SIGINT"),
            received = sigterm.recv() => received.map(|()| "SIGTERM"),
        }?;
        log::info!("Received {name}");
        Some(((), (sigint, sigterm)))
    }))
}

#[cfg(not(unix))]
fn shutdown_signals() -> Result<impl Stream<Item = ()> + Send + 'static> {
    Ok(stream::unfold((), |()| async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for shutdown signal: {e}");
            return None;
        }
        log::info!("Received Ctrl+C");
        Some(((), ()))
    }))
}

async fn run_sync(mut config: Configuration, process_by: Option<ProcessBy>, dry_run: bool) -> Result<ExitCode> {
    if let Some(process_by) = process_by {
        config.sync.process_by = process_by;
    }
    config.validate().context("Invalid configuration")?;

    let store =
        create_partition_store(&config.storage).context("Failed to initialize object store")?;
    let catalog = Arc::new(ObjectStoreCatalog::new(store));
    let connector = Arc::new(PgConnector::new(&config.warehouse, &config.bulk_load));

    let (trigger, shutdown) = ShutdownTrigger::new();
    let signals = shutdown_signals()?;
    tokio::spawn(async move {
        if escalate_signals(&trigger, signals).await {
            std::process::exit(i32::from(EXIT_INTERRUPTED));
        }
    });

    let runner = SyncRunner::new(&config, catalog, connector, shutdown.clone());
    let process_by = config.sync.process_by;

    if dry_run {
        let worklist = runner
            .plan(process_by)
            .await
            .context("Failed to plan sync cycle")?;
        println!("{} decisions ({process_by}):", worklist.len());
        for decision in &worklist {
            println!("  {decision} ({})", decision.reason);
        }
        return Ok(ExitCode::SUCCESS);
    }

    log::info!("Starting sync (process by {process_by})");
    let report = runner
        .run_cycle(process_by)
        .await
        .context("Sync cycle failed")?;

    if report.interrupted || shutdown.is_triggered() {
        log::warn!("Sync interrupted, all warehouse connections closed");
        return Ok(ExitCode::from(EXIT_INTERRUPTED));
    }
    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Initialize logging based on CLI arguments
    utils::init_logging(&cli.common);

    if let Commands::Version = cli.command {
        println!(
            "{}",
            utils::version_info(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        );
        return Ok(ExitCode::SUCCESS);
    }

    let config = utils::load_config(cli.common.config.as_ref())?;

    match cli.command {
        Commands::Sync {
            process_by,
            dry_run,
        } => run_sync(config, process_by, dry_run).await,
        Commands::Config { json } => {
            utils::display_config(&config, json)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate => {
            utils::validate_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Version => Ok(ExitCode::SUCCESS),
    }
}
