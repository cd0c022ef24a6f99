//! Ephemera story engine simulator
//!
//! Runs scripted scenarios against the story engine with mock collaborators
//! and prints what the engine did.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::Instrument;

use ephemera_core::OwnerId;
use ephemera_logging::{EphemeraSubscriberBuilder, FileConfig, LogConfig, OwnerContextGuard};
use ephemera_simulation::{SimConfig, Storage, scenarios};

#[derive(Parser)]
#[command(
    name = "ephemera-sim",
    about = "Scripted runs of the Ephemera story engine",
    version
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Logging configuration as JSON
    #[arg(long, global = true)]
    log_config: Option<PathBuf>,

    /// Also write JSONL logs into this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// Write the scenario report as JSON to this file
    #[arg(long, global = true)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send stories whose uploads finish newest first
    Sends {
        #[arg(short, long, default_value = "5")]
        count: u32,
    },

    /// Interrupt sends with a network failure and restart the engine
    Restart {
        /// Keep the binlog and database in this directory
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Load the global story list and read one account's stories
    Feed {
        /// Number of followed accounts
        #[arg(short, long, default_value = "6")]
        owners: usize,
    },

    /// Watch stories expire as the clock runs
    Expiry,

    /// Random operations under injected failures, then check invariants
    Chaos {
        /// Number of ticks to run
        #[arg(short, long, default_value = "200")]
        ticks: u64,

        #[arg(short, long, default_value = "42")]
        seed: u64,

        /// Probability that a remote request fails
        #[arg(long, default_value = "0.1")]
        network_failures: f64,

        /// Probability that an upload fails
        #[arg(long, default_value = "0.05")]
        upload_failures: f64,
    },

    /// Drive the async service with real time
    Service {
        #[arg(short, long, default_value = "3")]
        count: u64,
    },
}

fn log_config(cli: &Cli) -> anyhow::Result<LogConfig> {
    let mut config = match &cli.log_config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            LogConfig::from_json(&json)?
        }
        None if cli.verbose => LogConfig::development(),
        None => LogConfig {
            console: ephemera_logging::ConsoleConfig {
                pretty: true,
                ..Default::default()
            },
            ..Default::default()
        },
    };
    if let Some(directory) = &cli.log_dir {
        config.file = Some(FileConfig {
            directory: directory.clone(),
            prefix: "ephemera-sim".to_string(),
            ..Default::default()
        });
    }
    Ok(config)
}

fn write_report(path: Option<&PathBuf>, report: &impl Serialize) -> anyhow::Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        println!("\nReport written to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = EphemeraSubscriberBuilder::new()
        .with_config(log_config(&cli)?)
        .init();

    let _owner = OwnerContextGuard::new(OwnerId(1));
    run(&cli)
        .instrument(OwnerContextGuard::current_span())
        .await
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let report = cli.report.as_ref();
    match &cli.command {
        Commands::Sends { count } => {
            write_report(report, &scenarios::run_ordered_sends(*count).await?)
        }
        Commands::Restart { data_dir } => write_report(
            report,
            &scenarios::run_restart_recovery(data_dir.clone()).await?,
        ),
        Commands::Feed { owners } => write_report(report, &scenarios::run_feed(*owners).await?),
        Commands::Expiry => write_report(report, &scenarios::run_expiry().await?),
        Commands::Chaos {
            ticks,
            seed,
            network_failures,
            upload_failures,
        } => {
            let config = SimConfig {
                seed: *seed,
                network_failure_rate: *network_failures,
                upload_failure_rate: *upload_failures,
                storage: Storage::Memory,
                ..SimConfig::default()
            };
            let outcome = scenarios::run_chaos(*ticks, config).await?;
            println!("\n=== Final Statistics ===");
            println!("  Sends requested: {}", outcome.stats.sends_requested);
            println!("  Sends succeeded: {}", outcome.sends_succeeded);
            println!("  Sends failed: {}", outcome.sends_failed);
            println!("  Uploads failed: {}", outcome.stats.uploads_failed);
            println!("  Injected failures: {}", outcome.stats.injected_failures);
            println!("  Updates published: {}", outcome.updates_published);
            write_report(report, &outcome)?;
            if !outcome.violations.is_empty() {
                anyhow::bail!("{} invariant violations", outcome.violations.len());
            }
            Ok(())
        }
        Commands::Service { count } => {
            write_report(report, &scenarios::run_service(*count).await?)
        }
    }
}
