//! Cadence - heart-rate driven CPU core and frequency governor
//!
//! Commands:
//! - run: govern the heartbeat-enabled process
//! - states: print the machine-state table

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use prometheus::Registry;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cadence_daemon::states::{write_states, StatesRequest};
use cadence_daemon::{service, DaemonConfig};
use cadence_engine::{telemetry, LoopMetrics, StrategyKind};

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version)]
#[command(about = "Heart-rate driven CPU core and frequency governor")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long, global = true, env = "CADENCE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Govern the heartbeat-enabled process
    Run {
        /// Decision strategy (dummy, core-bang-bang, freq-bang-bang,
        /// uncoordinated, coordinated, core-proportional, speed-proportional)
        #[arg(long)]
        strategy: Option<StrategyKind>,

        /// Exit after this beat has been processed
        #[arg(long)]
        max_beats: Option<i64>,

        /// Directory where heartbeat-enabled processes register
        #[arg(long)]
        heartbeat_dir: Option<PathBuf>,

        /// Actuate an in-memory host instead of sysfs
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the machine-state table
    States {
        /// Core count (defaults to the host's)
        #[arg(long)]
        cores: Option<usize>,

        /// Available frequencies in kHz (comma-separated)
        #[arg(long, value_delimiter = ',')]
        frequencies: Vec<u64>,

        /// Re-read a previously printed table
        #[arg(long)]
        input: Option<PathBuf>,

        /// Skip every reduction stage
        #[arg(long)]
        raw: bool,

        #[arg(long)]
        keep_permutations: bool,

        #[arg(long)]
        keep_dominated: bool,

        #[arg(long)]
        keep_equivalent: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries the status stream
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = DaemonConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            strategy,
            max_beats,
            heartbeat_dir,
            dry_run,
        } => {
            if let Some(strategy) = strategy {
                config.strategy = strategy;
            }
            if max_beats.is_some() {
                config.max_beats = max_beats;
            }
            if heartbeat_dir.is_some() {
                config.heartbeat_dir = heartbeat_dir;
            }
            config.dry_run |= dry_run;
            config.validate()?;
            govern(config).await
        }
        Commands::States {
            cores,
            frequencies,
            input,
            raw,
            keep_permutations,
            keep_dominated,
            keep_equivalent,
        } => {
            let request = StatesRequest {
                cores,
                frequencies,
                input,
                raw,
                keep_permutations,
                keep_equivalent,
                keep_dominated,
            };
            let rows = write_states(&request, &config, std::io::stdout().lock())?;
            info!(rows, "state table written");
            Ok(())
        }
    }
}

async fn govern(config: DaemonConfig) -> Result<()> {
    info!(
        version = cadence_common::VERSION,
        strategy = %config.strategy,
        max_beats = ?config.max_beats,
        dry_run = config.dry_run,
        "Starting Cadence..."
    );

    let registry = Registry::new();
    let metrics = LoopMetrics::new()?;
    metrics.register(&registry)?;

    let stop = Arc::new(AtomicBool::new(false));
    let sink = service::stdout_sink(config.status.format);
    let mut task = tokio::spawn(service::run(config, stop.clone(), Some(metrics), sink));

    let outcome = tokio::select! {
        outcome = &mut task => outcome,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
            info!("Shutting down...");
            stop.store(true, Ordering::Relaxed);
            task.await
        }
    };

    match outcome.context("governor task panicked")?? {
        Some(summary) => info!(
            last_beat = summary.last_beat,
            evaluated = summary.evaluated,
            held_off = summary.held_off,
            actuations = summary.actuations,
            failures = summary.failures,
            "governor stopped"
        ),
        None => info!("stopped before a heartbeat-enabled process appeared"),
    }

    match telemetry::render(&registry) {
        Ok(text) => debug!(metrics = %text, "final loop metrics"),
        Err(e) => warn!(error = %e, "cannot render metrics"),
    }
    Ok(())
}
