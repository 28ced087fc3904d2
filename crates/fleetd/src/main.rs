//! fleetd — the fleet hub daemon.
//!
//! # Usage
//!
//! ```text
//! fleetd run --config /etc/fleet/fleet.toml --data-dir /var/lib/fleet
//! fleetd default-config > fleet.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use fleet_core::HubConfig;
use fleet_metrics::{HubMetrics, render_prometheus};
use fleet_state::StateStore;
use fleetd::Hub;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleet=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "Fleet hub daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and the update-run controller.
    Run {
        /// Hub configuration file (TOML). Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleet")]
        data_dir: PathBuf,

        /// Keep state in memory only.
        #[arg(long)]
        in_memory: bool,

        /// Log output format.
        #[arg(long, value_enum, default_value_t = LogFormat::Text)]
        log_format: LogFormat,

        /// Seconds between Prometheus snapshots written to the data directory.
        #[arg(long, default_value = "60")]
        metrics_interval: u64,
    },
    /// Print the default configuration as TOML.
    DefaultConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    match format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            config,
            data_dir,
            in_memory,
            log_format,
            metrics_interval,
        } => {
            init_tracing(log_format);
            run(config, data_dir, in_memory, metrics_interval).await
        }
        Command::DefaultConfig => {
            print!("{}", HubConfig::default().to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(
    config_path: Option<PathBuf>,
    data_dir: PathBuf,
    in_memory: bool,
    metrics_interval: u64,
) -> anyhow::Result<()> {
    info!("fleet hub starting");

    let config = match &config_path {
        Some(path) => {
            let config = HubConfig::from_file(path)?;
            info!(path = ?path, "configuration loaded");
            config
        }
        None => HubConfig::default(),
    };

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&data_dir)?;
    let store = if in_memory {
        info!("using in-memory state store");
        StateStore::open_in_memory()?
    } else {
        let db_path = data_dir.join("fleet.redb");
        let store = StateStore::open(&db_path)?;
        info!(path = ?db_path, "state store opened");
        store
    };

    let metrics = HubMetrics::global();

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Metrics snapshots ──────────────────────────────────────

    let metrics_path = data_dir.join("metrics.prom");
    let metrics_handle = {
        let metrics = Arc::clone(&metrics);
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(metrics_interval.max(1)));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        if let Err(e) = tokio::fs::write(&metrics_path, render_prometheus(&metrics)).await {
                            warn!(path = ?metrics_path, error = %e, "cannot write metrics snapshot");
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    };

    // ── Controllers ────────────────────────────────────────────

    let hub = Hub::new(store, config, metrics);
    let hub_handle = tokio::spawn(hub.run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for shutdown signal, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    hub_handle.await??;
    let _ = metrics_handle.await;

    info!("fleet hub stopped");
    Ok(())
}
