//! wgsync - `WireGuard` gateway directory sync
//!
//! Keeps the gateway's `WireGuard` peers and per-peer iptables chains in line
//! with the user directory, re-reading it on a fixed interval.

mod config;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use wgsync_core::{Directory, FileDirectory, Iptables, Reconciler, Scheduler};

use crate::config::{DEFAULT_CONFIG_PATH, GatewayConfig};

#[derive(Parser)]
#[command(name = "wgsync")]
#[command(about = "WireGuard gateway directory sync")]
#[command(long_about = "WireGuard gateway directory sync\n\n\
The `run` and `once` commands drive the kernel WireGuard device and need a \
binary built with `--features linux`. Without it they exit with an error; \
`list` and `init-config` work either way.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop until interrupted
    ///
    /// Needs a build with `--features linux`.
    Run {
        /// Path to config file
        #[arg(short, long, env = "WGSYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Run a single sync cycle and print what it did
    ///
    /// Needs a build with `--features linux`.
    Once {
        /// Path to config file
        #[arg(short, long, env = "WGSYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// List the users in the directory
    List {
        /// Path to config file
        #[arg(short, long, env = "WGSYNC_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
    },

    /// Generate a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        output: PathBuf,

        /// Directory export the gateway should read
        #[arg(long, default_value = "/var/lib/wgsync/users.json")]
        directory: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            let config = load_config(&config)?;
            run_loop(config).await?;
        }

        Commands::Once { config } => {
            let config = load_config(&config)?;
            run_once(config).await?;
        }

        Commands::List { config } => {
            let config = load_config(&config)?;
            list_users(&config).await?;
        }

        Commands::InitConfig { output, directory } => {
            init_tracing(None)?;
            init_config(&output, directory)?;
        }
    }

    Ok(())
}

/// Installs the log subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(level: Option<&str>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(format!("wgsync={}", level.unwrap_or("info"))))?;

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<GatewayConfig> {
    let config = GatewayConfig::from_file(path)?;
    init_tracing(config.log_level.as_deref())?;

    info!(
        config = %path.display(),
        interface = %config.sync.wireguard_interface,
        external_interface = %config.sync.external_interface,
        directory = %config.directory.path.display(),
        "loaded config"
    );
    if let Some(public_key) = config.sync.server_public_key()? {
        info!(public_key = %public_key, "gateway identity");
    }
    Ok(config)
}

#[cfg(feature = "linux")]
fn wireguard_device() -> anyhow::Result<wgsync_wireguard::KernelDevice> {
    Ok(wgsync_wireguard::KernelDevice::new())
}

#[cfg(not(feature = "linux"))]
fn wireguard_device() -> anyhow::Result<wgsync_wireguard::FakeWireGuardDevice> {
    anyhow::bail!("wgsync was built without the `linux` feature; no WireGuard backend is available")
}

/// Installs the shutdown handlers and returns a future that resolves on the
/// first SIGTERM or SIGINT.
#[cfg(unix)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
    })
}

#[cfg(not(unix))]
#[allow(clippy::unnecessary_wraps)]
fn shutdown_signal() -> anyhow::Result<impl Future<Output = ()>> {
    Ok(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "ctrl-c handler failed");
        }
    })
}

async fn run_loop(config: GatewayConfig) -> anyhow::Result<()> {
    let reconciler = Reconciler::new(
        FileDirectory::new(&config.directory.path),
        wireguard_device()?,
        Iptables::default(),
        &config.sync,
    );
    let mut scheduler = Scheduler::new(reconciler, config.sync.interval());

    let signal = shutdown_signal()?;
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        signal.await;
        info!("received shutdown signal, finishing current cycle");
        let _ = shutdown_tx.send(());
    });

    scheduler.run(shutdown_rx).await;
    info!(cycles = scheduler.cycles(), "wgsync stopped");
    Ok(())
}

async fn run_once(config: GatewayConfig) -> anyhow::Result<()> {
    let reconciler = Reconciler::new(
        FileDirectory::new(&config.directory.path),
        wireguard_device()?,
        Iptables::default(),
        &config.sync,
    );
    let mut scheduler = Scheduler::new(reconciler, config.sync.interval());

    let report = scheduler.run_once().await.context("sync cycle failed")?;

    println!("Directory users:  {}", report.directory_peers);
    println!("Device peers:     {}", report.device_peers);
    println!("Removed:          {}", report.removed);
    println!("Added:            {}", report.added);
    println!("Routes updated:   {}", report.routes_updated);

    for key in &report.failed {
        warn!(peer = %key, "peer not applied");
        println!("Failed:           {key}");
    }
    if let Some(e) = &report.device_error {
        anyhow::bail!("device update failed: {e}");
    }
    if !report.failed.is_empty() {
        anyhow::bail!("{} peer(s) could not be applied", report.failed.len());
    }

    Ok(())
}

async fn list_users(config: &GatewayConfig) -> anyhow::Result<()> {
    let directory = FileDirectory::new(&config.directory.path);
    let mut users = directory.list_authorized_peers().await?;
    users.sort_by_key(|u| u.client_address);

    if users.is_empty() {
        println!("There are no users in the directory");
        return Ok(());
    }

    println!(
        "{:<20} {:<28} {:<44} {:<15} {:<13} {}",
        "Profile", "Email", "Public Key", "Client IP", "Split tunnel", "Active"
    );
    for user in &users {
        println!(
            "{:<20} {:<28} {:<44} {:<15} {:<13} {}",
            user.profile_name,
            user.email.as_deref().unwrap_or("-"),
            user.public_key.to_base64(),
            user.client_address,
            user.split_tunnel,
            user.active
        );
    }

    Ok(())
}

fn init_config(output: &Path, directory: PathBuf) -> anyhow::Result<()> {
    let config = GatewayConfig::sample(directory);
    config.save(output)?;

    println!("Config written to {}", output.display());
    println!();
    println!("Point directory.path at your user export, then run:");
    println!("  wgsync run --config {}", output.display());

    Ok(())
}
