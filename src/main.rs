//! CLI Entry Point for device_server
//!
//! # Usage
//!
//! Serve the devices listed in the configured device file:
//! ```bash
//! device_server serve --settings device_server.toml
//! ```
//!
//! Check a device file without opening any device:
//! ```bash
//! device_server check devices.txt
//! ```
//!
//! On unix, `SIGHUP` reloads the device file. A broken file is reported and
//! the running device set is kept.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use device_server::config::{ServerSettings, DEFAULT_SETTINGS_FILE};
use device_server::network::LineServer;
use device_server::registry::DeviceSnapshot;
use device_server::tracing_setup;
use device_server::{ActionDispatcher, DeviceRegistry};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "device_server")]
#[command(about = "Share laboratory devices between many clients", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Settings file
        #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
        settings: PathBuf,

        /// Device file, overrides the settings
        #[arg(long)]
        devices: Option<PathBuf>,

        /// Listen address, overrides the settings
        #[arg(long)]
        listen: Option<String>,
    },

    /// Parse a device file and report the first error
    Check {
        /// Device file
        devices: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            settings,
            devices,
            listen,
        } => serve(&settings, devices, listen).await,
        Commands::Check { devices } => check(&devices),
    }
}

fn check(path: &Path) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("can't open configuration: {}", path.display()))?;
    let snapshot = DeviceSnapshot::parse(&path.display().to_string(), &text)?;
    for device in snapshot.devices() {
        println!("{}: {}", device.name(), device.config().kind());
    }
    println!("{} device(s) OK", snapshot.len());
    Ok(())
}

async fn serve(
    settings_path: &Path,
    devices: Option<PathBuf>,
    listen: Option<String>,
) -> Result<()> {
    let mut settings = ServerSettings::load_from(settings_path)
        .with_context(|| format!("Failed to load settings from {}", settings_path.display()))?;
    if let Some(devices) = devices {
        settings.server.devices = devices;
    }
    if let Some(listen) = listen {
        settings.server.listen = listen;
    }
    settings.validate().map_err(|e| anyhow!(e))?;

    let log = tracing_setup::init(settings.tracing_config().map_err(|e| anyhow!(e))?)
        .map_err(|e| anyhow!(e))?;

    let registry = Arc::new(DeviceRegistry::new());
    registry
        .load_file(&settings.server.devices)
        .await
        .context("Failed to load devices")?;

    let dispatcher = ActionDispatcher::new(Arc::clone(&registry), log);
    let addr = settings.listen_addr().map_err(|e| anyhow!(e))?;
    let server = LineServer::bind(addr, dispatcher, settings.server.idle_timeout)
        .await
        .with_context(|| format!("Failed to listen on {addr}"))?;

    spawn_reload_on_hangup(Arc::clone(&registry), settings.server.devices.clone())?;

    server.run_until(shutdown_signal()).await?;
    info!("Shutting down");
    Ok(())
}

#[cfg(unix)]
fn spawn_reload_on_hangup(registry: Arc<DeviceRegistry>, path: PathBuf) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            info!("Reloading {}", path.display());
            if let Err(e) = registry.load_file(&path).await {
                error!("Reload failed, keeping current devices: {}", e);
            }
        }
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_registry: Arc<DeviceRegistry>, _path: PathBuf) -> Result<()> {
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
