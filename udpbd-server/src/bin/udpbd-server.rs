//! udpbd-server - serve a block device or image file over UDPBD.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use udpbd_server::{Config, DeviceKind, Session, SessionEnd};

#[derive(Parser)]
#[command(
    name = "udpbd-server",
    about = "Serve a block device or image file over UDPBD"
)]
struct Cli {
    /// Path to config file. If omitted, uses defaults.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Block device or image file to serve. Overrides config file if specified.
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Open the device read-only.
    #[arg(long)]
    read_only: bool,

    /// Serve a 16 MiB in-memory device instead of a file.
    #[arg(long, conflicts_with = "path")]
    memory: bool,

    /// Sector size in bytes.
    #[arg(long)]
    sector_size: Option<u32>,

    /// Address to listen on (default 0.0.0.0:48573).
    #[arg(short, long)]
    address: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match cli.config {
        Some(ref path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(path) = cli.path {
        config.device.kind = DeviceKind::File;
        config.device.path = Some(path);
    }
    if cli.memory {
        config.device.kind = DeviceKind::Memory;
    }
    if cli.read_only {
        config.device.read_only = true;
    }
    if let Some(sector_size) = cli.sector_size {
        config.device.sector_size = sector_size;
    }
    if let Some(address) = cli.address {
        config.server.address = address;
    }
    config.validate().context("Invalid configuration")?;

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let session = Session::open(&config)
        .await
        .context("Failed to start session")?;

    info!(
        address = %session.local_addr()?,
        device = %config
            .device
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "memory".to_string()),
        read_only = session.device().is_read_only(),
        "udpbd-server started"
    );

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });

    match session.serve(rx).await? {
        SessionEnd::Shutdown => info!("Shut down"),
        SessionEnd::DeviceLost => info!("Device removed, exiting"),
    }
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("Failed to wait for Ctrl+C");
        info!("Received SIGINT");
    }
}
