//! udpbd-monitor - serve whichever candidate device exposes a flag file.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use udpbd_server::{CandidateConfig, Config, Monitor, ProcessLauncher, TaskLauncher};

#[derive(Parser)]
#[command(
    name = "udpbd-monitor",
    about = "Watch candidate devices for a flag file and serve the first match"
)]
struct Cli {
    /// Path to config file. Also passed to the server process.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Candidate as DEVICE=ROOT, e.g. /dev/sdb1=/media/usb0. Repeatable.
    #[arg(long = "candidate", value_parser = parse_candidate)]
    candidates: Vec<CandidateConfig>,

    /// Seconds between scans.
    #[arg(long)]
    period: Option<u64>,

    /// Flag file name to look for.
    #[arg(long)]
    flag: Option<String>,

    /// Serve matched devices read-write.
    #[arg(long)]
    read_write: bool,

    /// Server binary to launch. Defaults to udpbd-server next to this binary.
    #[arg(long)]
    server: Option<PathBuf>,

    /// Serve matched devices inside this process instead of spawning a server.
    #[arg(long, conflicts_with = "server")]
    in_process: bool,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
}

fn parse_candidate(s: &str) -> Result<CandidateConfig, String> {
    let (device, root) = s
        .split_once('=')
        .ok_or_else(|| format!("expected DEVICE=ROOT, got {s:?}"))?;
    if device.is_empty() || root.is_empty() {
        return Err(format!("expected DEVICE=ROOT, got {s:?}"));
    }
    Ok(CandidateConfig {
        device: PathBuf::from(device),
        root: PathBuf::from(root),
    })
}

fn default_server_program() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("Failed to locate current executable")?;
    Ok(exe.with_file_name("udpbd-server"))
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
    config.monitor.candidates.extend(cli.candidates);
    if let Some(period) = cli.period {
        config.monitor.period_secs = period;
    }
    if let Some(flag) = cli.flag {
        config.monitor.flag = flag;
    }
    if cli.read_write {
        config.monitor.read_only = false;
    }
    if let Some(server) = cli.server {
        config.monitor.server_program = Some(server);
    }
    config.monitor.validate().context("Invalid configuration")?;
    if config.monitor.candidates.is_empty() {
        bail!("No candidate devices configured");
    }

    let subscriber = FmtSubscriber::builder()
        .with_max_level(if cli.verbose { Level::DEBUG } else { Level::INFO })
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = tx.send(true);
    });

    if cli.in_process {
        let monitor = Monitor::new(&config.monitor, TaskLauncher::new(config.clone()));
        monitor.run(rx).await;
        return Ok(());
    }

    let program = match config.monitor.server_program.clone() {
        Some(program) => program,
        None => default_server_program()?,
    };
    let mut launcher = ProcessLauncher::new(program, config.monitor.read_only);
    if let Some(path) = cli.config {
        launcher = launcher.with_config_path(path);
    }

    let monitor = Monitor::new(&config.monitor, launcher);
    monitor.run(rx).await;
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
