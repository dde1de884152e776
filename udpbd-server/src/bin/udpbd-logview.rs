//! udpbd-logview - print debug messages the appliance broadcasts over UDP.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::UdpSocket;
use tokio::signal;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use udpbd::UDPBD_LOG_PORT;

#[derive(Parser)]
#[command(
    name = "udpbd-logview",
    about = "Print debug text broadcast by a UDPBD client"
)]
struct Cli {
    /// Address to listen on.
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], UDPBD_LOG_PORT)))]
    address: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let socket = UdpSocket::bind(cli.address)
        .await
        .with_context(|| format!("Failed to bind: {}", cli.address))?;
    info!(address = %cli.address, "Listening for log messages");

    let mut buf = vec![0u8; 2048];
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
                return Ok(());
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, from)) => {
                        let text = String::from_utf8_lossy(&buf[..n]);
                        print!("{from}: {text}");
                        if !text.ends_with('\n') {
                            println!();
                        }
                    }
                    Err(e) => warn!(error = %e, "Receive failed"),
                }
            }
        }
    }
}
