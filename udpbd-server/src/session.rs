//! Session API for serving one device.
//!
//! A session binds one socket, opens one device and serves it until shutdown
//! or until the device disappears. The device is closed on every exit path.
//! Used by the `udpbd-server` binary and by the monitor's in-process launcher.
//!
//! # Example
//!
//! ```ignore
//! use udpbd_server::{Config, Session};
//!
//! let session = Session::open(&config).await?;
//! let (tx, rx) = tokio::sync::watch::channel(false);
//! session.serve(rx).await?;
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::{Config, ServerConfig};
use crate::device::{BlockDevice, open_device};
use crate::engine::Engine;
use crate::error::Error;
use crate::stats::{CountingDevice, IoStats, format_size};
use crate::transport::{self, DatagramSocket, SessionEnd, Transport, TransportOptions};

/// An open device bound to a socket, ready to serve.
pub struct Session<S = UdpSocket> {
    device: Arc<dyn BlockDevice>,
    stats: Arc<IoStats>,
    transport: Transport<S>,
}

impl Session<UdpSocket> {
    /// Open the configured device and bind the configured address.
    ///
    /// If binding fails the device is closed again before returning.
    pub async fn open(config: &Config) -> Result<Self, Error> {
        config.validate()?;
        let address = config.server.socket_addr()?;
        let device = open_device(&config.device).await?;

        let socket = match transport::bind(address, config.server.broadcast).await {
            Ok(socket) => socket,
            Err(e) => {
                if let Err(close_err) = device.close().await {
                    warn!(error = %close_err, "Failed to close device");
                }
                return Err(e.into());
            }
        };

        Ok(Self::with_socket(device, socket, &config.server))
    }
}

impl<S: DatagramSocket> Session<S> {
    /// Build a session over an already open device and socket.
    pub fn with_socket(device: Arc<dyn BlockDevice>, socket: S, server: &ServerConfig) -> Self {
        let stats = Arc::new(IoStats::new());
        let counted = CountingDevice::new(Arc::clone(&device), Arc::clone(&stats));
        let engine = Engine::new(Arc::new(counted));
        let transport =
            Transport::new(socket, engine, TransportOptions::from(server)).with_stats(stats.clone());
        Self {
            device,
            stats,
            transport,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.transport.socket().local_addr()
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    /// Serve until shutdown or device loss, then close the device.
    pub async fn serve(mut self, shutdown: watch::Receiver<bool>) -> Result<SessionEnd, Error> {
        let result = self.transport.run(shutdown).await;

        if let Err(e) = self.device.close().await {
            warn!(error = %e, "Failed to close device");
        }

        let totals = self.stats.snapshot();
        info!(
            read = %format_size(totals.bytes_read),
            written = %format_size(totals.bytes_written),
            reads = totals.reads,
            writes = totals.writes,
            failures = totals.failures,
            "Session ended"
        );

        Ok(result?)
    }
}
