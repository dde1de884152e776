//! Datagram socket trait and implementations.
//!
//! Provides a unified abstraction over datagram sources:
//! - UDP sockets (production)
//! - Channel-based sockets (testing via `ChannelSocket`)

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, mpsc};

/// Trait for sending and receiving datagrams.
///
/// Implemented for `UdpSocket` and `ChannelSocket`.
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    /// Receive one datagram, returning its length and sender.
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Send one datagram to `target`.
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait]
impl DatagramSocket for UdpSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf).await
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target).await
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// A socket whose datagrams travel over in-memory channels.
///
/// The paired [`ChannelPeer`] injects datagrams (with any sender address) and
/// collects replies.
///
/// # Example
///
/// ```ignore
/// let (socket, mut peer) = ChannelSocket::new("127.0.0.1:48573".parse()?, 16);
/// tokio::spawn(async move { transport(socket).run(shutdown).await });
///
/// peer.send(info_request, client_addr).await?;
/// let (reply, to) = peer.recv().await.unwrap();
/// ```
pub struct ChannelSocket {
    local: SocketAddr,
    inbound: Mutex<mpsc::Receiver<(Bytes, SocketAddr)>>,
    outbound: mpsc::Sender<(Bytes, SocketAddr)>,
}

/// Test side of a [`ChannelSocket`].
pub struct ChannelPeer {
    inbound: mpsc::Sender<(Bytes, SocketAddr)>,
    outbound: mpsc::Receiver<(Bytes, SocketAddr)>,
}

impl ChannelSocket {
    /// Create a socket bound to `local` with the given channel capacity.
    pub fn new(local: SocketAddr, buffer: usize) -> (Self, ChannelPeer) {
        let (in_tx, in_rx) = mpsc::channel(buffer);
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let socket = Self {
            local,
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        };
        let peer = ChannelPeer {
            inbound: in_tx,
            outbound: out_rx,
        };
        (socket, peer)
    }
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "channel closed")
}

#[async_trait]
impl DatagramSocket for ChannelSocket {
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (datagram, from) = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(broken_pipe)?;
        // Like UDP, excess bytes are discarded.
        let n = datagram.len().min(buf.len());
        buf[..n].copy_from_slice(&datagram[..n]);
        Ok((n, from))
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.outbound
            .send((Bytes::copy_from_slice(buf), target))
            .await
            .map_err(|_| broken_pipe())?;
        Ok(buf.len())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }
}

impl ChannelPeer {
    /// Deliver `datagram` to the socket as if sent from `from`.
    pub async fn send(&self, datagram: impl Into<Bytes>, from: SocketAddr) -> io::Result<()> {
        self.inbound
            .send((datagram.into(), from))
            .await
            .map_err(|_| broken_pipe())
    }

    /// Next datagram the socket sent, with its target. `None` once the socket is gone.
    pub async fn recv(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.outbound.recv().await
    }

    /// Next sent datagram if one is already queued.
    pub fn try_recv(&mut self) -> Option<(Bytes, SocketAddr)> {
        self.outbound.try_recv().ok()
    }

    /// Stop delivering datagrams; the socket's next receive fails with `BrokenPipe`.
    pub fn close_inbound(&mut self) {
        let (closed, _) = mpsc::channel(1);
        self.inbound = closed;
    }

    /// Stop collecting replies; the socket's sends fail with `BrokenPipe`.
    pub fn close_outbound(&mut self) {
        self.outbound.close();
    }
}
