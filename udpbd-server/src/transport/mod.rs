//! UDP transport loop.
//!
//! The loop owns the socket and the engine: receive one datagram, hand it to
//! the engine, send every reply to the sender, receive again. One request is
//! handled end-to-end before the next datagram is read, and shutdown is only
//! observed between requests. While idle the device is checked once per
//! [`DEVICE_CHECK_INTERVAL`] so an unplugged drive ends the session even when
//! no client is talking to it.
//!
//! There is no peer validation by default. Two clients interleaving writes can
//! corrupt each other's write assembly; enable `lock_peer` to pin the session
//! to the first peer seen.

mod socket;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

pub use socket::{ChannelPeer, ChannelSocket, DatagramSocket};

use crate::config::ServerConfig;
use crate::engine::{Engine, Outcome};
use crate::error::TransportError;
use crate::stats::{IoStats, format_size};

/// Receive buffer size. Larger than any valid datagram so oversized ones are
/// seen (and rejected) rather than silently truncated to a valid length.
const RECV_BUFFER_BYTES: usize = 2048;

/// How often the device is checked for removal.
pub const DEVICE_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Why a serving loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Shutdown was requested.
    Shutdown,
    /// The device disappeared.
    DeviceLost,
}

#[derive(Debug, Clone, Default)]
pub struct TransportOptions {
    pub lock_peer: bool,
    pub stats_interval: Option<Duration>,
}

impl From<&ServerConfig> for TransportOptions {
    fn from(config: &ServerConfig) -> Self {
        Self {
            lock_peer: config.lock_peer,
            stats_interval: config.stats_interval(),
        }
    }
}

/// Bind the server socket, enabling broadcast if requested.
pub async fn bind(address: SocketAddr, broadcast: bool) -> Result<UdpSocket, TransportError> {
    let socket = UdpSocket::bind(address)
        .await
        .map_err(|source| TransportError::Bind {
            address: address.to_string(),
            source,
        })?;
    if broadcast {
        socket
            .set_broadcast(true)
            .map_err(TransportError::Configure)?;
    }
    Ok(socket)
}

pub struct Transport<S> {
    socket: S,
    engine: Engine,
    options: TransportOptions,
    stats: Option<Arc<IoStats>>,
    peer: Option<SocketAddr>,
}

impl<S: DatagramSocket> Transport<S> {
    pub fn new(socket: S, engine: Engine, options: TransportOptions) -> Self {
        Self {
            socket,
            engine,
            options,
            stats: None,
            peer: None,
        }
    }

    /// Log these counters every `stats_interval`.
    pub fn with_stats(mut self, stats: Arc<IoStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    /// Serve datagrams until shutdown is signalled or the device goes away.
    ///
    /// Receive failures are fatal; send failures are logged and serving continues.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<SessionEnd, TransportError> {
        let mut buf = vec![0u8; RECV_BUFFER_BYTES];
        let mut stats_tick = self.options.stats_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });
        let mut last_stats = self
            .stats
            .as_ref()
            .map(|stats| stats.snapshot())
            .unwrap_or_default();
        let mut device_check =
            tokio::time::interval_at(Instant::now() + DEVICE_CHECK_INTERVAL, DEVICE_CHECK_INTERVAL);
        device_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if let Ok(local) = self.socket.local_addr() {
            let geometry = self.engine.geometry();
            info!(
                address = %local,
                sector_size = geometry.sector_size,
                sector_count = geometry.sector_count,
                "UDPBD server listening"
            );
        }

        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }

            let (n, peer) = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    continue;
                }
                _ = tick(&mut stats_tick) => {
                    if let Some(stats) = &self.stats {
                        let now = stats.snapshot();
                        let delta = now.since(&last_stats);
                        last_stats = now;
                        info!(
                            read = %format_size(delta.bytes_read),
                            written = %format_size(delta.bytes_written),
                            reads = delta.reads,
                            writes = delta.writes,
                            failures = delta.failures,
                            "I/O stats"
                        );
                    }
                    continue;
                }
                _ = device_check.tick() => {
                    if !self.engine.device().is_available().await {
                        error!("Device is no longer available, ending session");
                        return Ok(SessionEnd::DeviceLost);
                    }
                    continue;
                }
                received = self.socket.recv_from(&mut buf) => {
                    received.map_err(TransportError::Receive)?
                }
            };

            if !self.accept_peer(peer) {
                continue;
            }

            match self.engine.handle(&buf[..n]).await {
                Outcome::Replies(replies) => {
                    for reply in replies {
                        if let Err(e) = self.socket.send_to(&reply, peer).await {
                            warn!(%peer, error = %e, "Failed to send reply");
                        }
                    }
                }
                Outcome::Pending => {}
                Outcome::Dropped(reason) => {
                    debug!(%peer, ?reason, "Dropped datagram");
                }
                Outcome::DeviceLost(e) => {
                    warn!(error = %e, "Device lost, ending session");
                    return Ok(SessionEnd::DeviceLost);
                }
            }
        }
    }

    fn accept_peer(&mut self, peer: SocketAddr) -> bool {
        if !self.options.lock_peer {
            return true;
        }
        match self.peer {
            None => {
                info!(%peer, "Session locked to peer");
                self.peer = Some(peer);
                true
            }
            Some(owner) if owner == peer => true,
            Some(owner) => {
                debug!(%peer, %owner, "Dropped datagram from foreign peer");
                false
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use bytes::Bytes;
    use udpbd::{Command, Header, InfoReply, Message, RwRequest};

    use super::*;
    use crate::device::{BlockDevice, DeviceResult, MemoryDevice};
    use crate::stats::CountingDevice;
    use crate::types::Geometry;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, 1], port))
    }

    fn info(cmd_id: u8) -> Bytes {
        Message::Info(Header::new(Command::Info, cmd_id, 0)).encode()
    }

    fn read(cmd_id: u8, sector: u32, count: u16) -> Bytes {
        Message::Read(RwRequest {
            header: Header::new(Command::Read, cmd_id, 0),
            sector,
            sector_count: count,
        })
        .encode()
    }

    fn setup(
        options: TransportOptions,
    ) -> (
        Transport<ChannelSocket>,
        ChannelPeer,
        watch::Sender<bool>,
        watch::Receiver<bool>,
    ) {
        let device = Arc::new(MemoryDevice::new(Geometry::new(512, 64)));
        let (socket, peer) = ChannelSocket::new(addr(48573), 64);
        let transport = Transport::new(socket, Engine::new(device), options);
        let (tx, rx) = watch::channel(false);
        (transport, peer, tx, rx)
    }

    #[tokio::test]
    async fn replies_go_to_sender() {
        let (mut transport, mut peer, tx, rx) = setup(TransportOptions::default());
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(info(3), addr(5000)).await.unwrap();
        let (reply, to) = peer.recv().await.unwrap();
        assert_eq!(to, addr(5000));
        assert!(matches!(
            Message::decode(&reply).unwrap(),
            Message::InfoReply(InfoReply { sector_count: 64, .. })
        ));

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn malformed_datagram_gets_no_reply_and_serving_continues() {
        let (mut transport, mut peer, tx, rx) = setup(TransportOptions::default());
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(vec![0x02u8], addr(5000)).await.unwrap();
        peer.send(vec![0x1Fu8, 0x00], addr(5000)).await.unwrap();
        peer.send(read(1, 0, 1), addr(5000)).await.unwrap();

        // The only reply is the read's single data packet.
        let (reply, _) = peer.recv().await.unwrap();
        assert!(matches!(
            Message::decode(&reply).unwrap(),
            Message::ReadRdma(_)
        ));
        assert!(peer.try_recv().is_none());

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn out_of_range_read_gets_no_reply() {
        let (mut transport, mut peer, tx, rx) = setup(TransportOptions::default());
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(read(1, 60, 10), addr(5000)).await.unwrap();
        peer.send(info(2), addr(5000)).await.unwrap();

        let (reply, _) = peer.recv().await.unwrap();
        assert_eq!(Message::decode(&reply).unwrap().header().cmd_id, 2);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn lock_peer_drops_foreign_datagrams() {
        let (mut transport, mut peer, tx, rx) = setup(TransportOptions {
            lock_peer: true,
            ..Default::default()
        });
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(info(1), addr(5000)).await.unwrap();
        peer.send(info(2), addr(6000)).await.unwrap();
        peer.send(info(3), addr(5000)).await.unwrap();

        let (first, to) = peer.recv().await.unwrap();
        assert_eq!(to, addr(5000));
        assert_eq!(Message::decode(&first).unwrap().header().cmd_id, 1);
        let (second, to) = peer.recv().await.unwrap();
        assert_eq!(to, addr(5000));
        assert_eq!(Message::decode(&second).unwrap().header().cmd_id, 3);

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn receive_failure_is_fatal() {
        let (mut transport, mut peer, _tx, rx) = setup(TransportOptions::default());
        peer.close_inbound();
        assert!(matches!(
            transport.run(rx).await,
            Err(TransportError::Receive(_))
        ));
    }

    #[tokio::test]
    async fn send_failure_is_not_fatal() {
        let (mut transport, mut peer, tx, rx) = setup(TransportOptions::default());
        peer.close_outbound();

        let handle = tokio::spawn(async move { transport.run(rx).await });
        peer.send(info(1), addr(5000)).await.unwrap();
        peer.send(info(2), addr(5000)).await.unwrap();
        tokio::task::yield_now().await;

        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test]
    async fn device_loss_ends_session() {
        let device = Arc::new(MemoryDevice::new(Geometry::new(512, 8)));
        let (socket, peer) = ChannelSocket::new(addr(48573), 4);
        let mut transport = Transport::new(
            socket,
            Engine::new(device.clone()),
            TransportOptions::default(),
        );
        let (_tx, rx) = watch::channel(false);

        device.close().await.unwrap();
        peer.send(read(0, 0, 1), addr(5000)).await.unwrap();
        assert_eq!(transport.run(rx).await.unwrap(), SessionEnd::DeviceLost);
    }

    /// Memory device whose presence can be switched off from the test.
    struct Unpluggable {
        inner: MemoryDevice,
        present: AtomicBool,
    }

    #[async_trait::async_trait]
    impl BlockDevice for Unpluggable {
        fn geometry(&self) -> Geometry {
            self.inner.geometry()
        }

        fn is_read_only(&self) -> bool {
            self.inner.is_read_only()
        }

        async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes> {
            self.inner.read_sectors(start, count).await
        }

        async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()> {
            self.inner.write_sectors(start, count, data).await
        }

        async fn close(&self) -> DeviceResult<()> {
            self.inner.close().await
        }

        async fn is_available(&self) -> bool {
            self.present.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn idle_session_ends_when_device_disappears() {
        let device = Arc::new(Unpluggable {
            inner: MemoryDevice::new(Geometry::new(512, 8)),
            present: AtomicBool::new(true),
        });
        let (socket, mut peer) = ChannelSocket::new(addr(48573), 4);
        let mut transport = Transport::new(
            socket,
            Engine::new(device.clone()),
            TransportOptions::default(),
        );
        let (_tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(info(1), addr(5000)).await.unwrap();
        peer.recv().await.unwrap();

        // Several checks pass while the device is present.
        tokio::time::sleep(DEVICE_CHECK_INTERVAL * 5).await;
        assert!(!handle.is_finished());

        // No datagrams arrive after the unplug; the check alone ends the session.
        device.present.store(false, Ordering::SeqCst);
        tokio::time::sleep(DEVICE_CHECK_INTERVAL * 2).await;
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::DeviceLost);
    }

    #[tokio::test]
    async fn shutdown_before_start_returns_immediately() {
        let (mut transport, _peer, tx, rx) = setup(TransportOptions::default());
        tx.send(true).unwrap();
        assert_eq!(transport.run(rx).await.unwrap(), SessionEnd::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_are_sampled_periodically() {
        let stats = Arc::new(IoStats::new());
        let device = CountingDevice::new(MemoryDevice::new(Geometry::new(512, 8)), stats.clone());
        let (socket, mut peer) = ChannelSocket::new(addr(48573), 4);
        let mut transport = Transport::new(
            socket,
            Engine::new(Arc::new(device)),
            TransportOptions {
                lock_peer: false,
                stats_interval: Some(Duration::from_secs(10)),
            },
        )
        .with_stats(stats.clone());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { transport.run(rx).await });

        peer.send(read(0, 0, 2), addr(5000)).await.unwrap();
        peer.recv().await.unwrap();
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(stats.snapshot().bytes_read, 1024);
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), SessionEnd::Shutdown);
    }
}
