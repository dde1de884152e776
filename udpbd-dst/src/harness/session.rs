//! Protocol-level simulation harness.
//!
//! Runs a full [`Session`] over an in-memory [`ChannelSocket`] and plays the
//! appliance: encoded requests go in, replies come out and are checked
//! against a [`SectorOracle`]. Requests the server must ignore are followed
//! by an INFO probe, whose reply has to be the very next datagram.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use udpbd::{
    CMD_ID_MAX, Command, Header, Message, RdmaPacket, RwRequest, TransferPlan, UDPBD_ENOSPC,
    UDPBD_OK, UdpbdError,
};
use udpbd_server::{
    BlockDevice, ChannelPeer, ChannelSocket, Error, Geometry, MemoryDevice, SECTOR_SIZE,
    ServerConfig, Session, SessionEnd,
};

use super::{SectorOracle, SimulationError, find_diff};

/// Largest transfer the harness issues, in sectors.
const MAX_SECTORS: u64 = 64;

const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Actions that can be performed in protocol simulation.
#[derive(Debug, Clone)]
pub enum SessionAction {
    Info,
    Read { start: u32, count: u16 },
    Write { start: u32, data: Vec<u8> },
    /// READ past the end; must produce no reply.
    OutOfRangeRead { start: u32, count: u16 },
    /// WRITE past the end; payload is absorbed and answered with ENOSPC.
    OutOfRangeWrite { start: u32, count: u16 },
    /// WRITE whose payload stops short; must produce no reply.
    AbandonedWrite { start: u32, data: Vec<u8>, packets: usize },
    /// Undecodable datagram; must produce no reply.
    Malformed { datagram: Vec<u8> },
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub operations: u64,
    pub infos: u64,
    pub reads: u64,
    pub writes: u64,
    pub rejected: u64,
    pub abandoned: u64,
    pub malformed: u64,
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
}

/// Protocol-level simulation harness.
pub struct SessionHarness {
    rng: SmallRng,
    peer: Option<ChannelPeer>,
    oracle: SectorOracle,
    client: SocketAddr,
    next_cmd_id: u8,
    stats: SessionStats,
    shutdown: Option<watch::Sender<bool>>,
    handle: Option<JoinHandle<Result<SessionEnd, Error>>>,
}

impl SessionHarness {
    pub fn new(seed: u64, sector_count: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            peer: None,
            oracle: SectorOracle::new(SECTOR_SIZE, sector_count),
            client: SocketAddr::from(([192, 168, 1, 10], 4000)),
            next_cmd_id: 0,
            stats: SessionStats::default(),
            shutdown: None,
            handle: None,
        }
    }

    pub fn init(&mut self) {
        let geometry = Geometry::new(SECTOR_SIZE, self.oracle.sector_count());
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(geometry));
        let server = ServerConfig {
            stats_interval_secs: 0,
            ..Default::default()
        };
        let local = SocketAddr::from(([192, 168, 1, 2], udpbd::UDPBD_PORT));
        let (socket, peer) = ChannelSocket::new(local, 64);
        let session = Session::with_socket(device, socket, &server);

        let (tx, rx) = watch::channel(false);
        self.handle = Some(tokio::spawn(session.serve(rx)));
        self.shutdown = Some(tx);
        self.peer = Some(peer);
    }

    fn peer(&mut self) -> &mut ChannelPeer {
        self.peer.as_mut().expect("not initialized")
    }

    fn next_cmd_id(&mut self) -> u8 {
        let id = self.next_cmd_id;
        self.next_cmd_id = (id + 1) & CMD_ID_MAX;
        id
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
        }
        Ok(())
    }

    /// Request shutdown and wait for the session to exit.
    pub async fn shutdown(&mut self) -> Result<(), SimulationError> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(true);
        }
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.await {
            Ok(Ok(SessionEnd::Shutdown)) => Ok(()),
            Ok(other) => Err(SimulationError::Unexpected(format!(
                "session ended with {:?}",
                other
            ))),
            Err(e) => Err(SimulationError::Unexpected(e.to_string())),
        }
    }

    fn sample_range(&mut self) -> (u32, u16) {
        let sector_count = self.oracle.sector_count();
        let count = self.rng.random_range(1..=MAX_SECTORS.min(sector_count));
        let start = self.rng.random_range(0..=sector_count - count);
        (start as u32, count as u16)
    }

    fn sample_out_of_range(&mut self) -> (u32, u16) {
        let sector_count = self.oracle.sector_count();
        let count = self.rng.random_range(1..=MAX_SECTORS);
        let first_bad = (sector_count + 1).saturating_sub(count);
        let start = self.rng.random_range(first_bad..=sector_count + 8);
        (start as u32, count as u16)
    }

    fn sample_data(&mut self, count: u16) -> Vec<u8> {
        (0..count as usize * SECTOR_SIZE as usize)
            .map(|_| self.rng.random())
            .collect()
    }

    fn sample_malformed(&mut self) -> Vec<u8> {
        match self.rng.random_range(0..4) {
            // Shorter than a header
            0 => (0..self.rng.random_range(0..2)).map(|_| self.rng.random()).collect(),
            // Truncated READ or WRITE request
            1 => {
                let command = if self.rng.random() {
                    Command::Read
                } else {
                    Command::Write
                };
                let header = Header::new(command, self.rng.random(), 0);
                let mut datagram = header.to_bytes().to_vec();
                let extra = self.rng.random_range(0..RwRequest::SIZE_BYTES - Header::SIZE_BYTES);
                datagram.extend((0..extra).map(|_| self.rng.random::<u8>()));
                datagram
            }
            // Command number outside the protocol
            2 => {
                let command: u16 = self.rng.random_range(7..32);
                let rest: u16 = self.rng.random::<u16>() & !0x1F;
                let mut datagram = (command | rest).to_le_bytes().to_vec();
                let extra = self.rng.random_range(0..16);
                datagram.extend((0..extra).map(|_| self.rng.random::<u8>()));
                datagram
            }
            // Reply-only command sent to the server
            _ => Message::Info(Header::new(Command::InfoReply, 0, 0))
                .encode()
                .to_vec(),
        }
    }

    fn sample_action(&mut self) -> SessionAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..5 => SessionAction::Info,
            5..45 => {
                let (start, count) = self.sample_range();
                SessionAction::Read { start, count }
            }
            45..80 => {
                let (start, count) = self.sample_range();
                let data = self.sample_data(count);
                SessionAction::Write { start, data }
            }
            80..85 => {
                let (start, count) = self.sample_out_of_range();
                SessionAction::OutOfRangeRead { start, count }
            }
            85..90 => {
                let (start, count) = self.sample_out_of_range();
                SessionAction::OutOfRangeWrite { start, count }
            }
            90..95 => {
                let (start, count) = self.sample_range();
                let data = self.sample_data(count);
                let total = TransferPlan::new(data.len()).map_or(1, |p| p.chunk_count());
                let packets = self.rng.random_range(0..total);
                SessionAction::AbandonedWrite {
                    start,
                    data,
                    packets,
                }
            }
            _ => SessionAction::Malformed {
                datagram: self.sample_malformed(),
            },
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: SessionAction) -> Result<(), SimulationError> {
        match action {
            SessionAction::Info => {
                self.stats.infos += 1;
                self.probe().await?;
            }
            SessionAction::Read { start, count } => {
                self.stats.reads += 1;
                let actual = self.read(start, count).await?;
                let expected = self.oracle.read(start as u64, count as u64);
                if actual.as_slice() != expected {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(start={}, count={}): first diff at byte {}",
                            start,
                            count,
                            find_diff(expected, &actual)
                        ),
                    });
                }
            }
            SessionAction::Write { start, data } => {
                self.stats.writes += 1;
                let result = self.write(start, &data).await?;
                if result != UDPBD_OK {
                    return Err(SimulationError::Mismatch {
                        context: format!("write(start={}) returned {}", start, result),
                    });
                }
                self.oracle.write(start as u64, &data);
            }
            SessionAction::OutOfRangeRead { start, count } => {
                self.stats.rejected += 1;
                let cmd_id = self.next_cmd_id();
                self.send(Message::Read(RwRequest {
                    header: Header::new(Command::Read, cmd_id, 0),
                    sector: start,
                    sector_count: count,
                }))
                .await?;
                self.expect_silence().await?;
            }
            SessionAction::OutOfRangeWrite { start, count } => {
                self.stats.rejected += 1;
                let data = vec![0xEE; count as usize * SECTOR_SIZE as usize];
                let result = self.write(start, &data).await?;
                if result != UDPBD_ENOSPC {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "write(start={}, count={}) past end returned {}",
                            start, count, result
                        ),
                    });
                }
            }
            SessionAction::AbandonedWrite {
                start,
                data,
                packets,
            } => {
                self.stats.abandoned += 1;
                let cmd_id = self.next_cmd_id();
                self.send_write(cmd_id, start, &data, Some(packets)).await?;
                self.expect_silence().await?;
            }
            SessionAction::Malformed { datagram } => {
                self.stats.malformed += 1;
                self.send_raw(Bytes::from(datagram)).await?;
                self.expect_silence().await?;
            }
        }
        Ok(())
    }

    async fn send(&mut self, message: Message) -> Result<(), SimulationError> {
        self.send_raw(message.encode()).await
    }

    async fn send_raw(&mut self, datagram: Bytes) -> Result<(), SimulationError> {
        let client = self.client;
        self.stats.datagrams_sent += 1;
        self.peer()
            .send(datagram, client)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))
    }

    async fn recv(&mut self) -> Result<Message, SimulationError> {
        let client = self.client;
        let received = tokio::time::timeout(REPLY_TIMEOUT, self.peer().recv())
            .await
            .map_err(|_| SimulationError::Unexpected("timed out waiting for reply".into()))?;
        let Some((datagram, to)) = received else {
            return Err(SimulationError::Unexpected("session closed".into()));
        };
        self.stats.datagrams_received += 1;
        if to != client {
            return Err(SimulationError::Mismatch {
                context: format!("reply sent to {} instead of {}", to, client),
            });
        }
        Message::decode(&datagram).map_err(|e| SimulationError::Mismatch {
            context: format!("undecodable reply: {}", e),
        })
    }

    /// Send INFO and require its reply to be the next datagram.
    async fn probe(&mut self) -> Result<(), SimulationError> {
        let cmd_id = self.next_cmd_id();
        self.send(Message::Info(Header::new(Command::Info, cmd_id, 0)))
            .await?;
        match self.recv().await? {
            Message::InfoReply(reply)
                if reply.header.cmd_id == cmd_id
                    && reply.sector_size == SECTOR_SIZE
                    && reply.sector_count as u64 == self.oracle.sector_count() =>
            {
                Ok(())
            }
            other => Err(SimulationError::Mismatch {
                context: format!("expected INFO_REPLY for cmd_id {}, got {:?}", cmd_id, other),
            }),
        }
    }

    /// The previous request must not have produced any reply.
    async fn expect_silence(&mut self) -> Result<(), SimulationError> {
        self.probe().await
    }

    async fn read(&mut self, start: u32, count: u16) -> Result<Vec<u8>, SimulationError> {
        let cmd_id = self.next_cmd_id();
        self.send(Message::Read(RwRequest {
            header: Header::new(Command::Read, cmd_id, 0),
            sector: start,
            sector_count: count,
        }))
        .await?;

        let expected_len = count as usize * SECTOR_SIZE as usize;
        let packets = TransferPlan::new(expected_len)
            .map_err(unexpected)?
            .chunk_count();
        let mut data = Vec::with_capacity(expected_len);
        for i in 0..packets {
            match self.recv().await? {
                Message::ReadRdma(packet)
                    if packet.header.cmd_id == cmd_id
                        && packet.header.cmd_pkt == (i + 1) as u8 =>
                {
                    data.extend_from_slice(&packet.data);
                }
                other => {
                    return Err(SimulationError::Mismatch {
                        context: format!(
                            "read(start={}, count={}): packet {} was {:?}",
                            start, count, i, other
                        ),
                    });
                }
            }
        }
        Ok(data)
    }

    /// Write `data` and return the WRITE_DONE result code.
    async fn write(&mut self, start: u32, data: &[u8]) -> Result<u32, SimulationError> {
        let cmd_id = self.next_cmd_id();
        let done_pkt = self.send_write(cmd_id, start, data, None).await?;
        match self.recv().await? {
            Message::WriteDone(done)
                if done.header.cmd_id == cmd_id && done.header.cmd_pkt == done_pkt =>
            {
                Ok(done.result)
            }
            other => Err(SimulationError::Mismatch {
                context: format!("write(start={}): expected WRITE_DONE, got {:?}", start, other),
            }),
        }
    }

    /// Send WRITE and up to `limit` payload packets. Returns the `cmd_pkt`
    /// the completion should carry.
    async fn send_write(
        &mut self,
        cmd_id: u8,
        start: u32,
        data: &[u8],
        limit: Option<usize>,
    ) -> Result<u8, SimulationError> {
        let count = (data.len() / SECTOR_SIZE as usize) as u16;
        self.send(Message::Write(RwRequest {
            header: Header::new(Command::Write, cmd_id, 0),
            sector: start,
            sector_count: count,
        }))
        .await?;

        let plan = TransferPlan::new(data.len()).map_err(unexpected)?;
        let mut last_pkt = 0u8;
        for chunk in plan.chunks().take(limit.unwrap_or(usize::MAX)) {
            last_pkt = (chunk.index + 1) as u8;
            let packet = RdmaPacket {
                header: Header::new(Command::WriteRdma, cmd_id, last_pkt),
                block_type: chunk.block_type,
                data: Bytes::copy_from_slice(&data[chunk.offset..chunk.offset + chunk.len]),
            };
            self.send(Message::WriteRdma(packet)).await?;
        }
        Ok(last_pkt.wrapping_add(1))
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }
}

fn unexpected(e: UdpbdError) -> SimulationError {
    SimulationError::Unexpected(e.to_string())
}
