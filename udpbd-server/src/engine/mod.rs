//! UDPBD protocol engine.
//!
//! The engine decodes one inbound datagram at a time, validates it against the
//! device, performs the sector I/O and encodes the replies. Its only state
//! across datagrams is the write currently being assembled.
//!
//! Every call returns an explicit [`Outcome`], so "no reply" is a value the
//! transport (and tests) can observe rather than an absence.
//!
//! # Example
//!
//! ```ignore
//! let mut engine = Engine::new(device);
//! match engine.handle(&datagram).await {
//!     Outcome::Replies(replies) => for reply in replies { socket.send_to(&reply, peer).await?; },
//!     Outcome::Pending | Outcome::Dropped(_) => {}
//!     Outcome::DeviceLost(err) => return Err(err),
//! }
//! ```

mod assembly;

use std::sync::Arc;

use bytes::Bytes;
use udpbd::{
    Command, Header, InfoReply, Message, RdmaPacket, RwRequest, TransferPlan, UDPBD_OK,
    UdpbdError, WriteDone,
};

use crate::device::BlockDevice;
use crate::error::DeviceError;
use crate::types::Geometry;

use self::assembly::{PendingWrite, Progress};

/// Delivery guarantee offered by the engine.
///
/// Replies are sent once and never retransmitted. An acknowledged mode would
/// sit above the framing without changing the device backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    FireAndForget,
}

/// Result of handling one datagram.
#[derive(Debug)]
pub enum Outcome {
    /// Reply datagrams, in send order.
    Replies(Vec<Bytes>),
    /// Write payload absorbed; more packets expected.
    Pending,
    /// No reply is sent.
    Dropped(DropReason),
    /// The device went away; the session must end.
    DeviceLost(DeviceError),
}

impl Outcome {
    pub fn replies(&self) -> &[Bytes] {
        match self {
            Self::Replies(replies) => replies,
            _ => &[],
        }
    }
}

/// Why a datagram produced no reply.
#[derive(Debug)]
pub enum DropReason {
    /// Truncated datagram or unknown command.
    Malformed(UdpbdError),
    /// A reply-only command sent to the server.
    UnexpectedCommand(Command),
    /// READ with a sector count of zero.
    EmptyRead,
    /// READ refused by the device (out of range, I/O failure).
    Device(DeviceError),
    /// WRITE_RDMA with no WRITE in progress.
    NoPendingWrite,
    /// WRITE_RDMA whose cmd_id does not match the write in progress.
    CommandMismatch { expected: u8, actual: u8 },
    /// WRITE_RDMA repeating a packet already absorbed.
    DuplicatePacket { expected: u8, actual: u8 },
}

/// One packet of a read reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunk {
    pub index: usize,
    pub total: usize,
    pub packet: RdmaPacket,
}

/// Split `data` into READ_RDMA packets tagged with `cmd_id`.
///
/// Packets are numbered `cmd_pkt = 1, 2, ...` (wrapping); `index` and `total`
/// are not on the wire since the peer knows the requested length.
pub fn read_chunks(cmd_id: u8, data: &Bytes) -> Result<Vec<ReadChunk>, UdpbdError> {
    let plan = TransferPlan::new(data.len())?;
    let total = plan.chunk_count();
    Ok(plan
        .chunks()
        .map(|chunk| ReadChunk {
            index: chunk.index,
            total,
            packet: RdmaPacket {
                header: Header::new(Command::ReadRdma, cmd_id, (chunk.index + 1) as u8),
                block_type: chunk.block_type,
                data: data.slice(chunk.offset..chunk.offset + chunk.len),
            },
        })
        .collect())
}

pub struct Engine {
    device: Arc<dyn BlockDevice>,
    geometry: Geometry,
    pending: Option<PendingWrite>,
}

impl Engine {
    pub const DELIVERY: Delivery = Delivery::FireAndForget;

    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let geometry = device.geometry();
        Self {
            device,
            geometry,
            pending: None,
        }
    }

    pub fn delivery(&self) -> Delivery {
        Self::DELIVERY
    }

    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn has_pending_write(&self) -> bool {
        self.pending.is_some()
    }

    /// Handle one inbound datagram.
    pub async fn handle(&mut self, datagram: &[u8]) -> Outcome {
        let message = match Message::decode(datagram) {
            Ok(message) => message,
            Err(e) => return Outcome::Dropped(DropReason::Malformed(e)),
        };

        match message {
            Message::Info(header) => self.handle_info(header),
            Message::Read(req) => self.handle_read(req).await,
            Message::Write(req) => self.handle_write(req).await,
            Message::WriteRdma(packet) => self.handle_write_rdma(packet).await,
            Message::InfoReply(_) | Message::ReadRdma(_) | Message::WriteDone(_) => {
                Outcome::Dropped(DropReason::UnexpectedCommand(message.header().command))
            }
        }
    }

    fn handle_info(&self, header: Header) -> Outcome {
        let reply = InfoReply {
            header: Header::new(Command::InfoReply, header.cmd_id, 1),
            sector_size: self.geometry.sector_size,
            sector_count: u32::try_from(self.geometry.sector_count).unwrap_or(u32::MAX),
        };
        tracing::debug!(
            sector_size = reply.sector_size,
            sector_count = reply.sector_count,
            "INFO"
        );
        Outcome::Replies(vec![Message::InfoReply(reply).encode()])
    }

    async fn handle_read(&self, req: RwRequest) -> Outcome {
        tracing::debug!(
            sector = req.sector,
            count = req.sector_count,
            cmd_id = req.header.cmd_id,
            "READ"
        );
        if req.sector_count == 0 {
            return Outcome::Dropped(DropReason::EmptyRead);
        }

        let data = match self
            .device
            .read_sectors(req.sector as u64, req.sector_count as u64)
            .await
        {
            Ok(data) => data,
            Err(e) if e.is_fatal() => return Outcome::DeviceLost(e),
            Err(e) => return Outcome::Dropped(DropReason::Device(e)),
        };

        match read_chunks(req.header.cmd_id, &data) {
            Ok(chunks) => Outcome::Replies(
                chunks
                    .into_iter()
                    .map(|chunk| chunk.packet.to_bytes())
                    .collect(),
            ),
            Err(e) => Outcome::Dropped(DropReason::Malformed(e)),
        }
    }

    async fn handle_write(&mut self, req: RwRequest) -> Outcome {
        tracing::debug!(
            sector = req.sector,
            count = req.sector_count,
            cmd_id = req.header.cmd_id,
            "WRITE"
        );
        if let Some(old) = self.pending.take() {
            tracing::warn!(
                cmd_id = old.cmd_id,
                sector = old.start,
                received = old.received(),
                expected = old.expected_len(),
                "Abandoning incomplete write"
            );
        }

        let start = req.sector as u64;
        let count = req.sector_count as u64;
        let expected_len = self.geometry.byte_len(count);
        let cmd_id = req.header.cmd_id;
        let cmd_pkt = req.header.cmd_pkt;

        let pending = match crate::device::check_write(
            self.geometry,
            self.device.is_read_only(),
            start,
            count,
            expected_len,
        ) {
            Ok(_) => PendingWrite::new(cmd_id, cmd_pkt, start, count, expected_len),
            Err(e) => {
                tracing::debug!(error = %e, "Write rejected, absorbing payload");
                PendingWrite::rejected(cmd_id, cmd_pkt, start, count, expected_len, e)
            }
        };

        if pending.is_complete() {
            return self.complete_write(pending).await;
        }
        self.pending = Some(pending);
        Outcome::Pending
    }

    async fn handle_write_rdma(&mut self, packet: RdmaPacket) -> Outcome {
        let Some(pending) = self.pending.as_mut() else {
            return Outcome::Dropped(DropReason::NoPendingWrite);
        };
        if packet.header.cmd_id != pending.cmd_id {
            return Outcome::Dropped(DropReason::CommandMismatch {
                expected: pending.cmd_id,
                actual: packet.header.cmd_id,
            });
        }

        match pending.absorb(packet.header.cmd_pkt, &packet.data) {
            Progress::Incomplete => Outcome::Pending,
            Progress::Duplicate { expected, actual } => {
                tracing::debug!(
                    cmd_id = pending.cmd_id,
                    expected,
                    actual,
                    "Ignoring repeated write packet"
                );
                Outcome::Dropped(DropReason::DuplicatePacket { expected, actual })
            }
            Progress::Complete => match self.pending.take() {
                Some(pending) => self.complete_write(pending).await,
                None => Outcome::Dropped(DropReason::NoPendingWrite),
            },
            Progress::Overrun { expected, actual } => {
                let Some(pending) = self.pending.take() else {
                    return Outcome::Dropped(DropReason::NoPendingWrite);
                };
                tracing::warn!(
                    cmd_id = pending.cmd_id,
                    expected,
                    actual,
                    "Write payload exceeds declared length"
                );
                let err = DeviceError::BadLength {
                    expected_bytes: expected,
                    actual_bytes: actual,
                };
                Self::write_done(pending.cmd_id, packet.header.cmd_pkt.wrapping_add(1), err.code())
            }
        }
    }

    async fn complete_write(&mut self, pending: PendingWrite) -> Outcome {
        let cmd_id = pending.cmd_id;
        let done_pkt = pending.done_pkt();
        let (start, count) = (pending.start, pending.count);

        let result = match pending.finish() {
            Ok(data) if count == 0 => {
                debug_assert!(data.is_empty());
                Ok(())
            }
            Ok(data) => self.device.write_sectors(start, count, data).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => Self::write_done(cmd_id, done_pkt, UDPBD_OK),
            Err(e) if e.is_fatal() => Outcome::DeviceLost(e),
            Err(e) => {
                tracing::debug!(error = %e, sector = start, count, "Write failed");
                Self::write_done(cmd_id, done_pkt, e.code())
            }
        }
    }

    fn write_done(cmd_id: u8, cmd_pkt: u8, result: u32) -> Outcome {
        let done = WriteDone {
            header: Header::new(Command::WriteDone, cmd_id, cmd_pkt),
            result,
        };
        Outcome::Replies(vec![Message::WriteDone(done).encode()])
    }
}
