//! UDPBD protocol constants and message types.
//!
//! Layout follows the udpbd-server reference implementation used by the PS2
//! client (https://github.com/israpps/udpbd-server). All multi-byte fields are
//! little-endian and every message fits in a single datagram.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Default server port (0xBDBD).
pub const UDPBD_PORT: u16 = 0xBDBD;

/// Port the appliance broadcasts plain-text debug messages on.
pub const UDPBD_LOG_PORT: u16 = 18194;

/// Maximum data bytes carried by one RDMA packet.
pub const RDMA_MAX_PAYLOAD: usize = 1466;

/// Largest datagram either side sends (header + block type + data).
pub const MAX_DATAGRAM_SIZE: usize = Header::SIZE_BYTES + BlockType::SIZE_BYTES + RDMA_MAX_PAYLOAD;

// Commands
pub const UDPBD_CMD_INFO: u8 = 0x00;
pub const UDPBD_CMD_INFO_REPLY: u8 = 0x01;
pub const UDPBD_CMD_READ: u8 = 0x02;
pub const UDPBD_CMD_READ_RDMA: u8 = 0x03;
pub const UDPBD_CMD_WRITE: u8 = 0x04;
pub const UDPBD_CMD_WRITE_RDMA: u8 = 0x05;
pub const UDPBD_CMD_WRITE_DONE: u8 = 0x06;

// WRITE_DONE result codes
pub const UDPBD_OK: u32 = 0;
pub const UDPBD_EPERM: u32 = 1;
pub const UDPBD_EIO: u32 = 5;
pub const UDPBD_EINVAL: u32 = 22;
pub const UDPBD_ENOSPC: u32 = 28;

// Header bit fields
const CMD_MASK: u16 = 0b0000_0000_0001_1111;
const CMD_ID_MASK: u16 = 0b0000_0000_1110_0000;
const CMD_ID_SHIFT: u16 = 5;
const CMD_PKT_MASK: u16 = 0b1111_1111_0000_0000;
const CMD_PKT_SHIFT: u16 = 8;

/// Largest value of the 3-bit command id.
pub const CMD_ID_MAX: u8 = 0b111;

// Block type bit fields
const BLOCK_SHIFT_MASK: u32 = 0b0000_0000_0000_0000_0000_0000_0000_1111;
const BLOCK_COUNT_MASK: u32 = 0b0000_0000_0000_0000_0001_1111_1111_0000;
const BLOCK_COUNT_SHIFT: u32 = 4;
const SPARE_MASK: u32 = 0b1111_1111_1111_1111_1110_0000_0000_0000;
const SPARE_SHIFT: u32 = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info,
    InfoReply,
    Read,
    ReadRdma,
    Write,
    WriteRdma,
    WriteDone,
}

impl Command {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            UDPBD_CMD_INFO => Some(Self::Info),
            UDPBD_CMD_INFO_REPLY => Some(Self::InfoReply),
            UDPBD_CMD_READ => Some(Self::Read),
            UDPBD_CMD_READ_RDMA => Some(Self::ReadRdma),
            UDPBD_CMD_WRITE => Some(Self::Write),
            UDPBD_CMD_WRITE_RDMA => Some(Self::WriteRdma),
            UDPBD_CMD_WRITE_DONE => Some(Self::WriteDone),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            Self::Info => UDPBD_CMD_INFO,
            Self::InfoReply => UDPBD_CMD_INFO_REPLY,
            Self::Read => UDPBD_CMD_READ,
            Self::ReadRdma => UDPBD_CMD_READ_RDMA,
            Self::Write => UDPBD_CMD_WRITE,
            Self::WriteRdma => UDPBD_CMD_WRITE_RDMA,
            Self::WriteDone => UDPBD_CMD_WRITE_DONE,
        }
    }

    /// True for commands the client sends to the server.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Info | Self::Read | Self::Write | Self::WriteRdma
        )
    }
}

/// UDPBD protocol errors.
#[derive(Debug, Error)]
pub enum UdpbdError {
    #[error("truncated datagram: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("unknown command: {command}")]
    UnknownCommand { command: u8 },

    #[error("unsupported block size: {size} bytes")]
    UnsupportedBlockSize { size: usize },

    #[error("payload too large: {length_bytes} bytes (max: {max_bytes})")]
    PayloadTooLarge {
        length_bytes: usize,
        max_bytes: usize,
    },

    #[error("transfer of {len} bytes is not a multiple of {unit} bytes")]
    UnalignedTransfer { len: usize, unit: usize },

    #[error("transfer of {count} sectors exceeds the 16-bit sector count")]
    TooManySectors { count: usize },

    #[error("packet out of order: expected {expected}, got {actual}")]
    OutOfOrder { expected: u8, actual: u8 },

    #[error("timed out waiting for {waiting_for}")]
    Timeout { waiting_for: &'static str },

    #[error("server error: {code}")]
    ServerError { code: u32 },

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

fn ensure_len(buf: &[u8], expected: usize) -> Result<(), UdpbdError> {
    if buf.len() < expected {
        return Err(UdpbdError::Truncated {
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

/// Packet header (2 bytes on wire).
///
/// `cmd_id` tags every packet of one command (3 bits); `cmd_pkt` numbers the
/// packets within it (8 bits, wrapping).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub command: Command,
    pub cmd_id: u8,
    pub cmd_pkt: u8,
}

impl Header {
    pub const SIZE_BYTES: usize = 2;

    pub fn new(command: Command, cmd_id: u8, cmd_pkt: u8) -> Self {
        Self {
            command,
            cmd_id: cmd_id & CMD_ID_MAX,
            cmd_pkt,
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let cmd = self.command.to_u8() as u16 & CMD_MASK;
        let cmd_id = ((self.cmd_id as u16) << CMD_ID_SHIFT) & CMD_ID_MASK;
        let cmd_pkt = ((self.cmd_pkt as u16) << CMD_PKT_SHIFT) & CMD_PKT_MASK;
        (cmd | cmd_id | cmd_pkt).to_le_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let v = u16::from_le_bytes([buf[0], buf[1]]);
        let cmd = (v & CMD_MASK) as u8;
        let command = Command::from_u8(cmd).ok_or(UdpbdError::UnknownCommand { command: cmd })?;
        Ok(Self {
            command,
            cmd_id: ((v & CMD_ID_MASK) >> CMD_ID_SHIFT) as u8,
            cmd_pkt: ((v & CMD_PKT_MASK) >> CMD_PKT_SHIFT) as u8,
        })
    }
}

/// Block layout of an RDMA packet (4 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockType {
    /// Block size is `1 << (block_shift + 2)` bytes.
    pub block_shift: u8,
    /// Number of blocks in the packet (9 bits).
    pub block_count: u16,
    pub spare: u32,
}

impl BlockType {
    pub const SIZE_BYTES: usize = 4;

    /// Largest value of the 9-bit block count.
    pub const MAX_BLOCK_COUNT: u16 = 0x1FF;

    pub fn new(block_shift: u8, block_count: u16) -> Self {
        Self {
            block_shift,
            block_count,
            spare: 0,
        }
    }

    /// Build a block type for an explicit block size in bytes.
    pub fn for_block_size(block_size: usize, block_count: u16) -> Result<Self, UdpbdError> {
        (0u8..8)
            .find(|shift| 1usize << (shift + 2) == block_size)
            .map(|shift| Self::new(shift, block_count))
            .ok_or(UdpbdError::UnsupportedBlockSize { size: block_size })
    }

    #[inline]
    pub fn block_size(self) -> usize {
        1 << (self.block_shift as usize + 2)
    }

    /// Data bytes described by this block type.
    #[inline]
    pub fn payload_len(self) -> usize {
        self.block_count as usize * self.block_size()
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let shift = self.block_shift as u32 & BLOCK_SHIFT_MASK;
        let count = ((self.block_count as u32) << BLOCK_COUNT_SHIFT) & BLOCK_COUNT_MASK;
        let spare = (self.spare << SPARE_SHIFT) & SPARE_MASK;
        (shift | count | spare).to_le_bytes()
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        let v = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        Ok(Self {
            block_shift: (v & BLOCK_SHIFT_MASK) as u8,
            block_count: ((v & BLOCK_COUNT_MASK) >> BLOCK_COUNT_SHIFT) as u16,
            spare: (v & SPARE_MASK) >> SPARE_SHIFT,
        })
    }
}

/// Device geometry reply (10 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InfoReply {
    pub header: Header,
    pub sector_size: u32,
    pub sector_count: u32,
}

impl InfoReply {
    pub const SIZE_BYTES: usize = 10;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&self.header.to_bytes());
        buf[2..6].copy_from_slice(&self.sector_size.to_le_bytes());
        buf[6..10].copy_from_slice(&self.sector_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        Ok(Self {
            header: Header::from_bytes(buf)?,
            sector_size: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            sector_count: u32::from_le_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }
}

/// READ or WRITE request (8 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwRequest {
    pub header: Header,
    /// First sector of the transfer.
    pub sector: u32,
    pub sector_count: u16,
}

impl RwRequest {
    pub const SIZE_BYTES: usize = 8;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&self.header.to_bytes());
        buf[2..6].copy_from_slice(&self.sector.to_le_bytes());
        buf[6..8].copy_from_slice(&self.sector_count.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        Ok(Self {
            header: Header::from_bytes(buf)?,
            sector: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            sector_count: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// Write completion (6 bytes on wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteDone {
    pub header: Header,
    /// `UDPBD_OK` on success, an errno-style code otherwise.
    pub result: u32,
}

impl WriteDone {
    pub const SIZE_BYTES: usize = 6;

    pub fn to_bytes(&self) -> [u8; Self::SIZE_BYTES] {
        let mut buf = [0u8; Self::SIZE_BYTES];
        buf[0..2].copy_from_slice(&self.header.to_bytes());
        buf[2..6].copy_from_slice(&self.result.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::SIZE_BYTES)?;
        Ok(Self {
            header: Header::from_bytes(buf)?,
            result: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
        })
    }
}

/// Data-carrying packet used for both READ_RDMA and WRITE_RDMA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdmaPacket {
    pub header: Header,
    pub block_type: BlockType,
    pub data: Bytes,
}

impl RdmaPacket {
    pub const HEADER_BYTES: usize = Header::SIZE_BYTES + BlockType::SIZE_BYTES;

    pub fn encoded_len(&self) -> usize {
        Self::HEADER_BYTES + self.data.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_slice(&self.header.to_bytes());
        buf.put_slice(&self.block_type.to_bytes());
        buf.put_slice(&self.data);
        buf.freeze()
    }

    /// Parse an RDMA packet, taking exactly the data bytes its block type
    /// declares. Trailing bytes beyond that are ignored.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, UdpbdError> {
        ensure_len(buf, Self::HEADER_BYTES)?;
        let header = Header::from_bytes(buf)?;
        let block_type = BlockType::from_bytes(&buf[Header::SIZE_BYTES..])?;

        let length = block_type.payload_len();
        if length > RDMA_MAX_PAYLOAD {
            return Err(UdpbdError::PayloadTooLarge {
                length_bytes: length,
                max_bytes: RDMA_MAX_PAYLOAD,
            });
        }
        ensure_len(buf, Self::HEADER_BYTES + length)?;

        Ok(Self {
            header,
            block_type,
            data: Bytes::copy_from_slice(&buf[Self::HEADER_BYTES..Self::HEADER_BYTES + length]),
        })
    }
}

/// Any UDPBD datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Info(Header),
    InfoReply(InfoReply),
    Read(RwRequest),
    ReadRdma(RdmaPacket),
    Write(RwRequest),
    WriteRdma(RdmaPacket),
    WriteDone(WriteDone),
}

impl Message {
    /// Decode one datagram. The header's command selects the body layout.
    pub fn decode(buf: &[u8]) -> Result<Self, UdpbdError> {
        let header = Header::from_bytes(buf)?;
        let message = match header.command {
            Command::Info => Self::Info(header),
            Command::InfoReply => Self::InfoReply(InfoReply::from_bytes(buf)?),
            Command::Read => Self::Read(RwRequest::from_bytes(buf)?),
            Command::ReadRdma => Self::ReadRdma(RdmaPacket::from_bytes(buf)?),
            Command::Write => Self::Write(RwRequest::from_bytes(buf)?),
            Command::WriteRdma => Self::WriteRdma(RdmaPacket::from_bytes(buf)?),
            Command::WriteDone => Self::WriteDone(WriteDone::from_bytes(buf)?),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Info(header) => Bytes::copy_from_slice(&header.to_bytes()),
            Self::InfoReply(reply) => Bytes::copy_from_slice(&reply.to_bytes()),
            Self::Read(req) | Self::Write(req) => Bytes::copy_from_slice(&req.to_bytes()),
            Self::ReadRdma(packet) | Self::WriteRdma(packet) => packet.to_bytes(),
            Self::WriteDone(done) => Bytes::copy_from_slice(&done.to_bytes()),
        }
    }

    pub fn header(&self) -> Header {
        match self {
            Self::Info(header) => *header,
            Self::InfoReply(reply) => reply.header,
            Self::Read(req) | Self::Write(req) => req.header,
            Self::ReadRdma(packet) | Self::WriteRdma(packet) => packet.header,
            Self::WriteDone(done) => done.header,
        }
    }
}

const _: () = {
    assert!(MAX_DATAGRAM_SIZE == 1472);
    assert!(InfoReply::SIZE_BYTES == Header::SIZE_BYTES + 8);
    assert!(RwRequest::SIZE_BYTES == Header::SIZE_BYTES + 6);
    assert!(WriteDone::SIZE_BYTES == Header::SIZE_BYTES + 4);
};
