//! Write payload assembly across WRITE_RDMA packets.

use bytes::{Bytes, BytesMut};

use crate::error::DeviceError;

/// Progress of absorbing one packet into a pending write.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Progress {
    /// More payload expected.
    Incomplete,
    /// Declared length reached.
    Complete,
    /// Packet would exceed the declared length.
    Overrun { expected: usize, actual: usize },
    /// Packet number already absorbed; ignored.
    Duplicate { expected: u8, actual: u8 },
}

/// Packets at most this far behind the next expected `cmd_pkt` are duplicates;
/// anything else that does not match is ahead of it.
const DUPLICATE_WINDOW: u8 = 128;

/// A WRITE whose payload is still arriving.
///
/// Packets must arrive as `cmd_pkt = n+1, n+2, ...` where `n` is the WRITE's own
/// `cmd_pkt`. A repeated packet is ignored. A skipped one fails the write with
/// `OutOfOrder`: the remaining payload is still counted so the completion
/// arrives where the peer expects it, but nothing reaches the device.
///
/// Writes rejected up front (read-only, out of range) likewise absorb their
/// payload so the completion can report the failure, but keep no data.
#[derive(Debug)]
pub(crate) struct PendingWrite {
    pub cmd_id: u8,
    pub start: u64,
    pub count: u64,
    expected_len: usize,
    received: usize,
    buf: BytesMut,
    next_pkt: u8,
    last_pkt: u8,
    out_of_order: bool,
    rejection: Option<DeviceError>,
}

impl PendingWrite {
    pub fn new(cmd_id: u8, cmd_pkt: u8, start: u64, count: u64, expected_len: usize) -> Self {
        Self {
            cmd_id,
            start,
            count,
            expected_len,
            received: 0,
            buf: BytesMut::new(),
            next_pkt: cmd_pkt.wrapping_add(1),
            last_pkt: cmd_pkt,
            out_of_order: false,
            rejection: None,
        }
    }

    pub fn rejected(
        cmd_id: u8,
        cmd_pkt: u8,
        start: u64,
        count: u64,
        expected_len: usize,
        rejection: DeviceError,
    ) -> Self {
        Self {
            rejection: Some(rejection),
            ..Self::new(cmd_id, cmd_pkt, start, count, expected_len)
        }
    }

    pub fn expected_len(&self) -> usize {
        self.expected_len
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.expected_len
    }

    /// `cmd_pkt` for the WRITE_DONE reply: one past the last packet seen.
    pub fn done_pkt(&self) -> u8 {
        self.last_pkt.wrapping_add(1)
    }

    pub fn absorb(&mut self, cmd_pkt: u8, data: &[u8]) -> Progress {
        let in_order = cmd_pkt == self.next_pkt;
        if !in_order && !self.out_of_order {
            let behind = self.next_pkt.wrapping_sub(cmd_pkt);
            if behind <= DUPLICATE_WINDOW {
                return Progress::Duplicate {
                    expected: self.next_pkt,
                    actual: cmd_pkt,
                };
            }
        }

        let actual = self.received + data.len();
        if actual > self.expected_len {
            return Progress::Overrun {
                expected: self.expected_len,
                actual,
            };
        }

        if !in_order && !self.out_of_order {
            self.out_of_order = true;
            if self.rejection.is_none() {
                self.rejection = Some(DeviceError::OutOfOrder {
                    expected: self.next_pkt,
                    actual: cmd_pkt,
                });
                self.buf = BytesMut::new();
            }
        }
        if self.rejection.is_none() {
            if self.buf.is_empty() {
                self.buf.reserve(self.expected_len);
            }
            self.buf.extend_from_slice(data);
        }
        self.received = actual;

        // Once failed, packet numbers only steer the completion's cmd_pkt.
        if in_order || cmd_pkt.wrapping_sub(self.last_pkt) < DUPLICATE_WINDOW {
            self.last_pkt = cmd_pkt;
            self.next_pkt = cmd_pkt.wrapping_add(1);
        }

        if self.is_complete() {
            Progress::Complete
        } else {
            Progress::Incomplete
        }
    }

    /// Split a complete write into its payload, or the reason it was refused.
    pub fn finish(self) -> Result<Bytes, DeviceError> {
        match self.rejection {
            Some(err) => Err(err),
            None => Ok(self.buf.freeze()),
        }
    }
}
