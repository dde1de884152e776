//! Transfer planning: how a byte range is split into RDMA packets.
//!
//! Both directions use the same rule. Candidate block sizes are 32, 128, 256
//! and 512 bytes; the largest one whose packet count equals the minimum packet
//! count wins, so large blocks are used whenever they cost no extra datagrams.

use crate::protocol::{BlockType, RDMA_MAX_PAYLOAD, UdpbdError};

/// Smallest block shift (32-byte blocks), which always yields the fewest packets.
const MIN_BLOCK_SHIFT: u8 = 3;

/// Larger block shifts in order of preference (512, 256, 128 bytes).
const PREFERRED_BLOCK_SHIFTS: [u8; 3] = [7, 6, 5];

#[inline]
fn block_size(block_shift: u8) -> usize {
    1 << (block_shift as usize + 2)
}

/// Blocks of the given shift that fit in one packet.
#[inline]
pub fn blocks_per_packet(block_shift: u8) -> usize {
    RDMA_MAX_PAYLOAD / block_size(block_shift)
}

/// Data bytes one full packet carries with the given shift.
#[inline]
pub fn packet_capacity(block_shift: u8) -> usize {
    blocks_per_packet(block_shift) * block_size(block_shift)
}

fn packet_count(len: usize, block_shift: u8) -> usize {
    len.div_ceil(packet_capacity(block_shift))
}

/// Choose the block shift for a transfer of `len` bytes.
///
/// Only block sizes dividing `len` are considered; returns `None` when even
/// 32-byte blocks do not.
pub fn block_shift_for(len: usize) -> Option<u8> {
    if len % block_size(MIN_BLOCK_SHIFT) != 0 {
        return None;
    }
    let min_packets = packet_count(len, MIN_BLOCK_SHIFT);
    let shift = PREFERRED_BLOCK_SHIFTS
        .into_iter()
        .find(|&shift| {
            len % block_size(shift) == 0 && packet_count(len, shift) == min_packets
        })
        .unwrap_or(MIN_BLOCK_SHIFT);
    Some(shift)
}

/// One packet of a planned transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    /// Zero-based position of the packet in the transfer.
    pub index: usize,
    /// Byte offset of the packet's data within the transfer.
    pub offset: usize,
    pub len: usize,
    pub block_type: BlockType,
}

/// Packet layout of one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    total_len: usize,
    block_shift: u8,
}

impl TransferPlan {
    pub fn new(total_len: usize) -> Result<Self, UdpbdError> {
        let block_shift = block_shift_for(total_len).ok_or(UdpbdError::UnalignedTransfer {
            len: total_len,
            unit: block_size(MIN_BLOCK_SHIFT),
        })?;
        Ok(Self {
            total_len,
            block_shift,
        })
    }

    pub fn total_len(&self) -> usize {
        self.total_len
    }

    pub fn block_shift(&self) -> u8 {
        self.block_shift
    }

    pub fn block_size(&self) -> usize {
        block_size(self.block_shift)
    }

    /// Data bytes carried by every packet except possibly the last.
    pub fn chunk_capacity(&self) -> usize {
        packet_capacity(self.block_shift)
    }

    pub fn chunk_count(&self) -> usize {
        packet_count(self.total_len, self.block_shift)
    }

    pub fn chunks(&self) -> impl Iterator<Item = ChunkSpec> + '_ {
        let capacity = self.chunk_capacity();
        let block_size = self.block_size();
        (0..self.chunk_count()).map(move |index| {
            let offset = index * capacity;
            let len = capacity.min(self.total_len - offset);
            ChunkSpec {
                index,
                offset,
                len,
                block_type: BlockType::new(self.block_shift, (len / block_size) as u16),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_capacities() {
        assert_eq!(packet_capacity(3), 1440);
        assert_eq!(packet_capacity(5), 1408);
        assert_eq!(packet_capacity(6), 1280);
        assert_eq!(packet_capacity(7), 1024);
        assert_eq!(blocks_per_packet(7), 2);
        assert_eq!(blocks_per_packet(3), 45);
    }

    #[test]
    fn single_sector_uses_512_byte_blocks() {
        assert_eq!(block_shift_for(512), Some(7));
        assert_eq!(block_shift_for(1024), Some(7));
    }

    #[test]
    fn shift_choice_minimizes_packets() {
        // 3 sectors: 1536 bytes fit in 2 packets at any size, so 512 wins.
        assert_eq!(block_shift_for(1536), Some(7));
        // 4 sectors: 2048 bytes, 2 packets at 32/128/256, 2 at 512.
        assert_eq!(block_shift_for(2048), Some(7));
        // 8 sectors: 4096 bytes, 3 packets minimum; 512 needs 4, 256 needs 4, 128 needs 3.
        assert_eq!(block_shift_for(4096), Some(5));
        // 11 sectors: 5632 bytes, 4 packets minimum (1440); 128 needs 4.
        assert_eq!(block_shift_for(5632), Some(5));
    }

    #[test]
    fn unaligned_lengths_rejected() {
        assert_eq!(block_shift_for(100), None);
        assert!(matches!(
            TransferPlan::new(100),
            Err(UdpbdError::UnalignedTransfer { len: 100, unit: 32 })
        ));
    }

    #[test]
    fn chunks_cover_range_in_order() {
        for sectors in 1..=64usize {
            let total = sectors * 512;
            let plan = TransferPlan::new(total).unwrap();
            let chunks: Vec<_> = plan.chunks().collect();
            assert_eq!(chunks.len(), plan.chunk_count());
            assert_eq!(
                chunks.len(),
                total.div_ceil(plan.chunk_capacity()),
                "{sectors} sectors"
            );

            let mut expected_offset = 0;
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i);
                assert_eq!(chunk.offset, expected_offset);
                assert!(chunk.len <= RDMA_MAX_PAYLOAD);
                assert_eq!(chunk.block_type.payload_len(), chunk.len);
                expected_offset += chunk.len;
            }
            assert_eq!(expected_offset, total);
        }
    }

    #[test]
    fn empty_transfer_has_no_chunks() {
        let plan = TransferPlan::new(0).unwrap();
        assert_eq!(plan.chunk_count(), 0);
        assert_eq!(plan.chunks().count(), 0);
    }
}
