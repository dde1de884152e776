//! Core types for udpbd-server.

use crate::error::DeviceError;

/// Default sector size in bytes.
pub const SECTOR_SIZE: u32 = 512;

pub const MIN_SECTOR_SIZE: u32 = 512;
pub const MAX_SECTOR_SIZE: u32 = 4096;

const _: () = {
    assert!(SECTOR_SIZE >= MIN_SECTOR_SIZE);
    assert!(SECTOR_SIZE.is_power_of_two());
    assert!(MAX_SECTOR_SIZE.is_power_of_two());
};

/// True for sector sizes a device may be configured with.
#[inline]
pub fn is_valid_sector_size(size: u32) -> bool {
    size.is_power_of_two() && (MIN_SECTOR_SIZE..=MAX_SECTOR_SIZE).contains(&size)
}

/// Fixed geometry of an open device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub sector_size: u32,
    pub sector_count: u64,
}

impl Geometry {
    pub fn new(sector_size: u32, sector_count: u64) -> Self {
        Self {
            sector_size,
            sector_count,
        }
    }

    /// Geometry of a device of `size_bytes`. A trailing partial sector is not addressable.
    pub fn from_size_bytes(sector_size: u32, size_bytes: u64) -> Self {
        Self::new(sector_size, size_bytes / sector_size as u64)
    }

    #[inline]
    pub fn size_bytes(&self) -> u64 {
        self.sector_count * self.sector_size as u64
    }

    /// Validate `[start, start + count)` against the device bounds.
    pub fn check_range(&self, start: u64, count: u64) -> Result<SectorRange, DeviceError> {
        match start.checked_add(count) {
            Some(end) if end <= self.sector_count => Ok(SectorRange { start, count }),
            _ => Err(DeviceError::OutOfRange {
                start,
                count,
                sector_count: self.sector_count,
            }),
        }
    }

    /// Byte length of `count` sectors.
    #[inline]
    pub fn byte_len(&self, count: u64) -> usize {
        (count * self.sector_size as u64) as usize
    }
}

/// A bounds-checked range of sectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorRange {
    pub start: u64,
    pub count: u64,
}

impl SectorRange {
    #[inline]
    pub fn offset_bytes(&self, sector_size: u32) -> u64 {
        self.start * sector_size as u64
    }

    #[inline]
    pub fn len_bytes(&self, sector_size: u32) -> usize {
        (self.count * sector_size as u64) as usize
    }
}
