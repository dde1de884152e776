//! In-memory device for testing and demos.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{BlockDevice, DeviceResult, check_write};
use crate::error::DeviceError;
use crate::types::Geometry;

pub struct MemoryDevice {
    geometry: Geometry,
    read_only: bool,
    data: RwLock<Vec<u8>>,
    closed: AtomicBool,
}

impl MemoryDevice {
    /// Zero-filled device of the given geometry.
    pub fn new(geometry: Geometry) -> Self {
        let len = geometry.size_bytes() as usize;
        Self::with_contents(geometry.sector_size, vec![0u8; len])
    }

    /// Device initialized from `contents`; a trailing partial sector is dropped.
    pub fn with_contents(sector_size: u32, mut contents: Vec<u8>) -> Self {
        let geometry = Geometry::from_size_bytes(sector_size, contents.len() as u64);
        contents.truncate(geometry.size_bytes() as usize);
        Self {
            geometry,
            read_only: false,
            data: RwLock::new(contents),
            closed: AtomicBool::new(false),
        }
    }

    pub fn into_read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Copy of the whole device contents.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    fn ensure_open(&self) -> DeviceResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockDevice for MemoryDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes> {
        self.ensure_open()?;
        let range = self.geometry.check_range(start, count)?;
        let offset = range.offset_bytes(self.geometry.sector_size) as usize;
        let len = range.len_bytes(self.geometry.sector_size);
        let data = self.data.read();
        Ok(Bytes::copy_from_slice(&data[offset..offset + len]))
    }

    async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()> {
        self.ensure_open()?;
        let range = check_write(self.geometry, self.read_only, start, count, data.len())?;
        let offset = range.offset_bytes(self.geometry.sector_size) as usize;
        self.data.write()[offset..offset + data.len()].copy_from_slice(&data);
        Ok(())
    }

    async fn close(&self) -> DeviceResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    async fn is_available(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }
}
