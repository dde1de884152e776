//! Counting middleware for block devices.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use super::IoStats;
use crate::device::{BlockDevice, DeviceResult};
use crate::types::Geometry;

/// Counting middleware that wraps a device and tallies every operation.
///
/// # Example
///
/// ```ignore
/// let stats = Arc::new(IoStats::new());
/// let device = CountingDevice::new(FileDevice::open(path, options).await?, stats.clone());
/// let engine = Engine::new(Arc::new(device));
/// ```
pub struct CountingDevice<D> {
    inner: D,
    stats: Arc<IoStats>,
}

impl<D> CountingDevice<D> {
    pub fn new(inner: D, stats: Arc<IoStats>) -> Self {
        Self { inner, stats }
    }

    pub fn stats(&self) -> &Arc<IoStats> {
        &self.stats
    }
}

#[async_trait]
impl<D: BlockDevice> BlockDevice for CountingDevice<D> {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn is_read_only(&self) -> bool {
        self.inner.is_read_only()
    }

    async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes> {
        let result = self.inner.read_sectors(start, count).await;
        match &result {
            Ok(data) => self.stats.record_read(data.len() as u64),
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()> {
        let len = data.len() as u64;
        let result = self.inner.write_sectors(start, count, data).await;
        match &result {
            Ok(()) => self.stats.record_write(len),
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    async fn close(&self) -> DeviceResult<()> {
        self.inner.close().await
    }

    async fn is_available(&self) -> bool {
        self.inner.is_available().await
    }
}
