//! Block device backends.
//!
//! A backend owns one open device for the lifetime of a session. All sector
//! addressing is bounds-checked against the device geometry, and writes are
//! refused on read-only devices before anything touches the backing store.
//!
//! # Example
//!
//! ```ignore
//! let device = FileDevice::open("/dev/sdb1", FileOpenOptions::read_only()).await?;
//! let data = device.read_sectors(0, 4).await?;
//! device.close().await?;
//! ```

mod file;
mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

pub use file::{FileDevice, FileOpenOptions};
pub use memory::MemoryDevice;

use crate::config::{DeviceConfig, DeviceKind};
use crate::error::{DeviceError, Error};
use crate::types::{Geometry, SectorRange};

/// Result of a device operation.
pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Sector-addressed block device.
///
/// Implementations can be composed as middleware layers (see
/// [`CountingDevice`](crate::stats::CountingDevice)).
#[async_trait]
pub trait BlockDevice: Send + Sync {
    fn geometry(&self) -> Geometry;

    fn is_read_only(&self) -> bool;

    /// Read exactly `count * sector_size` bytes starting at sector `start`.
    async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes>;

    /// Write `data`, which must be exactly `count * sector_size` bytes.
    ///
    /// No rollback is attempted if the underlying write fails part way.
    async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()>;

    /// Release the device. Idempotent; later I/O fails with `Closed`.
    async fn close(&self) -> DeviceResult<()>;

    /// False once the device has gone away (unplugged, node removed, closed).
    ///
    /// Polled by the transport while idle, so it must be cheap.
    async fn is_available(&self) -> bool {
        true
    }
}

/// Lets a shared backend sit under middleware.
#[async_trait]
impl BlockDevice for Arc<dyn BlockDevice> {
    fn geometry(&self) -> Geometry {
        (**self).geometry()
    }

    fn is_read_only(&self) -> bool {
        (**self).is_read_only()
    }

    async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes> {
        (**self).read_sectors(start, count).await
    }

    async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()> {
        (**self).write_sectors(start, count, data).await
    }

    async fn close(&self) -> DeviceResult<()> {
        (**self).close().await
    }

    async fn is_available(&self) -> bool {
        (**self).is_available().await
    }
}

/// Validate a write: read-only first, then bounds, then payload length.
pub(crate) fn check_write(
    geometry: Geometry,
    read_only: bool,
    start: u64,
    count: u64,
    len: usize,
) -> DeviceResult<SectorRange> {
    if read_only {
        return Err(DeviceError::ReadOnly);
    }
    let range = geometry.check_range(start, count)?;
    let expected_bytes = range.len_bytes(geometry.sector_size);
    if len != expected_bytes {
        return Err(DeviceError::BadLength {
            expected_bytes,
            actual_bytes: len,
        });
    }
    Ok(range)
}

/// Open the backend described by `config`.
pub async fn open_device(config: &DeviceConfig) -> Result<Arc<dyn BlockDevice>, Error> {
    config.validate()?;
    let device: Arc<dyn BlockDevice> = match config.kind {
        DeviceKind::Memory => {
            let geometry = Geometry::from_size_bytes(config.sector_size, config.memory_size_bytes);
            let device = MemoryDevice::new(geometry);
            Arc::new(if config.read_only {
                device.into_read_only()
            } else {
                device
            })
        }
        DeviceKind::File => {
            let path = config.require_path()?;
            let options = FileOpenOptions {
                read_only: config.read_only,
                fallback_read_only: config.fallback_read_only,
                sector_size: config.sector_size,
            };
            Arc::new(FileDevice::open(path, options).await?)
        }
    };
    Ok(device)
}
