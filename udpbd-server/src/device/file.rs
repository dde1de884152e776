//! File-backed device: a raw block device, partition, or image file.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use super::{BlockDevice, DeviceResult, check_write};
use crate::error::DeviceError;
use crate::types::{Geometry, SECTOR_SIZE};

// BLKGETSIZE64 = _IOR(0x12, 114, size_t)
nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);

#[derive(Debug, Clone, Copy)]
pub struct FileOpenOptions {
    pub read_only: bool,
    /// Reopen read-only when read-write access is refused.
    pub fallback_read_only: bool,
    pub sector_size: u32,
}

impl FileOpenOptions {
    pub fn read_write() -> Self {
        Self {
            read_only: false,
            fallback_read_only: false,
            sector_size: SECTOR_SIZE,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::read_write()
        }
    }
}

pub struct FileDevice {
    path: PathBuf,
    geometry: Geometry,
    read_only: bool,
    /// `(st_dev, st_ino)` of the opened node, to notice it being removed or replaced.
    identity: (u64, u64),
    file: Mutex<Option<Arc<File>>>,
}

impl FileDevice {
    pub async fn open(path: impl AsRef<Path>, options: FileOpenOptions) -> DeviceResult<Self> {
        let path = path.as_ref().to_path_buf();
        let open_path = path.clone();
        let (file, read_only, size_bytes, identity) =
            tokio::task::spawn_blocking(move || open_blocking(&open_path, options))
                .await
                .map_err(|e| DeviceError::IoFailure(std::io::Error::other(e)))??;

        let geometry = Geometry::from_size_bytes(options.sector_size, size_bytes);
        if geometry.sector_count == 0 {
            return Err(DeviceError::InvalidDevice {
                reason: "device is smaller than one sector",
            });
        }

        tracing::info!(
            path = %path.display(),
            read_only,
            sector_size = geometry.sector_size,
            sector_count = geometry.sector_count,
            "Opened device"
        );

        Ok(Self {
            path,
            geometry,
            read_only,
            identity,
            file: Mutex::new(Some(Arc::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> DeviceResult<Arc<File>> {
        self.file.lock().clone().ok_or(DeviceError::Closed)
    }
}

fn open_blocking(
    path: &Path,
    options: FileOpenOptions,
) -> DeviceResult<(File, bool, u64, (u64, u64))> {
    let open = |read_only: bool| OpenOptions::new().read(true).write(!read_only).open(path);

    let (file, read_only) = if options.read_only {
        let file = open(true).map_err(|e| DeviceError::from_open(path.to_path_buf(), e))?;
        (file, true)
    } else {
        match open(false) {
            Ok(file) => (file, false),
            Err(e) if options.fallback_read_only && e.kind() != std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "Read-write open refused, falling back to read-only"
                );
                let file = open(true).map_err(|e| DeviceError::from_open(path.to_path_buf(), e))?;
                (file, true)
            }
            Err(e) => return Err(DeviceError::from_open(path.to_path_buf(), e)),
        }
    };

    let metadata = file
        .metadata()
        .map_err(|e| DeviceError::from_open(path.to_path_buf(), e))?;
    let size_bytes =
        device_size(&file, &metadata).map_err(|e| DeviceError::from_open(path.to_path_buf(), e))?;
    Ok((file, read_only, size_bytes, (metadata.dev(), metadata.ino())))
}

fn device_size(file: &File, metadata: &std::fs::Metadata) -> std::io::Result<u64> {
    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }
    let mut size: u64 = 0;
    // SAFETY: BLKGETSIZE64 writes a single u64 through the pointer we pass,
    // and `size` outlives the call.
    unsafe { blkgetsize64(file.as_raw_fd(), &mut size) }.map_err(std::io::Error::from)?;
    Ok(size)
}

/// Whether the open handle still refers to a present device.
///
/// The path must still name the node that was opened; udev removes the node
/// when a drive is unplugged. Block devices are also asked for their size,
/// which fails with `ENODEV`/`ENXIO` (or reports 0) once the disk is gone.
fn probe_available(file: &File, path: &Path, identity: (u64, u64)) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) if (metadata.dev(), metadata.ino()) == identity => {}
        _ => return false,
    }
    let Ok(metadata) = file.metadata() else {
        return false;
    };
    if !metadata.file_type().is_block_device() {
        return true;
    }
    let mut size: u64 = 0;
    // SAFETY: as in `device_size`.
    match unsafe { blkgetsize64(file.as_raw_fd(), &mut size) } {
        Ok(_) => size > 0,
        Err(errno) => !matches!(errno, nix::errno::Errno::ENODEV | nix::errno::Errno::ENXIO),
    }
}

#[async_trait]
impl BlockDevice for FileDevice {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    async fn read_sectors(&self, start: u64, count: u64) -> DeviceResult<Bytes> {
        let file = self.handle()?;
        let range = self.geometry.check_range(start, count)?;
        let offset = range.offset_bytes(self.geometry.sector_size);
        let len = range.len_bytes(self.geometry.sector_size);

        let buf = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0u8; len];
            file.read_exact_at(&mut buf, offset)?;
            Ok::<_, std::io::Error>(buf)
        })
        .await
        .map_err(|e| DeviceError::IoFailure(std::io::Error::other(e)))?
        .map_err(DeviceError::from_io)?;

        Ok(Bytes::from(buf))
    }

    async fn write_sectors(&self, start: u64, count: u64, data: Bytes) -> DeviceResult<()> {
        let file = self.handle()?;
        let range = check_write(self.geometry, self.read_only, start, count, data.len())?;
        let offset = range.offset_bytes(self.geometry.sector_size);

        tokio::task::spawn_blocking(move || file.write_all_at(&data, offset))
            .await
            .map_err(|e| DeviceError::IoFailure(std::io::Error::other(e)))?
            .map_err(DeviceError::from_io)
    }

    async fn close(&self) -> DeviceResult<()> {
        let Some(file) = self.file.lock().take() else {
            return Ok(());
        };
        tracing::info!(path = %self.path.display(), "Closing device");
        if self.read_only {
            return Ok(());
        }
        tokio::task::spawn_blocking(move || file.sync_all())
            .await
            .map_err(|e| DeviceError::IoFailure(std::io::Error::other(e)))?
            .map_err(DeviceError::from_io)
    }

    async fn is_available(&self) -> bool {
        let Ok(file) = self.handle() else {
            return false;
        };
        let path = self.path.clone();
        let identity = self.identity;
        tokio::task::spawn_blocking(move || probe_available(&file, &path, identity))
            .await
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(sectors: usize) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let data: Vec<u8> = (0..sectors * 512).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn reads_image_contents() {
        let (_dir, path) = image(8);
        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .unwrap();
        assert_eq!(device.geometry(), Geometry::new(512, 8));

        let data = device.read_sectors(2, 2).await.unwrap();
        let expected: Vec<u8> = (1024..2048).map(|i| (i % 251) as u8).collect();
        assert_eq!(&data[..], &expected[..]);
    }

    #[tokio::test]
    async fn write_then_read() {
        let (_dir, path) = image(8);
        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .unwrap();
        device
            .write_sectors(3, 1, Bytes::from(vec![0xAB; 512]))
            .await
            .unwrap();
        assert_eq!(&device.read_sectors(3, 1).await.unwrap()[..], &[0xAB; 512]);
        device.close().await.unwrap();

        let on_disk = std::fs::read(&path).unwrap();
        assert_eq!(&on_disk[1536..2048], &[0xAB; 512]);
    }

    #[tokio::test]
    async fn bounds_checking() {
        let (_dir, path) = image(8);
        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .unwrap();
        assert!(matches!(
            device.read_sectors(7, 2).await,
            Err(DeviceError::OutOfRange { .. })
        ));
        assert!(matches!(
            device.write_sectors(8, 1, Bytes::from(vec![0; 512])).await,
            Err(DeviceError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn read_only_refuses_writes() {
        let (_dir, path) = image(4);
        let before = std::fs::read(&path).unwrap();
        let device = FileDevice::open(&path, FileOpenOptions::read_only())
            .await
            .unwrap();
        assert!(device.is_read_only());
        assert!(matches!(
            device.write_sectors(0, 1, Bytes::from(vec![0xFF; 512])).await,
            Err(DeviceError::ReadOnly)
        ));
        device.close().await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[tokio::test]
    async fn bad_length_rejected() {
        let (_dir, path) = image(4);
        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .unwrap();
        assert!(matches!(
            device.write_sectors(0, 2, Bytes::from(vec![0; 512])).await,
            Err(DeviceError::BadLength {
                expected_bytes: 1024,
                actual_bytes: 512
            })
        ));
    }

    #[tokio::test]
    async fn trailing_partial_sector_not_addressable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.img");
        std::fs::write(&path, vec![0u8; 512 * 3 + 100]).unwrap();
        let device = FileDevice::open(&path, FileOpenOptions::read_only())
            .await
            .unwrap();
        assert_eq!(device.geometry().sector_count, 3);
    }

    #[tokio::test]
    async fn tiny_image_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.img");
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        assert!(matches!(
            FileDevice::open(&path, FileOpenOptions::read_only()).await,
            Err(DeviceError::InvalidDevice { .. })
        ));
    }

    #[tokio::test]
    async fn missing_path_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = FileDevice::open(
            dir.path().join("nope.img"),
            FileOpenOptions {
                fallback_read_only: true,
                ..FileOpenOptions::read_write()
            },
        )
        .await;
        assert!(matches!(result, Err(DeviceError::NotFound { .. })));
    }

    #[tokio::test]
    async fn unavailable_once_image_is_removed() {
        let (_dir, path) = image(4);
        let device = FileDevice::open(&path, FileOpenOptions::read_only())
            .await
            .unwrap();
        assert!(device.is_available().await);
        std::fs::remove_file(&path).unwrap();
        assert!(!device.is_available().await);
    }

    #[tokio::test]
    async fn unavailable_once_image_is_replaced() {
        let (_dir, path) = image(4);
        let device = FileDevice::open(&path, FileOpenOptions::read_only())
            .await
            .unwrap();
        let replacement = path.with_extension("new");
        std::fs::write(&replacement, vec![0u8; 2048]).unwrap();
        std::fs::rename(&replacement, &path).unwrap();
        assert!(!device.is_available().await);
    }

    #[tokio::test]
    async fn unavailable_after_close() {
        let (_dir, path) = image(4);
        let device = FileDevice::open(&path, FileOpenOptions::read_only())
            .await
            .unwrap();
        device.close().await.unwrap();
        assert!(!device.is_available().await);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_dir, path) = image(4);
        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .unwrap();
        device.close().await.unwrap();
        device.close().await.unwrap();
        assert!(matches!(
            device.read_sectors(0, 1).await,
            Err(DeviceError::Closed)
        ));
        assert!(matches!(
            device.write_sectors(0, 1, Bytes::from(vec![0; 512])).await,
            Err(DeviceError::Closed)
        ));
    }
}
