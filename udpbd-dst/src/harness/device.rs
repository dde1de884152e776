//! Device-level simulation harness.
//!
//! Drives a [`BlockDevice`] directly with random in-range and out-of-range
//! sector I/O and checks every result against a [`SectorOracle`].

use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;
use udpbd_server::{
    BlockDevice, DeviceError, FileDevice, FileOpenOptions, Geometry, MemoryDevice, SECTOR_SIZE,
};

use super::{SectorOracle, SimulationError, find_diff};

/// Largest transfer the harness issues, in sectors.
const MAX_SECTORS: u64 = 64;

/// Actions that can be performed in device simulation.
#[derive(Debug, Clone)]
pub enum DeviceAction {
    Read { start: u64, count: u64 },
    Write { start: u64, data: Vec<u8> },
    OutOfRangeRead { start: u64, count: u64 },
    OutOfRangeWrite { start: u64, count: u64 },
}

/// Simulation statistics.
#[derive(Debug, Default, Clone)]
pub struct DeviceStats {
    pub operations: u64,
    pub reads: u64,
    pub writes: u64,
    pub rejected: u64,
}

/// Device-level simulation harness.
pub struct DeviceHarness {
    rng: SmallRng,
    device: Option<Arc<dyn BlockDevice>>,
    oracle: SectorOracle,
    stats: DeviceStats,
    // Keeps the image file alive for file-backed runs
    _dir: Option<TempDir>,
}

impl DeviceHarness {
    pub fn new(seed: u64, sector_count: u64) -> Self {
        Self {
            rng: SmallRng::seed_from_u64(seed),
            device: None,
            oracle: SectorOracle::new(SECTOR_SIZE, sector_count),
            stats: DeviceStats::default(),
            _dir: None,
        }
    }

    /// Serve from memory.
    pub fn init_memory(&mut self) {
        let geometry = Geometry::new(SECTOR_SIZE, self.oracle.sector_count());
        let device: Arc<dyn BlockDevice> = Arc::new(MemoryDevice::new(geometry));
        self.device = Some(device);
    }

    /// Serve from a zero-filled image file in a temporary directory.
    pub async fn init_file(&mut self) -> Result<(), SimulationError> {
        let dir = tempfile::tempdir().map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let path = dir.path().join("disk.img");
        let size = self.oracle.sector_count() * SECTOR_SIZE as u64;
        let file =
            std::fs::File::create(&path).map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        file.set_len(size)
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        drop(file);

        let device = FileDevice::open(&path, FileOpenOptions::read_write())
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let device: Arc<dyn BlockDevice> = Arc::new(device);
        self.device = Some(device);
        self._dir = Some(dir);
        Ok(())
    }

    fn device(&self) -> &Arc<dyn BlockDevice> {
        self.device.as_ref().expect("not initialized")
    }

    /// Run the simulation for a given number of operations.
    pub async fn run(&mut self, operations: u64) -> Result<(), SimulationError> {
        for _ in 0..operations {
            let action = self.sample_action();
            self.execute(action).await?;
            self.stats.operations += 1;
        }
        self.verify_all().await
    }

    fn sample_range(&mut self) -> (u64, u64) {
        let sector_count = self.oracle.sector_count();
        let count = self.rng.random_range(1..=MAX_SECTORS.min(sector_count));
        let start = self.rng.random_range(0..=sector_count - count);
        (start, count)
    }

    fn sample_out_of_range(&mut self) -> (u64, u64) {
        let sector_count = self.oracle.sector_count();
        let count = self.rng.random_range(1..=MAX_SECTORS);
        // Any start past `sector_count - count` overruns the end.
        let first_bad = (sector_count + 1).saturating_sub(count);
        let start = self.rng.random_range(first_bad..=sector_count + 8);
        (start, count)
    }

    fn sample_action(&mut self) -> DeviceAction {
        let choice = self.rng.random_range(0..100);
        match choice {
            0..45 => {
                let (start, count) = self.sample_range();
                DeviceAction::Read { start, count }
            }
            45..90 => {
                let (start, count) = self.sample_range();
                let data: Vec<u8> = (0..count * SECTOR_SIZE as u64)
                    .map(|_| self.rng.random())
                    .collect();
                DeviceAction::Write { start, data }
            }
            90..95 => {
                let (start, count) = self.sample_out_of_range();
                DeviceAction::OutOfRangeRead { start, count }
            }
            _ => {
                let (start, count) = self.sample_out_of_range();
                DeviceAction::OutOfRangeWrite { start, count }
            }
        }
    }

    /// Execute a single action.
    pub async fn execute(&mut self, action: DeviceAction) -> Result<(), SimulationError> {
        match action {
            DeviceAction::Read { start, count } => {
                self.stats.reads += 1;
                let actual = self
                    .device()
                    .read_sectors(start, count)
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
                let expected = self.oracle.read(start, count);
                if actual.as_ref() != expected {
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
            DeviceAction::Write { start, data } => {
                self.stats.writes += 1;
                let count = (data.len() / SECTOR_SIZE as usize) as u64;
                self.oracle.write(start, &data);
                self.device()
                    .write_sectors(start, count, Bytes::from(data))
                    .await
                    .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
            }
            DeviceAction::OutOfRangeRead { start, count } => {
                self.stats.rejected += 1;
                let result = self.device().read_sectors(start, count).await;
                expect_out_of_range("read", start, count, result.map(|_| ()))?;
            }
            DeviceAction::OutOfRangeWrite { start, count } => {
                self.stats.rejected += 1;
                let data = Bytes::from(vec![0xEE; (count * SECTOR_SIZE as u64) as usize]);
                let result = self.device().write_sectors(start, count, data).await;
                expect_out_of_range("write", start, count, result)?;
            }
        }
        Ok(())
    }

    /// Compare the whole device against the oracle.
    pub async fn verify_all(&self) -> Result<(), SimulationError> {
        let sector_count = self.oracle.sector_count();
        let actual = self
            .device()
            .read_sectors(0, sector_count)
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        let expected = self.oracle.read(0, sector_count);
        if actual.as_ref() != expected {
            return Err(SimulationError::Mismatch {
                context: format!("full image: first diff at byte {}", find_diff(expected, &actual)),
            });
        }
        Ok(())
    }

    /// Close the device; further I/O must fail with `Closed`.
    pub async fn close(&self) -> Result<(), SimulationError> {
        self.device()
            .close()
            .await
            .map_err(|e| SimulationError::Unexpected(e.to_string()))?;
        match self.device().read_sectors(0, 1).await {
            Err(DeviceError::Closed) => Ok(()),
            other => Err(SimulationError::Mismatch {
                context: format!("read after close returned {:?}", other.map(|b| b.len())),
            }),
        }
    }

    pub fn stats(&self) -> &DeviceStats {
        &self.stats
    }
}

fn expect_out_of_range(
    op: &str,
    start: u64,
    count: u64,
    result: Result<(), DeviceError>,
) -> Result<(), SimulationError> {
    match result {
        Err(DeviceError::OutOfRange { .. }) => Ok(()),
        other => Err(SimulationError::Mismatch {
            context: format!(
                "{}(start={}, count={}) past end returned {:?}",
                op, start, count, other
            ),
        }),
    }
}
