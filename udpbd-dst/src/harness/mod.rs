//! Simulation harnesses for udpbd.
//!
//! Harnesses provide the infrastructure for running deterministic simulations:
//! - A sector-level oracle for correctness verification
//! - Action generators for random operation sequences
//! - Statistics tracking

pub mod device;
pub mod session;

pub use device::{DeviceAction, DeviceHarness, DeviceStats};
pub use session::{SessionAction, SessionHarness, SessionStats};

/// Error type for simulation failures.
#[derive(Debug)]
pub enum SimulationError {
    Mismatch { context: String },
    Unexpected(String),
}

impl std::fmt::Display for SimulationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mismatch { context } => write!(f, "oracle mismatch: {}", context),
            Self::Unexpected(msg) => write!(f, "unexpected error: {}", msg),
        }
    }
}

impl std::error::Error for SimulationError {}

/// Flat byte image of the device, updated alongside every accepted write.
pub struct SectorOracle {
    sector_size: usize,
    data: Vec<u8>,
}

impl SectorOracle {
    pub fn new(sector_size: u32, sector_count: u64) -> Self {
        Self {
            sector_size: sector_size as usize,
            data: vec![0u8; sector_size as usize * sector_count as usize],
        }
    }

    pub fn sector_count(&self) -> u64 {
        (self.data.len() / self.sector_size) as u64
    }

    pub fn read(&self, start: u64, count: u64) -> &[u8] {
        let begin = start as usize * self.sector_size;
        &self.data[begin..begin + count as usize * self.sector_size]
    }

    pub fn write(&mut self, start: u64, data: &[u8]) {
        let begin = start as usize * self.sector_size;
        self.data[begin..begin + data.len()].copy_from_slice(data);
    }
}

pub(crate) fn find_diff(expected: &[u8], actual: &[u8]) -> usize {
    for (i, (e, a)) in expected.iter().zip(actual.iter()).enumerate() {
        if e != a {
            return i;
        }
    }
    expected.len().min(actual.len())
}
