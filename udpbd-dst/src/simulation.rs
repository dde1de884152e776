//! Simulation runners and utilities.
//!
//! Every run is driven by one seed. A failing run prints its seed; rerun
//! with `DST_SEED=<seed>` to replay the same action sequence.

use crate::harness::{DeviceHarness, SessionHarness, SimulationError};

/// Build a single-threaded tokio runtime for simulation.
pub fn build_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
}

/// Which device backend a device simulation runs against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    File,
}

/// Run a device simulation with the given seed and number of operations.
pub async fn run_device_simulation(
    seed: u64,
    backend: Backend,
    sector_count: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "Device simulation: seed={}, backend={:?}, sectors={}, ops={}",
        seed, backend, sector_count, operations
    );

    let mut harness = DeviceHarness::new(seed, sector_count);
    match backend {
        Backend::Memory => harness.init_memory(),
        Backend::File => harness.init_file().await?,
    }
    harness.run(operations).await?;
    harness.close().await?;

    let stats = harness.stats();
    eprintln!("Device simulation complete: {:?}", stats);
    Ok(())
}

/// Run a protocol simulation with the given seed and number of operations.
pub async fn run_session_simulation(
    seed: u64,
    sector_count: u64,
    operations: u64,
) -> Result<(), SimulationError> {
    eprintln!(
        "Session simulation: seed={}, sectors={}, ops={}",
        seed, sector_count, operations
    );

    let mut harness = SessionHarness::new(seed, sector_count);
    harness.init();
    let result = harness.run(operations).await;
    harness.shutdown().await?;
    result?;

    let stats = harness.stats();
    eprintln!("Session simulation complete: {:?}", stats);
    Ok(())
}

/// Get the seed from environment or generate a random one.
pub fn get_seed() -> u64 {
    std::env::var("DST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(rand::random)
}
