//! Deterministic Simulation Testing (DST) for udpbd.
//!
//! This crate provides testing utilities that are intentionally separate from
//! the server crate so simulation harnesses are never compiled into
//! production binaries.
//!
//! ## Crate Structure
//!
//! - `harness` - Simulation harnesses and the sector oracle
//! - `simulation` - Runtime and simulation runners
//!
//! ## Running DST Tests
//!
//! ```bash
//! # PR-level quick tests
//! cargo test -p udpbd-dst simulation
//!
//! # Nightly long-running tests
//! cargo test -p udpbd-dst simulation -- --ignored
//!
//! # Replay a failure
//! DST_SEED=1234 cargo test -p udpbd-dst simulation
//! ```

pub mod harness;
pub mod simulation;

pub use harness::{
    DeviceAction, DeviceHarness, DeviceStats, SectorOracle, SessionAction, SessionHarness,
    SessionStats, SimulationError,
};
pub use simulation::{
    Backend, build_runtime, get_seed, run_device_simulation, run_session_simulation,
};
