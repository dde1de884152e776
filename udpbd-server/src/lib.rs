//! udpbd-server: serve a local block device over UDPBD.
//!
//! One session per device: a UDP transport loop feeds datagrams to the
//! protocol engine, which performs bounds-checked sector I/O on the device
//! backend. The device monitor starts a session for whichever candidate
//! device exposes a flag file, one at a time.
//!
//! # Library Usage
//!
//! The primary API for serving a device is the [`Session`] struct:
//!
//! ```ignore
//! use udpbd_server::{Config, Session};
//!
//! let session = Session::open(&config).await?;
//! session.serve(shutdown).await?;
//! ```

pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod session;
pub mod stats;
pub mod transport;
pub mod types;

pub use config::{CandidateConfig, Config, DeviceConfig, DeviceKind, MonitorConfig, ServerConfig};
pub use device::{BlockDevice, DeviceResult, FileDevice, FileOpenOptions, MemoryDevice, open_device};
pub use engine::{Delivery, DropReason, Engine, Outcome, ReadChunk, read_chunks};
pub use error::{
    ConfigError, DeviceError, Error, MonitorError, Result, TransportError, UdpbdError,
};
pub use monitor::{Candidate, Monitor, ProcessLauncher, SessionExit, SessionLauncher, TaskLauncher};
pub use session::Session;
pub use stats::{CountingDevice, IoSnapshot, IoStats, format_size};
pub use transport::{
    ChannelPeer, ChannelSocket, DatagramSocket, SessionEnd, Transport, TransportOptions,
};
pub use types::{Geometry, SECTOR_SIZE, SectorRange};
