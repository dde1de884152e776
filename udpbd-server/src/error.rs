//! Error types for udpbd-server.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

// Re-export UdpbdError from the udpbd crate
pub use udpbd::UdpbdError;
use udpbd::{UDPBD_EINVAL, UDPBD_EIO, UDPBD_ENOSPC, UDPBD_EPERM};

pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("monitor error: {0}")]
    Monitor(#[from] MonitorError),

    #[error("udpbd protocol error: {0}")]
    Protocol(#[from] UdpbdError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Block device errors.
///
/// Request-scoped variants (`OutOfRange`, `ReadOnly`, `BadLength`,
/// `OutOfOrder`, `IoFailure`)
/// never end a session. `Unavailable` means the device went away.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("permission denied opening {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(
        "sector range out of bounds: start {start} + count {count} exceeds {sector_count} sectors"
    )]
    OutOfRange {
        start: u64,
        count: u64,
        sector_count: u64,
    },

    #[error("device is read-only")]
    ReadOnly,

    #[error("invalid data length: expected {expected_bytes}, got {actual_bytes}")]
    BadLength {
        expected_bytes: usize,
        actual_bytes: usize,
    },

    #[error("write payload out of order: expected cmd_pkt {expected}, got {actual}")]
    OutOfOrder { expected: u8, actual: u8 },

    #[error("device i/o failure: {0}")]
    IoFailure(#[source] io::Error),

    #[error("device unavailable: {0}")]
    Unavailable(#[source] io::Error),

    #[error("device is closed")]
    Closed,

    #[error("invalid device: {reason}")]
    InvalidDevice { reason: &'static str },
}

impl DeviceError {
    /// Map an I/O error from an open handle, detecting device removal.
    pub fn from_io(err: io::Error) -> Self {
        let errno = err.raw_os_error().map(nix::errno::Errno::from_raw);
        match errno {
            Some(nix::errno::Errno::ENODEV | nix::errno::Errno::ENXIO) => Self::Unavailable(err),
            _ => Self::IoFailure(err),
        }
    }

    /// Map an error from opening `path`.
    pub fn from_open(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound { path },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path },
            _ => Self::Open { path, source: err },
        }
    }

    /// WRITE_DONE result code reported to the peer.
    pub fn code(&self) -> u32 {
        match self {
            Self::ReadOnly | Self::PermissionDenied { .. } => UDPBD_EPERM,
            Self::OutOfRange { .. } => UDPBD_ENOSPC,
            Self::BadLength { .. } | Self::OutOfOrder { .. } => UDPBD_EINVAL,
            _ => UDPBD_EIO,
        }
    }

    /// True if the session cannot continue with this device.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Closed)
    }
}

/// Transport (socket) errors. Always fatal to the session.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to configure socket: {0}")]
    Configure(#[source] io::Error),

    #[error("receive failed: {0}")]
    Receive(#[source] io::Error),
}

/// Device monitor errors. Logged; the scan loop continues.
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("failed to spawn {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to wait for session process: {0}")]
    Wait(#[source] io::Error),

    #[error("session for {} failed: {source}", device.display())]
    Session {
        device: PathBuf,
        #[source]
        source: Box<Error>,
    },

    #[error("session task panicked or was cancelled")]
    Join,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    ReadError(io::Error),

    #[error("failed to parse config: {0}")]
    ParseError(String),

    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: &'static str,
    },
}
