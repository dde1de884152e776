//! Configuration for udpbd-server and udpbd-monitor.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{SECTOR_SIZE, is_valid_sector_size};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Raw block device or regular image file.
    #[default]
    File,
    /// In-memory device, contents lost on exit.
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub kind: DeviceKind,
    pub path: Option<PathBuf>,
    pub read_only: bool,
    /// Reopen read-only when read-write access is refused.
    pub fallback_read_only: bool,
    pub sector_size: u32,
    pub memory_size_bytes: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: DeviceKind::File,
            path: None,
            read_only: false,
            fallback_read_only: false,
            sector_size: SECTOR_SIZE,
            // 16 MiB
            memory_size_bytes: 16 * 1024 * 1024,
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_sector_size(self.sector_size) {
            return Err(ConfigError::InvalidValue {
                field: "device.sector_size",
                reason: "must be a power of two between 512 and 4096",
            });
        }
        if self.kind == DeviceKind::Memory {
            if self.memory_size_bytes == 0 {
                return Err(ConfigError::InvalidValue {
                    field: "device.memory_size_bytes",
                    reason: "must be > 0",
                });
            }
            if self.memory_size_bytes % self.sector_size as u64 != 0 {
                return Err(ConfigError::InvalidValue {
                    field: "device.memory_size_bytes",
                    reason: "must be a multiple of the sector size",
                });
            }
        }
        Ok(())
    }

    /// Path of a file device; required once CLI overrides have been applied.
    pub fn require_path(&self) -> Result<&Path, ConfigError> {
        self.path.as_deref().ok_or(ConfigError::InvalidValue {
            field: "device.path",
            reason: "required for file devices",
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub address: String,
    pub broadcast: bool,
    /// Drop datagrams from any peer other than the first one seen.
    pub lock_peer: bool,
    /// Seconds between I/O statistics log lines; 0 disables them.
    pub stats_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            broadcast: true,
            lock_peer: false,
            stats_interval_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address.parse().map_err(|_| ConfigError::InvalidValue {
            field: "server.address",
            reason: "must be an ip:port socket address",
        })
    }

    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

/// A device the monitor may serve, and the directory its marker lives in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateConfig {
    pub device: PathBuf,
    pub root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub period_secs: u64,
    pub flag: String,
    /// Serve matched devices read-only.
    pub read_only: bool,
    /// Server binary to launch; defaults to `udpbd-server` next to the monitor.
    pub server_program: Option<PathBuf>,
    pub candidates: Vec<CandidateConfig>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            period_secs: 10,
            flag: "udpbd".to_string(),
            read_only: true,
            server_program: None,
            candidates: Vec::new(),
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "monitor.period_secs",
                reason: "must be > 0",
            });
        }
        if self.flag.is_empty() || self.flag.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "monitor.flag",
                reason: "must be a non-empty file name",
            });
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period_secs)
    }
}

fn default_server_address() -> String {
    format!("0.0.0.0:{}", udpbd::UDPBD_PORT)
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.server.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.server.address, "0.0.0.0:48573");
        assert!(config.server.broadcast);
        assert!(!config.server.lock_peer);
        assert_eq!(config.device.sector_size, 512);
        assert_eq!(config.device.memory_size_bytes, 16 * 1024 * 1024);
        assert_eq!(config.monitor.period(), Duration::from_secs(10));
        assert!(config.monitor.read_only);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn device_config_rejects_bad_sector_size() {
        let config = DeviceConfig {
            sector_size: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue {
                field: "device.sector_size",
                ..
            })
        ));
    }

    #[test]
    fn memory_device_size_must_be_sector_aligned() {
        let config = DeviceConfig {
            kind: DeviceKind::Memory,
            memory_size_bytes: 1000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn file_device_requires_path() {
        let config = DeviceConfig::default();
        assert!(config.require_path().is_err());
    }

    #[test]
    fn server_config_rejects_bad_address() {
        let config = ServerConfig {
            address: "localhost".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn stats_interval_zero_disables() {
        let config = ServerConfig {
            stats_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.stats_interval(), None);
    }

    #[test]
    fn monitor_config_rejects_zero_period() {
        let config = MonitorConfig {
            period_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn monitor_config_rejects_path_flag() {
        let config = MonitorConfig {
            flag: "a/b".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("udpbd.toml");
        std::fs::write(
            &path,
            r#"
[device]
path = "/dev/sdb1"
read_only = true

[server]
address = "127.0.0.1:48573"
lock_peer = true

[monitor]
period_secs = 5
flag = "pyudpbd"

[[monitor.candidates]]
device = "/dev/sdb1"
root = "/media/usb0"
"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.device.path, Some(PathBuf::from("/dev/sdb1")));
        assert!(config.device.read_only);
        assert_eq!(config.device.kind, DeviceKind::File);
        assert!(config.server.lock_peer);
        assert_eq!(config.monitor.flag, "pyudpbd");
        assert_eq!(
            config.monitor.candidates,
            vec![CandidateConfig {
                device: PathBuf::from("/dev/sdb1"),
                root: PathBuf::from("/media/usb0"),
            }]
        );
    }

    #[test]
    fn load_rejects_invalid_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[device\n").unwrap();
        assert!(matches!(
            Config::load(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
