//! Broker configuration and the TOML configuration file.
//!
//! ```toml
//! [server]
//! socket_dir = "/tmp"
//! max_clients = 10
//! buffers = 8
//!
//! [logging]
//! log_dir = "/var/log/vbi-proxy"
//! retention_days = 7
//! level = "info"
//!
//! [[device]]
//! path = "/dev/vbi0"
//! tcp_listen = "127.0.0.1:2710"
//! ```

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use vbi_proxy_protocol::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SOCKET_DIR, SCANNING_525, SCANNING_625};

pub const DEFAULT_DEVICE: &str = "/dev/vbi0";

/// Smallest accepted message size limit; a frame of a full PAL field must fit.
const MIN_MESSAGE_SIZE: u32 = 4096;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// One served device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub path: String,
    /// Additional TCP listener for remote clients.
    pub tcp_listen: Option<SocketAddr>,
    /// Line scanning of the captured signal, 625 or 525.
    pub scanning: u16,
}

impl DeviceConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            tcp_listen: None,
            scanning: SCANNING_625,
        }
    }
}

/// Runtime settings of a broker instance.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub devices: Vec<DeviceConfig>,
    pub socket_dir: PathBuf,
    /// Capture buffers per device.
    pub buffer_count: usize,
    pub max_clients: usize,
    pub max_message_size: u32,
    /// Time a new connection has to complete its handshake.
    pub connect_timeout: Duration,
    /// Time a pending write may stall before the client is dropped.
    pub write_timeout: Duration,
    /// Bound on stopping acquisition before the device is forced closed.
    pub stop_timeout: Duration,
    /// Time a client has to return the channel token.
    pub reclaim_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            devices: vec![DeviceConfig::new(DEFAULT_DEVICE)],
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            buffer_count: 8,
            max_clients: 10,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            connect_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(20),
            stop_timeout: Duration::from_secs(1),
            reclaim_timeout: Duration::from_secs(5),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("no device configured".into()));
        }
        let mut seen = HashSet::new();
        for dev in &self.devices {
            if !seen.insert(dev.path.as_str()) {
                return Err(ConfigError::Invalid(format!("device {} listed twice", dev.path)));
            }
            if dev.scanning != SCANNING_625 && dev.scanning != SCANNING_525 {
                return Err(ConfigError::Invalid(format!(
                    "device {}: scanning must be 625 or 525, not {}",
                    dev.path, dev.scanning
                )));
            }
        }
        if self.buffer_count == 0 {
            return Err(ConfigError::Invalid("buffer count must be at least 1".into()));
        }
        if self.max_clients == 0 {
            return Err(ConfigError::Invalid("max clients must be at least 1".into()));
        }
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max message size must be at least {} bytes",
                MIN_MESSAGE_SIZE
            )));
        }
        Ok(())
    }
}

/// Configuration file format.
#[derive(Debug, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default, rename = "device")]
    pub devices: Vec<DeviceSection>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerSection {
    pub socket_dir: Option<String>,
    pub max_clients: Option<usize>,
    pub buffers: Option<usize>,
    pub max_message_size: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub write_timeout_secs: Option<u64>,
    pub stop_timeout_ms: Option<u64>,
    pub reclaim_timeout_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DeviceSection {
    pub path: String,
    pub tcp_listen: Option<String>,
    pub scanning: Option<u16>,
}

pub fn load_config(path: &Path) -> Result<ConfigFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl ConfigFile {
    /// Broker settings from this file, with defaults for anything missing.
    pub fn broker_config(&self) -> Result<BrokerConfig, ConfigError> {
        let mut config = BrokerConfig::default();
        let server = &self.server;

        if let Some(dir) = &server.socket_dir {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Some(n) = server.max_clients {
            config.max_clients = n;
        }
        if let Some(n) = server.buffers {
            config.buffer_count = n;
        }
        if let Some(n) = server.max_message_size {
            config.max_message_size = n;
        }
        if let Some(s) = server.connect_timeout_secs {
            config.connect_timeout = Duration::from_secs(s);
        }
        if let Some(s) = server.write_timeout_secs {
            config.write_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = server.stop_timeout_ms {
            config.stop_timeout = Duration::from_millis(ms);
        }
        if let Some(s) = server.reclaim_timeout_secs {
            config.reclaim_timeout = Duration::from_secs(s);
        }

        if !self.devices.is_empty() {
            config.devices = self
                .devices
                .iter()
                .map(|d| {
                    let tcp_listen = d
                        .tcp_listen
                        .as_deref()
                        .map(|addr| {
                            addr.parse::<SocketAddr>().map_err(|e| {
                                ConfigError::Invalid(format!("device {}: tcp_listen {}: {}", d.path, addr, e))
                            })
                        })
                        .transpose()?;
                    Ok(DeviceConfig {
                        path: d.path.clone(),
                        tcp_listen,
                        scanning: d.scanning.unwrap_or(SCANNING_625),
                    })
                })
                .collect::<Result<Vec<_>, ConfigError>>()?;
        }

        Ok(config)
    }
}
