//! Client connection settings.

use std::path::PathBuf;
use std::time::Duration;

use vbi_proxy_protocol::{
    socket_path_for_device, ClientFlags, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_SOCKET_DIR,
};

/// Overrides the socket directory.
pub const ENV_SOCKET_DIR: &str = "VBIPROXY_SOCKET_DIR";
/// Connect over TCP to `host:port` instead of the local socket.
pub const ENV_TCP: &str = "VBIPROXY_TCP";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Device path the daemon serves, e.g. `/dev/vbi0`.
    pub device: String,
    pub socket_dir: PathBuf,
    pub tcp_addr: Option<String>,
    pub client_name: String,
    pub flags: ClientFlags,
    /// Scanning the client expects, or 0 for any.
    pub scanning: u16,
    pub connect_timeout: Duration,
    /// Time to wait for the reply to a request.
    pub reply_timeout: Duration,
    pub max_message_size: u32,
}

impl ClientConfig {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            socket_dir: PathBuf::from(DEFAULT_SOCKET_DIR),
            tcp_addr: None,
            client_name: default_client_name(),
            flags: ClientFlags::default(),
            scanning: 0,
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    /// Settings for `device` with the socket location taken from the environment.
    pub fn from_env(device: impl Into<String>) -> Self {
        let mut config = Self::new(device);
        if let Some(dir) = std::env::var_os(ENV_SOCKET_DIR) {
            config.socket_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var(ENV_TCP) {
            if !addr.is_empty() {
                config.tcp_addr = Some(addr);
            }
        }
        config
    }

    pub fn socket_path(&self) -> PathBuf {
        socket_path_for_device(&self.socket_dir, &self.device)
    }
}

fn default_client_name() -> String {
    std::env::args()
        .next()
        .as_deref()
        .and_then(|arg0| std::path::Path::new(arg0).file_name()?.to_str().map(str::to_owned))
        .unwrap_or_else(|| "vbi-proxy-client".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path() {
        let mut config = ClientConfig::new("/dev/vbi1");
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/vbiproxy-dev-vbi1"));
        config.socket_dir = PathBuf::from("/run/vbi");
        assert_eq!(config.socket_path(), PathBuf::from("/run/vbi/vbiproxy-dev-vbi1"));
        assert!(!config.client_name.is_empty());
    }
}
