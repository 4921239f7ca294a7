//! Deterministic socket naming.

use std::path::{Path, PathBuf};

/// Prefix of every per-device socket file name.
pub const SOCKET_PREFIX: &str = "vbiproxy";

/// Default directory holding the per-device sockets.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Path of the UNIX-domain socket serving `device`.
///
/// Slashes in the device path become dashes, so `/dev/vbi0` is served at
/// `<dir>/vbiproxy-dev-vbi0`.
pub fn socket_path_for_device(dir: &Path, device: &str) -> PathBuf {
    let mut name = String::with_capacity(SOCKET_PREFIX.len() + device.len());
    name.push_str(SOCKET_PREFIX);
    name.extend(device.chars().map(|c| if c == '/' { '-' } else { c }));
    dir.join(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_path_for_device() {
        assert_eq!(
            socket_path_for_device(Path::new("/tmp"), "/dev/vbi0"),
            PathBuf::from("/tmp/vbiproxy-dev-vbi0")
        );
        assert_eq!(
            socket_path_for_device(Path::new("/run/vbi"), "/dev/v4l/vbi1"),
            PathBuf::from("/run/vbi/vbiproxy-dev-v4l-vbi1")
        );
    }
}
