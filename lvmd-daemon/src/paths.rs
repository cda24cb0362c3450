use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/lvmd/lvmd.yaml";
pub const DEFAULT_SOCKET_PATH: &str = "/run/lvmd/lvmd.sock";
pub const DEFAULT_LVM_BINARY: &str = "/usr/sbin/lvm";

/// Device-node events for the same path inside this window are dropped.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

pub fn default_config_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONFIG_PATH)
}

pub fn default_socket_path() -> PathBuf {
    PathBuf::from(DEFAULT_SOCKET_PATH)
}

/// Paths watched for block device arrivals when udev-driven refresh is on.
pub fn default_watch_paths() -> Vec<PathBuf> {
    vec![PathBuf::from("/dev"), PathBuf::from("/dev/mapper")]
}
