//! Daemon configuration.
//!
//! Read from a YAML file (`/etc/lvmd/lvmd.yaml` by default), then adjusted by
//! command-line overrides. A missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lvmd_sync::RetryPolicy;

use crate::error::{io_err, DaemonError};
use crate::monitor::MonitorConfig;
use crate::paths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// The `lvm` binary every subcommand is run through.
    pub lvm_binary: PathBuf,
    /// Refresh when block devices appear or disappear.
    pub use_event_watch: bool,
    pub watch_paths: Vec<PathBuf>,
    pub socket_path: PathBuf,
    /// Request worker threads. Execution is still serialized.
    pub workers: usize,
    /// Seconds a move may show no progress before it is finalized.
    pub stall_grace_secs: u64,
    pub monitor_interval_secs: u64,
    pub monitor_active_interval_ms: u64,
    /// Periodic full refresh; 0 disables it.
    pub refresh_interval_secs: u64,
    pub query_retries: u32,
    pub query_retry_delay_ms: u64,
    pub event_capacity: usize,
    pub debug: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        let monitor = MonitorConfig::default();
        Self {
            lvm_binary: PathBuf::from(paths::DEFAULT_LVM_BINARY),
            use_event_watch: false,
            watch_paths: paths::default_watch_paths(),
            socket_path: paths::default_socket_path(),
            workers: 1,
            stall_grace_secs: monitor.stall_grace.as_secs(),
            monitor_interval_secs: monitor.idle_interval.as_secs(),
            monitor_active_interval_ms: monitor.active_interval.as_millis() as u64,
            refresh_interval_secs: 0,
            query_retries: retry.attempts,
            query_retry_delay_ms: retry.delay.as_millis() as u64,
            event_capacity: 256,
            debug: false,
        }
    }
}

/// Values given on the command line win over the file.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub lvm_binary: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub use_event_watch: Option<bool>,
    pub stall_grace_secs: Option<u64>,
    pub workers: Option<usize>,
    pub debug: bool,
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|source| DaemonError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_overrides(mut self, overrides: Overrides) -> Result<Self, DaemonError> {
        if let Some(binary) = overrides.lvm_binary {
            self.lvm_binary = binary;
        }
        if let Some(socket) = overrides.socket_path {
            self.socket_path = socket;
        }
        if let Some(watch) = overrides.use_event_watch {
            self.use_event_watch = watch;
        }
        if let Some(grace) = overrides.stall_grace_secs {
            self.stall_grace_secs = grace;
        }
        if let Some(workers) = overrides.workers {
            self.workers = workers;
        }
        self.debug |= overrides.debug;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), DaemonError> {
        if self.workers == 0 {
            return Err(DaemonError::Config("workers must be at least 1".into()));
        }
        if self.stall_grace_secs == 0 {
            return Err(DaemonError::Config("stall_grace_secs must be at least 1".into()));
        }
        if self.query_retries == 0 {
            return Err(DaemonError::Config("query_retries must be at least 1".into()));
        }
        if self.monitor_active_interval_ms == 0 || self.monitor_interval_secs == 0 {
            return Err(DaemonError::Config("monitor intervals must be positive".into()));
        }
        if self.event_capacity == 0 {
            return Err(DaemonError::Config("event_capacity must be positive".into()));
        }
        if self.use_event_watch && self.watch_paths.is_empty() {
            return Err(DaemonError::Config(
                "use_event_watch requires at least one watch path".into(),
            ));
        }
        Ok(())
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            idle_interval: Duration::from_secs(self.monitor_interval_secs),
            active_interval: Duration::from_millis(self.monitor_active_interval_ms),
            stall_grace: Duration::from_secs(self.stall_grace_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.query_retries,
            delay: Duration::from_millis(self.query_retry_delay_ms),
        }
    }

    pub fn refresh_interval(&self) -> Option<Duration> {
        (self.refresh_interval_secs > 0).then(|| Duration::from_secs(self.refresh_interval_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let config = DaemonConfig::load(&dir.path().join("absent.yaml")).expect("load");
        assert_eq!(config, DaemonConfig::default());
        assert_eq!(config.monitor_config(), MonitorConfig::default());
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.refresh_interval(), None);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("lvmd.yaml");
        std::fs::write(&path, "use_event_watch: true\nstall_grace_secs: 5\nworkers: 3\n")
            .expect("write");

        let config = DaemonConfig::load(&path).expect("load");
        assert!(config.use_event_watch);
        assert_eq!(config.workers, 3);
        assert_eq!(config.monitor_config().stall_grace, Duration::from_secs(5));
        assert_eq!(config.socket_path, paths::default_socket_path());
    }

    #[test]
    fn unknown_keys_and_bad_values_are_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("lvmd.yaml");

        std::fs::write(&path, "no_such_key: 1\n").expect("write");
        assert!(matches!(
            DaemonConfig::load(&path),
            Err(DaemonError::ConfigParse { .. })
        ));

        std::fs::write(&path, "workers: 0\n").expect("write");
        assert!(matches!(DaemonConfig::load(&path), Err(DaemonError::Config(_))));
    }

    #[test]
    fn overrides_win() {
        let config = DaemonConfig::default()
            .with_overrides(Overrides {
                lvm_binary: Some(PathBuf::from("/opt/lvm")),
                use_event_watch: Some(true),
                stall_grace_secs: Some(10),
                debug: true,
                ..Overrides::default()
            })
            .expect("valid");
        assert_eq!(config.lvm_binary, PathBuf::from("/opt/lvm"));
        assert!(config.use_event_watch);
        assert!(config.debug);
        assert_eq!(config.stall_grace_secs, 10);

        let err = DaemonConfig::default()
            .with_overrides(Overrides {
                workers: Some(0),
                ..Overrides::default()
            })
            .expect_err("zero workers");
        assert!(err.to_string().contains("workers"));
    }
}
