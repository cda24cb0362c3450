use std::path::PathBuf;

use thiserror::Error;

use lvmd_core::{JobError, RegistryError};
use lvmd_sync::SyncError;

/// Error surface for daemon runtime, configuration and protocol.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("daemon protocol error: {0}")]
    Protocol(String),

    #[error("daemon is not running (socket missing: {socket})")]
    DaemonNotRunning { socket: PathBuf },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}

/// Outcome of a failed request, as seen by the caller or recorded on a job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("exit code {code}, stderr = {stderr}")]
    Command { code: i32, stderr: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("job {0} is not complete")]
    JobNotComplete(String),

    #[error("inventory query failed: {0}")]
    Query(String),

    #[error("operation panicked: {0}")]
    Panicked(String),

    #[error("daemon is shutting down")]
    ShuttingDown,
}

impl RequestError {
    /// Numeric code reported through a job's `GetError`.
    pub fn code(&self) -> i32 {
        match self {
            RequestError::Command { code, .. } => *code,
            _ => -1,
        }
    }

    pub fn to_job_error(&self) -> JobError {
        match self {
            RequestError::Command { code, stderr } => JobError::new(*code, stderr.clone()),
            other => JobError::new(other.code(), other.to_string()),
        }
    }
}

impl From<RegistryError> for RequestError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound { handle } => RequestError::NotFound(handle),
            RegistryError::AlreadyExists { handle } => RequestError::AlreadyExists(handle),
            RegistryError::IdentityInUse { name, .. } => RequestError::AlreadyExists(name),
            RegistryError::JobNotComplete { handle } => RequestError::JobNotComplete(handle),
            other @ (RegistryError::NotAJob { .. } | RegistryError::InvalidHandle { .. }) => {
                RequestError::InvalidArgument(other.to_string())
            }
        }
    }
}

impl From<SyncError> for RequestError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Registry(err) => err.into(),
            SyncError::Launch { .. } => RequestError::Command {
                code: -1,
                stderr: err.to_string(),
            },
            other => RequestError::Query(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_errors_keep_their_exit_code() {
        let err = RequestError::Command {
            code: 5,
            stderr: "Volume group \"vg9\" not found".into(),
        };
        assert_eq!(err.code(), 5);
        assert_eq!(err.to_job_error(), JobError::new(5, "Volume group \"vg9\" not found"));
    }

    #[test]
    fn other_errors_report_minus_one() {
        let err: RequestError = RegistryError::JobNotComplete {
            handle: "/com/redhat/lvmdbus1/Job/3".into(),
        }
        .into();
        assert!(matches!(err, RequestError::JobNotComplete(_)));
        assert_eq!(err.to_job_error().code, -1);
    }
}
