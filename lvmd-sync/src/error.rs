//! Error types for lvmd-sync.

use std::path::PathBuf;

use thiserror::Error;

use lvmd_core::error::RegistryError;

/// All errors that can arise from command execution and reconciliation.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The command could not be started at all.
    #[error("failed to launch {path}: {source}")]
    Launch {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A read-only query kept failing after every retry.
    #[error("{command} failed after {attempts} attempt(s), exit code {code}: {stderr}")]
    QueryFailed {
        command: String,
        attempts: u32,
        code: i32,
        stderr: String,
    },

    /// A row had fewer columns than requested or an unparsable number.
    #[error("malformed {command} output: {detail}")]
    Malformed { command: String, detail: String },

    /// An error from the registry.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Convenience constructor for [`SyncError::Launch`].
pub(crate) fn launch_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Launch {
        path: path.into(),
        source,
    }
}
