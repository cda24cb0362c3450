//! Error types for lvmd-core.

use thiserror::Error;

/// All errors that can arise from registry and handle operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// No object (or reservation) exists under the handle.
    #[error("object {handle} not found")]
    NotFound { handle: String },

    /// A live object is already registered under the handle.
    #[error("object {handle} already exists")]
    AlreadyExists { handle: String },

    /// The identity is already held by a different live object.
    #[error("identity {name} is already held by {holder}")]
    IdentityInUse { name: String, holder: String },

    /// The handle does not refer to a job.
    #[error("object {handle} is not a job")]
    NotAJob { handle: String },

    /// Jobs may only be removed after completion.
    #[error("job {handle} is not complete")]
    JobNotComplete { handle: String },

    /// A string could not be parsed as a handle path.
    #[error("invalid object path: {path}")]
    InvalidHandle { path: String },
}
