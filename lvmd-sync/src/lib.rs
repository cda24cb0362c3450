//! # lvmd-sync
//!
//! Talks to the lvm tool and keeps the registry in step with it.
//!
//! Every invocation goes through [`CommandRunner`], which serializes calls
//! and keeps timing statistics. [`StateSync::refresh`] queries the full
//! inventory and reconciles it into the registry atomically.

pub mod commands;
pub mod error;
pub mod exec;
pub mod inventory;
pub mod reconcile;
pub mod tabular;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::SyncError;
pub use exec::{CommandOutput, CommandRunner, CommandStats, Executor, LvmExecutor, RetryPolicy, Streaming};
pub use inventory::{Inventory, MoveStatus};
pub use reconcile::{ReconcileSummary, StateSync};
