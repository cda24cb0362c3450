//! lvmd daemon: serialized request workers, job tracking, move monitoring and
//! the local socket server.

pub mod config;
mod error;
pub mod events;
pub mod manager;
pub mod monitor;
pub mod mover;
pub mod paths;
pub mod processor;
pub mod protocol;
pub mod refresh;
pub mod request;
mod runtime;
pub mod shutdown;
pub mod validate;
mod watcher;

pub use config::{DaemonConfig, Overrides};
pub use error::{DaemonError, RequestError};
pub use events::{BroadcastSink, ObjectEvent};
pub use manager::{Manager, Options};
pub use monitor::{MonitorConfig, MoveMonitor, PollReport};
pub use processor::RequestProcessor;
pub use protocol::{
    call, open_subscription, request_status, request_stop, send_request, DaemonRequest,
    DaemonResponse, Subscription,
};
pub use refresh::{RefreshCoalescer, RefreshStats};
pub use request::{Outcome, Reply, RequestEntry, Timeout};
pub use runtime::{init_tracing, run, serve, start_blocking, Daemon};
pub use shutdown::Shutdown;
