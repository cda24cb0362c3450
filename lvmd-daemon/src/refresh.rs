//! Coalesced background refreshes.
//!
//! Event-driven refresh requests collapse to at most one queued refresh. A
//! request that arrives while a refresh is already executing queues exactly
//! one more, so changes made during a pass are never missed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;

use lvmd_core::OpValue;
use lvmd_sync::StateSync;

use crate::error::RequestError;
use crate::processor::RequestProcessor;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RefreshStats {
    pub requested: u64,
    pub queued: u64,
    pub executed: u64,
}

pub struct RefreshCoalescer {
    sync: Arc<StateSync>,
    processor: Arc<RequestProcessor>,
    queued: Mutex<bool>,
    requested: AtomicU64,
    enqueued: AtomicU64,
    executed: AtomicU64,
}

impl RefreshCoalescer {
    pub fn new(sync: Arc<StateSync>, processor: Arc<RequestProcessor>) -> Arc<Self> {
        Arc::new(Self {
            sync,
            processor,
            queued: Mutex::new(false),
            requested: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            executed: AtomicU64::new(0),
        })
    }

    /// Ask for a refresh. Returns whether a new one was queued.
    pub fn request(self: &Arc<Self>, reason: &str) -> bool {
        self.requested.fetch_add(1, Ordering::Relaxed);
        {
            let mut queued = self.queued.lock();
            if *queued {
                tracing::debug!(reason, "refresh already queued");
                return false;
            }
            *queued = true;
        }

        let me = Arc::clone(self);
        match self.processor.post("Refresh", move || me.execute()) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(reason, "refresh queued");
                true
            }
            Err(err) => {
                *self.queued.lock() = false;
                tracing::warn!(reason, error = %err, "refresh not queued");
                false
            }
        }
    }

    fn execute(&self) -> Result<OpValue, RequestError> {
        *self.queued.lock() = false;
        let result = self.sync.refresh();
        self.executed.fetch_add(1, Ordering::Relaxed);
        let summary = result?;
        Ok(OpValue::Count(summary.total() as u64))
    }

    pub fn stats(&self) -> RefreshStats {
        RefreshStats {
            requested: self.requested.load(Ordering::Relaxed),
            queued: self.enqueued.load(Ordering::Relaxed),
            executed: self.executed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    use lvmd_core::{NullSink, ResourceRegistry};
    use lvmd_sync::testing::FakeLvm;
    use lvmd_sync::{CommandRunner, RetryPolicy};

    use crate::request::{Outcome, Timeout};
    use crate::shutdown::Shutdown;

    fn wait_until(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn bursts_collapse_while_queued_and_requeue_once_while_running() {
        let fake = Arc::new(FakeLvm::new());
        let registry = Arc::new(ResourceRegistry::new(Arc::new(NullSink)));
        let runner = Arc::new(CommandRunner::new(fake.clone(), RetryPolicy::default()));
        let sync = Arc::new(StateSync::new(runner, registry.clone()));
        let shutdown = Shutdown::new();
        let processor = RequestProcessor::start(registry, 1, shutdown.clone());
        let refresh = RefreshCoalescer::new(sync, processor.clone());

        // Hold the single worker so requests pile up behind it.
        let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
        let gate = processor
            .submit("Gate", Timeout::Blocking, move || {
                let _ = release_rx.recv();
                Ok(OpValue::Unit)
            })
            .expect("gate");

        assert!(refresh.request("udev"));
        assert!(!refresh.request("udev"));
        assert!(!refresh.request("timer"));
        drop(release_tx);
        assert_eq!(gate.wait_reply(), Ok(Outcome::Value(OpValue::Unit)));
        wait_until(|| refresh.stats().executed == 1);

        // While a refresh executes, one more request is queued.
        fake.set_delay("pvs", Duration::from_millis(100));
        assert!(refresh.request("udev"));
        wait_until(|| fake.calls_of("pvs") == 2);
        assert!(refresh.request("udev"), "running refresh does not absorb new requests");
        assert!(!refresh.request("udev"));
        wait_until(|| refresh.stats().executed == 3);

        let stats = refresh.stats();
        assert_eq!(stats.requested, 6);
        assert_eq!(stats.queued, 3);

        shutdown.trigger();
        processor.join();
    }
}
