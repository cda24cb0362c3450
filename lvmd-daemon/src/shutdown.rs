//! Cancellation token shared by every blocking loop.
//!
//! The token is a crossbeam channel that never carries a message: triggering
//! drops the only sender, so every `recv` on the receiver returns at once.
//! Worker threads put [`Shutdown::receiver`] into their `select!`.

use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;

#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: Receiver<()>,
    tx: Arc<Mutex<Option<Sender<()>>>>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            rx,
            tx: Arc::new(Mutex::new(Some(tx))),
        }
    }

    /// Idempotent.
    pub fn trigger(&self) {
        if self.tx.lock().take().is_some() {
            tracing::debug!("shutdown triggered");
        }
    }

    pub fn is_triggered(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    pub fn receiver(&self) -> &Receiver<()> {
        &self.rx
    }

    /// Sleep up to `timeout`; returns true as soon as shutdown is triggered.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        !matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());

        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let triggered = shutdown.wait_timeout(Duration::from_secs(10));
                (triggered, started.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(20));
        shutdown.trigger();
        shutdown.trigger();

        let (triggered, waited) = waiter.join().expect("join");
        assert!(triggered);
        assert!(waited < Duration::from_secs(5));
        assert!(shutdown.is_triggered());
    }

    #[test]
    fn wait_times_out_when_not_triggered() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait_timeout(Duration::from_millis(5)));
    }
}
