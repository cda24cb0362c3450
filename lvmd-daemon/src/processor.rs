//! Worker pool executing queued requests.
//!
//! Any number of workers may pull from the queue, but operation bodies run
//! one at a time behind `exec_lock`: lvm tolerates a single mutating caller.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use lvmd_core::{OpValue, ResourceRegistry};

use crate::error::RequestError;
use crate::request::{Operation, Reply, RequestEntry, Timeout};
use crate::shutdown::Shutdown;

pub struct RequestProcessor {
    queue: Sender<Arc<RequestEntry>>,
    backlog: Receiver<Arc<RequestEntry>>,
    registry: Arc<ResourceRegistry>,
    shutdown: Shutdown,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl RequestProcessor {
    /// Spawn `workers` threads (at least one) pulling from a shared queue.
    pub fn start(registry: Arc<ResourceRegistry>, workers: usize, shutdown: Shutdown) -> Arc<Self> {
        let (tx, rx) = unbounded::<Arc<RequestEntry>>();
        let exec_lock = Arc::new(Mutex::new(()));
        let worker_count = workers.max(1);

        let handles = (0..worker_count)
            .map(|index| {
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                let exec_lock = Arc::clone(&exec_lock);
                thread::Builder::new()
                    .name(format!("lvmd-worker-{index}"))
                    .spawn(move || worker_loop(rx, shutdown, exec_lock))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    tracing::error!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect();

        Arc::new(Self {
            queue: tx,
            backlog: rx,
            registry,
            shutdown,
            workers: Mutex::new(handles),
            worker_count,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Requests waiting for a worker.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Enqueue an operation and return its entry. The entry's reply follows
    /// the timeout contract of [`RequestEntry::new`].
    pub fn submit<F>(&self, method: &str, timeout: Timeout, operation: F) -> Result<Arc<RequestEntry>, RequestError>
    where
        F: FnOnce() -> Result<OpValue, RequestError> + Send + 'static,
    {
        let entry = self.prepare(method, timeout, Box::new(operation))?;
        self.enqueue(entry)
    }

    fn prepare(&self, method: &str, timeout: Timeout, operation: Operation) -> Result<Arc<RequestEntry>, RequestError> {
        if self.shutdown.is_triggered() {
            return Err(RequestError::ShuttingDown);
        }
        RequestEntry::new(method, timeout, Arc::clone(&self.registry), operation)
    }

    fn enqueue(&self, entry: Arc<RequestEntry>) -> Result<Arc<RequestEntry>, RequestError> {
        tracing::debug!(method = %entry.method(), timeout = ?entry.timeout(), "request queued");
        self.queue
            .send(Arc::clone(&entry))
            .map_err(|_| RequestError::ShuttingDown)?;
        // Shutdown may have fired after the check in `prepare`, with every
        // worker already past its final drain.
        if self.shutdown.is_triggered() {
            self.drain_backlog();
        }
        Ok(entry)
    }

    /// Answer everything still queued with `ShuttingDown`.
    fn drain_backlog(&self) {
        while let Ok(entry) = self.backlog.try_recv() {
            entry.complete(Err(RequestError::ShuttingDown));
        }
    }

    /// Submit and wait for the reply.
    pub fn call<F>(&self, method: &str, timeout: Timeout, operation: F) -> Reply
    where
        F: FnOnce() -> Result<OpValue, RequestError> + Send + 'static,
    {
        self.submit(method, timeout, operation)?.wait_reply()
    }

    /// Fire and forget. Nobody reads the reply, so the entry logs a failure
    /// itself when it completes.
    pub fn post<F>(&self, method: &str, operation: F) -> Result<(), RequestError>
    where
        F: FnOnce() -> Result<OpValue, RequestError> + Send + 'static,
    {
        let entry = self.prepare(method, Timeout::Blocking, Box::new(operation))?;
        entry.detach();
        self.enqueue(entry).map(|_| ())
    }

    /// Wait for every worker to exit. Call after triggering shutdown.
    pub fn join(&self) {
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
        self.drain_backlog();
    }
}

fn worker_loop(rx: Receiver<Arc<RequestEntry>>, shutdown: Shutdown, exec_lock: Arc<Mutex<()>>) {
    loop {
        select! {
            recv(shutdown.receiver()) -> _ => break,
            recv(rx) -> message => match message {
                Ok(entry) => run_entry(&entry, &exec_lock),
                Err(_) => break,
            },
        }
    }

    // Nobody will run what is still queued; release its waiters.
    while let Ok(entry) = rx.try_recv() {
        entry.complete(Err(RequestError::ShuttingDown));
    }
    tracing::debug!("worker exiting");
}

fn run_entry(entry: &RequestEntry, exec_lock: &Mutex<()>) {
    let _guard = exec_lock.lock();
    tracing::debug!(method = %entry.method(), "executing");
    entry.execute();
    if let Some(job) = entry.job() {
        if let Some(err) = job.error() {
            tracing::error!(method = %entry.method(), job = %job.handle(), code = err.code, error = %err.message, "job failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    use lvmd_core::NullSink;

    use crate::request::{Outcome, Phase};

    fn processor(workers: usize) -> (Arc<RequestProcessor>, Shutdown, Arc<ResourceRegistry>) {
        let registry = Arc::new(ResourceRegistry::new(Arc::new(NullSink)));
        let shutdown = Shutdown::new();
        let processor = RequestProcessor::start(registry.clone(), workers, shutdown.clone());
        (processor, shutdown, registry)
    }

    #[test]
    fn operations_never_overlap_across_workers() {
        let (processor, shutdown, _) = processor(4);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let entries: Vec<_> = (0..8)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                processor
                    .submit("Slow", Timeout::Blocking, move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(5));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(OpValue::Unit)
                    })
                    .expect("submit")
            })
            .collect();
        for entry in entries {
            assert_eq!(entry.wait_reply(), Ok(Outcome::Value(OpValue::Unit)));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);

        shutdown.trigger();
        processor.join();
    }

    #[test]
    fn worker_survives_a_panicking_operation() {
        let (processor, shutdown, _) = processor(1);
        let reply = processor.call("Explode", Timeout::Blocking, || panic!("bad state"));
        assert_eq!(reply, Err(RequestError::Panicked("bad state".into())));

        let reply = processor.call("After", Timeout::Blocking, || Ok(OpValue::Count(2)));
        assert_eq!(reply, Ok(Outcome::Value(OpValue::Count(2))));

        shutdown.trigger();
        processor.join();
    }

    #[test]
    fn shutdown_rejects_new_work_and_releases_queued_waiters() {
        let (processor, shutdown, _) = processor(1);
        let gate = processor
            .submit("Gate", Timeout::Blocking, || {
                thread::sleep(Duration::from_millis(50));
                Ok(OpValue::Unit)
            })
            .expect("submit");
        let queued = processor
            .submit("Queued", Timeout::Blocking, || Ok(OpValue::Unit))
            .expect("submit");

        thread::sleep(Duration::from_millis(10));
        shutdown.trigger();
        let started = Instant::now();
        processor.join();

        assert_eq!(gate.wait_reply(), Ok(Outcome::Value(OpValue::Unit)));
        let queued_reply = queued.wait_reply();
        assert!(
            queued_reply == Err(RequestError::ShuttingDown) || queued_reply == Ok(Outcome::Value(OpValue::Unit)),
            "got: {queued_reply:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(
            processor.call("Late", Timeout::Blocking, || Ok(OpValue::Unit)),
            Err(RequestError::ShuttingDown)
        );
    }

    #[test]
    fn submissions_racing_shutdown_are_always_answered() {
        let (processor, shutdown, _) = processor(2);
        let submitters: Vec<_> = (0..4)
            .map(|_| {
                let processor = processor.clone();
                thread::spawn(move || {
                    (0..500)
                        .map_while(|_| processor.submit("Racer", Timeout::Blocking, || Ok(OpValue::Unit)).ok())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(2));
        shutdown.trigger();
        processor.join();

        for submitter in submitters {
            for entry in submitter.join().expect("submitter") {
                assert_eq!(entry.phase(), Phase::Completed, "entry left unanswered");
                let reply = entry.wait_reply();
                assert!(
                    reply == Ok(Outcome::Value(OpValue::Unit)) || reply == Err(RequestError::ShuttingDown),
                    "got: {reply:?}"
                );
            }
        }
    }
}
