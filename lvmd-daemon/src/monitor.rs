//! Background move tracking.
//!
//! Moves started with `pvmove --background` detach from the caller, so the
//! monitor polls lvm for the set of running relocations and drives each
//! tracked job from it. A relocation that disappears, or that stops making
//! progress for longer than the stall grace window, completes its job and
//! queues one reconciliation through the request processor.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{select, unbounded, Receiver, Sender};
use parking_lot::Mutex;

use lvmd_core::{Job, OpValue};
use lvmd_sync::{inventory, MoveStatus, StateSync, SyncError};

use crate::error::RequestError;
use crate::processor::RequestProcessor;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Wake interval when nothing is tracked.
    pub idle_interval: Duration,
    /// Poll interval while moves are tracked.
    pub active_interval: Duration,
    /// How long a move may report no progress before it is finalized.
    pub stall_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(5),
            active_interval: Duration::from_secs(1),
            stall_grace: Duration::from_secs(60),
        }
    }
}

struct Tracked {
    job: Arc<Job>,
    src_dev: String,
    dest_dev: String,
    last_progress: Instant,
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    pub updated: usize,
    pub finished: Vec<String>,
    pub stalled: Vec<String>,
    pub refresh_queued: bool,
}

pub struct MoveMonitor {
    sync: Arc<StateSync>,
    processor: Arc<RequestProcessor>,
    config: MonitorConfig,
    shutdown: Shutdown,
    tracked: Mutex<HashMap<String, Tracked>>,
    kick_tx: Sender<()>,
    kick_rx: Receiver<()>,
}

impl MoveMonitor {
    pub fn new(
        sync: Arc<StateSync>,
        processor: Arc<RequestProcessor>,
        config: MonitorConfig,
        shutdown: Shutdown,
    ) -> Arc<Self> {
        let (kick_tx, kick_rx) = unbounded();
        Arc::new(Self {
            sync,
            processor,
            config,
            shutdown,
            tracked: Mutex::new(HashMap::new()),
            kick_tx,
            kick_rx,
        })
    }

    /// Start the polling thread.
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let monitor = Arc::clone(self);
        thread::Builder::new()
            .name("lvmd-move-monitor".into())
            .spawn(move || monitor.run())
    }

    /// Wake the loop now instead of at the next interval.
    pub fn kick(&self) {
        let _ = self.kick_tx.send(());
    }

    /// Attach `job` to the relocation reported under `key`.
    pub fn track(&self, key: impl Into<String>, status: &MoveStatus, job: Arc<Job>) {
        let key = key.into();
        tracing::info!(key = %key, job = %job.handle(), src = %status.src_dev, "tracking move");
        job.mark_running();
        self.tracked.lock().insert(
            key,
            Tracked {
                job,
                src_dev: status.src_dev.clone(),
                dest_dev: status.dest_dev.clone(),
                last_progress: Instant::now(),
            },
        );
        self.kick();
    }

    pub fn is_tracked(&self, key: &str) -> bool {
        self.tracked.lock().contains_key(key)
    }

    pub fn active(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Current relocations as reported by lvm.
    pub fn current_moves(&self) -> Result<BTreeMap<String, MoveStatus>, SyncError> {
        inventory::fetch_moves(self.sync.runner())
    }

    fn run(&self) {
        loop {
            let wait = if self.active() == 0 {
                self.config.idle_interval
            } else {
                self.config.active_interval
            };
            select! {
                recv(self.shutdown.receiver()) -> _ => break,
                recv(self.kick_rx) -> _ => {},
                default(wait) => {},
            }
            while self.kick_rx.try_recv().is_ok() {}

            if self.active() == 0 {
                continue;
            }
            if let Err(err) = self.poll() {
                tracing::warn!(error = %err, "move status poll failed, retrying next cycle");
            }
        }
        self.abandon_tracked();
        tracing::debug!("move monitor exiting");
    }

    /// Nobody will poll these again; end their jobs so waiters return.
    fn abandon_tracked(&self) {
        let abandoned: Vec<(String, Tracked)> = self.tracked.lock().drain().collect();
        let registry = self.sync.registry();
        for (key, entry) in abandoned {
            tracing::warn!(key = %key, job = %entry.job.handle(), "move still running at shutdown, job abandoned");
            if entry.job.complete(Err(RequestError::ShuttingDown.to_job_error())) {
                registry.notify_job(&entry.job, &entry.job.properties());
            }
        }
    }

    /// One iteration: refresh percentages, finalize vanished or stalled moves.
    pub fn poll(&self) -> Result<PollReport, SyncError> {
        let moves = self.current_moves()?;
        Ok(self.apply(&moves, Instant::now()))
    }

    fn apply(&self, moves: &BTreeMap<String, MoveStatus>, now: Instant) -> PollReport {
        let mut report = PollReport::default();
        let registry = self.sync.registry();
        let done: Vec<(String, Tracked)> = {
            let mut tracked = self.tracked.lock();
            for (key, entry) in tracked.iter_mut() {
                let Some(status) = moves.get(key) else {
                    report.finished.push(key.clone());
                    continue;
                };
                let percent = status.percent.clamp(0.0, 100.0) as u8;
                if percent > entry.job.percent() && entry.job.set_percent(percent) {
                    entry.last_progress = now;
                    report.updated += 1;
                    registry.notify_job(&entry.job, &entry.job.properties());
                } else if now.duration_since(entry.last_progress) > self.config.stall_grace {
                    report.stalled.push(key.clone());
                }
            }
            report
                .finished
                .iter()
                .chain(&report.stalled)
                .filter_map(|key| tracked.remove(key).map(|t| (key.clone(), t)))
                .collect()
        };

        for (key, entry) in &done {
            if report.stalled.contains(key) {
                tracing::warn!(key = %key, job = %entry.job.handle(), "move made no progress within grace window, finalizing");
            } else {
                tracing::info!(key = %key, src = %entry.src_dev, dest = %entry.dest_dev, "move finished");
            }
            if entry.job.complete(Ok(OpValue::Unit)) {
                registry.notify_job(&entry.job, &entry.job.properties());
            }
        }

        if !done.is_empty() {
            let sync = Arc::clone(&self.sync);
            let posted = self.processor.post("MoveComplete", move || {
                let summary = sync.refresh()?;
                Ok(OpValue::Count(summary.total() as u64))
            });
            match posted {
                Ok(()) => report.refresh_queued = true,
                Err(err) => tracing::warn!(error = %err, "could not queue refresh after move"),
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvmd_core::{NullSink, ResourceRegistry};
    use lvmd_sync::testing::FakeLvm;
    use lvmd_sync::{CommandRunner, RetryPolicy};

    use crate::request::create_job;

    struct Fixture {
        fake: Arc<FakeLvm>,
        monitor: Arc<MoveMonitor>,
        shutdown: Shutdown,
        processor: Arc<RequestProcessor>,
    }

    fn fixture(stall_grace: Duration) -> Fixture {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_pv("/dev/sdb");
        fake.add_vg("vg0", &["/dev/sda", "/dev/sdb"]);
        fake.add_lv("vg0", "data", 8 << 20);
        let registry = Arc::new(ResourceRegistry::new(Arc::new(NullSink)));
        let runner = Arc::new(CommandRunner::new(fake.clone(), RetryPolicy::default()));
        let sync = Arc::new(StateSync::new(runner, registry.clone()));
        let shutdown = Shutdown::new();
        let processor = RequestProcessor::start(registry, 1, shutdown.clone());
        let monitor = MoveMonitor::new(
            sync,
            processor.clone(),
            MonitorConfig {
                stall_grace,
                ..MonitorConfig::default()
            },
            shutdown.clone(),
        );
        Fixture {
            fake,
            monitor,
            shutdown,
            processor,
        }
    }

    fn track_new_move(f: &Fixture) -> Arc<Job> {
        let key = f.fake.start_move("/dev/sda", "/dev/sdb");
        let job = create_job(f.monitor.sync.registry()).expect("job");
        let status = MoveStatus {
            key: key.clone(),
            src_dev: "/dev/sda".into(),
            dest_dev: "/dev/sdb".into(),
            percent: 0.0,
        };
        f.monitor.track(key, &status, job.clone());
        job
    }

    #[test]
    fn vanished_move_completes_job_once_and_queues_one_refresh() {
        let f = fixture(Duration::from_secs(60));
        f.fake.set_move_step(50.0);
        let job = track_new_move(&f);

        let first = f.monitor.poll().expect("poll");
        assert_eq!(first.updated, 1);
        assert_eq!(job.percent(), 50);
        assert!(!job.is_complete());

        let second = f.monitor.poll().expect("poll");
        assert_eq!(second.finished.len(), 1);
        assert!(second.refresh_queued);
        assert!(job.is_complete());
        assert_eq!(job.percent(), 100);
        assert_eq!(job.get_error(), (0, String::new()));

        let third = f.monitor.poll().expect("poll");
        assert_eq!(third, PollReport::default());
        assert_eq!(f.monitor.active(), 0);

        f.shutdown.trigger();
        f.processor.join();
    }

    #[test]
    fn stalled_move_is_finalized_after_grace() {
        let f = fixture(Duration::from_millis(20));
        f.fake.set_move_step(10.0);
        let job = track_new_move(&f);
        f.monitor.poll().expect("poll");
        f.fake.stall_moves();

        let later = Instant::now() + Duration::from_millis(50);
        let moves = f.monitor.current_moves().expect("moves");
        assert_eq!(moves.len(), 1, "still reported by lvm");
        let report = f.monitor.apply(&moves, later);

        assert_eq!(report.stalled.len(), 1);
        assert!(job.is_complete());
        assert_eq!(f.monitor.active(), 0);

        f.shutdown.trigger();
        f.processor.join();
    }

    #[test]
    fn loop_exits_promptly_on_shutdown() {
        let f = fixture(Duration::from_secs(60));
        let handle = f.monitor.spawn().expect("spawn");
        let started = Instant::now();
        f.shutdown.trigger();
        handle.join().expect("join");
        assert!(started.elapsed() < Duration::from_secs(2));
        f.processor.join();
    }

    #[test]
    fn shutdown_completes_moves_still_tracked() {
        let f = fixture(Duration::from_secs(60));
        f.fake.stall_moves();
        let job = track_new_move(&f);
        let handle = f.monitor.spawn().expect("spawn");

        f.shutdown.trigger();
        handle.join().expect("join");

        assert!(job.is_complete());
        assert!(job.wait(Some(Duration::from_millis(10))));
        assert_eq!(job.get_error(), (-1, RequestError::ShuttingDown.to_string()));
        assert_eq!(f.monitor.active(), 0);
        f.processor.join();
    }
}
