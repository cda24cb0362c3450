//! Foreground moves that stream their own progress.
//!
//! `pvmove -i 1` prints `<device>: Moved: <percent>%` once per interval. A
//! reader thread feeds those lines into the job; when the command exits the
//! final outcome is posted back onto the request queue, so registry changes
//! stay with the workers.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use lvmd_core::{Job, OpValue, ResourceRegistry};
use lvmd_sync::{CommandOutput, StateSync, Streaming};

use crate::error::RequestError;
use crate::processor::RequestProcessor;

/// Percent from one progress line, if it is one.
pub fn parse_progress(line: &str) -> Option<u8> {
    let mut parts = line.trim().splitn(3, ':');
    let _device = parts.next()?;
    let label = parts.next()?;
    let value = parts.next()?;
    if label.trim() != "Moved" {
        return None;
    }
    let percent: f64 = value.trim().trim_end_matches('%').parse().ok()?;
    Some(percent.clamp(0.0, 100.0) as u8)
}

/// Consume `stream` on its own thread, reporting into `job`.
pub fn spawn(
    stream: Box<dyn Streaming>,
    job: Arc<Job>,
    processor: Arc<RequestProcessor>,
    sync: Arc<StateSync>,
) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("lvmd-mover-{}", job.handle().id()))
        .spawn(move || follow(stream, job, processor, sync))
}

fn follow(
    mut stream: Box<dyn Streaming>,
    job: Arc<Job>,
    processor: Arc<RequestProcessor>,
    sync: Arc<StateSync>,
) {
    let registry = Arc::clone(sync.registry());
    while let Some(line) = stream.next_line() {
        match parse_progress(&line) {
            Some(percent) if percent < 100 => {
                if job.set_percent(percent) {
                    registry.notify_job(&job, &job.properties());
                }
            }
            Some(_) => {}
            None => tracing::debug!(job = %job.handle(), line = %line, "pvmove output"),
        }
    }

    let output = stream.finish().unwrap_or_else(|err| CommandOutput::failed(-1, err.to_string()));
    let guard = Unfinished {
        job: Arc::clone(&job),
        registry,
    };
    let posted = processor.post("PvMoveComplete", move || finalize(&guard.job, &sync, output));
    if let Err(err) = posted {
        tracing::warn!(job = %job.handle(), error = %err, "could not queue move completion");
    }
}

/// Travels with the queued completion. If the completion is dropped without
/// running, the job is closed out as abandoned.
struct Unfinished {
    job: Arc<Job>,
    registry: Arc<ResourceRegistry>,
}

impl Drop for Unfinished {
    fn drop(&mut self) {
        if self.job.complete(Err(RequestError::ShuttingDown.to_job_error())) {
            self.registry.notify_job(&self.job, &self.job.properties());
        }
    }
}

/// Runs on a worker.
fn finalize(job: &Job, sync: &StateSync, output: CommandOutput) -> Result<OpValue, RequestError> {
    let outcome = if output.success() {
        sync.refresh().map(|_| OpValue::Unit).map_err(RequestError::from)
    } else {
        Err(RequestError::Command {
            code: output.code,
            stderr: output.stderr.trim().to_string(),
        })
    };
    if job.complete(outcome.clone().map_err(|err| err.to_job_error())) {
        sync.registry().notify_job(job, &job.properties());
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use lvmd_core::{HandleKind, NullSink};

    use crate::request::{create_job, Timeout};
    use crate::shutdown::Shutdown;

    #[test]
    fn completion_dropped_at_shutdown_still_closes_the_job() {
        let registry = Arc::new(ResourceRegistry::new(Arc::new(NullSink)));
        let shutdown = Shutdown::new();
        let processor = RequestProcessor::start(registry.clone(), 1, shutdown.clone());
        let job = create_job(&registry).expect("job");

        processor
            .submit("Gate", Timeout::Immediate, || {
                thread::sleep(Duration::from_millis(50));
                Ok(OpValue::Unit)
            })
            .expect("gate");
        let guard = Unfinished {
            job: Arc::clone(&job),
            registry: registry.clone(),
        };
        processor
            .post("PvMoveComplete", move || {
                let _held = &guard;
                Ok(OpValue::Unit)
            })
            .expect("post");

        shutdown.trigger();
        processor.join();

        assert!(job.is_complete());
        assert_eq!(job.get_error(), (-1, "daemon is shutting down".to_string()));
        assert_eq!(registry.handles_of(&[HandleKind::Job]).len(), 2);
    }

    #[test]
    fn completion_refused_at_shutdown_still_closes_the_job() {
        let registry = Arc::new(ResourceRegistry::new(Arc::new(NullSink)));
        let shutdown = Shutdown::new();
        let processor = RequestProcessor::start(registry.clone(), 1, shutdown.clone());
        let job = create_job(&registry).expect("job");
        shutdown.trigger();

        let guard = Unfinished {
            job: Arc::clone(&job),
            registry: registry.clone(),
        };
        let posted = processor.post("PvMoveComplete", move || {
            let _held = &guard;
            Ok(OpValue::Unit)
        });

        assert_eq!(posted, Err(RequestError::ShuttingDown));
        assert!(job.is_complete());
        processor.join();
    }

    #[test]
    fn parses_progress_lines() {
        assert_eq!(parse_progress("  /dev/sda: Moved: 42.5%"), Some(42));
        assert_eq!(parse_progress("/dev/sda: Moved: 100.0%"), Some(100));
        assert_eq!(parse_progress("  Detected pvmove in progress for /dev/sda"), None);
        assert_eq!(parse_progress("/dev/sda: Checking progress before waiting every 1 seconds."), None);
        assert_eq!(parse_progress("/dev/sda: Moved: soon"), None);
    }
}
