//! Long-running operation tracking.
//!
//! A [`Job`] is created when a request outlives its caller's wait budget, or
//! when an operation is inherently asynchronous (volume moves). Completion is
//! one-way: once complete, percent, result and error are frozen.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;

use crate::schema::PropertyType;
use crate::types::{Handle, OpValue, PropertyBag, PropertyValue};

/// Failure recorded on a job: exit code plus message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobError {
    pub code: i32,
    pub message: String,
}

impl JobError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Complete,
}

#[derive(Debug, Default)]
struct JobState {
    percent: u8,
    running: bool,
    complete: bool,
    result: Option<OpValue>,
    error: Option<JobError>,
}

/// Introspection rows for jobs.
pub const JOB_PROPERTY_TYPES: &[(&str, PropertyType)] = &[
    ("Percent", PropertyType::Byte),
    ("Complete", PropertyType::Bool),
    ("Result", PropertyType::Variant),
    ("GetError", PropertyType::Status),
];

#[derive(Debug)]
pub struct Job {
    handle: Handle,
    created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    completed: Condvar,
}

impl Job {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            created_at: Utc::now(),
            state: Mutex::new(JobState::default()),
            completed: Condvar::new(),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn percent(&self) -> u8 {
        self.state.lock().percent
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }

    pub fn status(&self) -> JobStatus {
        let state = self.state.lock();
        if state.complete {
            JobStatus::Complete
        } else if state.running {
            JobStatus::Running
        } else {
            JobStatus::Pending
        }
    }

    pub fn mark_running(&self) {
        self.state.lock().running = true;
    }

    /// Record progress. Values above 100 are clamped; updates after
    /// completion are ignored. Returns whether the value changed.
    pub fn set_percent(&self, percent: u8) -> bool {
        let mut state = self.state.lock();
        if state.complete {
            return false;
        }
        let percent = percent.min(100);
        state.running = true;
        let changed = state.percent != percent;
        state.percent = percent;
        changed
    }

    /// Finish the job. Only the first call has any effect; later calls return
    /// `false`. Wakes every waiter.
    pub fn complete(&self, outcome: Result<OpValue, JobError>) -> bool {
        let mut state = self.state.lock();
        if state.complete {
            return false;
        }
        state.percent = 100;
        state.complete = true;
        match outcome {
            Ok(value) => state.result = Some(value),
            Err(err) => state.error = Some(err),
        }
        drop(state);
        self.completed.notify_all();
        true
    }

    pub fn result(&self) -> Option<OpValue> {
        self.state.lock().result.clone()
    }

    pub fn error(&self) -> Option<JobError> {
        self.state.lock().error.clone()
    }

    /// `(code, message)`: `(-1, "Job is not complete!")` while running,
    /// `(0, "")` on success.
    pub fn get_error(&self) -> (i32, String) {
        let state = self.state.lock();
        if !state.complete {
            return (-1, "Job is not complete!".to_string());
        }
        match &state.error {
            Some(err) => (err.code, err.message.clone()),
            None => (0, String::new()),
        }
    }

    /// Block until complete or until `timeout` elapses; `None` waits forever.
    /// Returns whether the job is complete.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while !state.complete {
                    self.completed.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.complete {
                    if self.completed.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        state.complete
    }

    pub fn properties(&self) -> PropertyBag {
        let (code, message) = self.get_error();
        let state = self.state.lock();
        let result = match &state.result {
            Some(OpValue::Handle(handle)) => PropertyValue::Path(Some(*handle)),
            Some(OpValue::Count(count)) => PropertyValue::U64(*count),
            Some(OpValue::Unit) | None => PropertyValue::Path(None),
        };
        let mut bag = PropertyBag::new();
        bag.insert("Percent", PropertyValue::Byte(state.percent));
        bag.insert("Complete", PropertyValue::Bool(state.complete));
        bag.insert("Result", result);
        bag.insert("GetError", PropertyValue::Status(code, message));
        bag
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
