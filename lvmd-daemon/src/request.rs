//! A single queued request and its delivery contract.
//!
//! Each [`RequestEntry`] goes Queued → Executing → Completed exactly once and
//! delivers exactly one reply: the direct result, the direct error, or the
//! handle of a [`Job`] that will carry the result later. Completion and the
//! wait timer race under the entry lock; whichever runs first decides.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};

use lvmd_core::{Handle, HandleKind, Job, ManagedObject, OpValue, ResourceRegistry};

use crate::error::RequestError;

/// How long a caller is willing to wait for the direct result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Wait for the result; never produces a job.
    Blocking,
    /// Return a job right away.
    Immediate,
    /// Wait up to the duration, then fall back to a job.
    After(Duration),
}

impl Timeout {
    /// Wire form: negative blocks, zero is immediate, positive is seconds.
    pub fn from_secs(secs: i64) -> Self {
        match secs {
            s if s < 0 => Timeout::Blocking,
            0 => Timeout::Immediate,
            s => Timeout::After(Duration::from_secs(s as u64)),
        }
    }
}

/// What the caller gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Value(OpValue),
    Job(Handle),
}

pub type Reply = Result<Outcome, RequestError>;

pub type Operation = Box<dyn FnOnce() -> Result<OpValue, RequestError> + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Queued,
    Executing,
    Completed,
}

struct EntryState {
    phase: Phase,
    reply: Option<Reply>,
    delivered: bool,
    job: Option<Arc<Job>>,
    disarm: Option<Sender<()>>,
    detached: bool,
}

pub struct RequestEntry {
    method: String,
    timeout: Timeout,
    registry: Arc<ResourceRegistry>,
    operation: Mutex<Option<Operation>>,
    state: Mutex<EntryState>,
    replied: Condvar,
}

impl RequestEntry {
    /// Build an entry and apply the timeout contract: an immediate entry gets
    /// its job now, a bounded one arms its timer.
    pub fn new(
        method: impl Into<String>,
        timeout: Timeout,
        registry: Arc<ResourceRegistry>,
        operation: Operation,
    ) -> Result<Arc<Self>, RequestError> {
        let entry = Arc::new(Self {
            method: method.into(),
            timeout,
            registry,
            operation: Mutex::new(Some(operation)),
            state: Mutex::new(EntryState {
                phase: Phase::Queued,
                reply: None,
                delivered: false,
                job: None,
                disarm: None,
                detached: false,
            }),
            replied: Condvar::new(),
        });

        match timeout {
            Timeout::Blocking => {}
            Timeout::Immediate => {
                let mut state = entry.state.lock();
                let job = entry.create_job()?;
                entry.deliver(&mut state, Ok(Outcome::Job(job.handle())));
                state.job = Some(job);
            }
            Timeout::After(wait) => entry.arm_timer(wait),
        }
        Ok(entry)
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn timeout(&self) -> Timeout {
        self.timeout
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    /// The job created for this entry, if any.
    pub fn job(&self) -> Option<Arc<Job>> {
        self.state.lock().job.clone()
    }

    /// Mark the reply as unread. A failure is then logged on completion.
    pub fn detach(&self) {
        self.state.lock().detached = true;
    }

    /// Run the operation on the calling thread, catching panics.
    pub fn execute(&self) {
        let operation = {
            let mut state = self.state.lock();
            if state.phase != Phase::Queued {
                return;
            }
            state.phase = Phase::Executing;
            if let Some(job) = &state.job {
                job.mark_running();
            }
            self.operation.lock().take()
        };
        let Some(operation) = operation else {
            return;
        };

        let result = panic::catch_unwind(AssertUnwindSafe(operation))
            .unwrap_or_else(|payload| Err(RequestError::Panicked(panic_message(&*payload))));
        self.complete(result);
    }

    /// Finish the entry. Routes the result to the job if the timer already
    /// produced one, otherwise replies directly and disarms the timer.
    pub fn complete(&self, result: Result<OpValue, RequestError>) {
        let mut state = self.state.lock();
        if state.phase == Phase::Completed {
            return;
        }
        state.phase = Phase::Completed;
        state.disarm = None;
        self.operation.lock().take();

        match state.job.clone() {
            Some(job) => {
                drop(state);
                if job.complete(result.map_err(|err| err.to_job_error())) {
                    self.registry.notify_job(&job, &job.properties());
                }
            }
            None => {
                if let (true, Err(err)) = (state.detached, &result) {
                    tracing::error!(method = %self.method, code = err.code(), error = %err, "operation failed");
                }
                self.deliver(&mut state, result.map(Outcome::Value));
            }
        }
    }

    /// Timer expiry: hand the caller a job unless the result is already out.
    fn expire(&self) {
        let mut state = self.state.lock();
        if state.phase == Phase::Completed || state.delivered {
            return;
        }
        match self.create_job() {
            Ok(job) => {
                tracing::debug!(method = %self.method, job = %job.handle(), "wait expired, job created");
                if state.phase == Phase::Executing {
                    job.mark_running();
                }
                self.deliver(&mut state, Ok(Outcome::Job(job.handle())));
                state.job = Some(job);
            }
            Err(err) => {
                tracing::error!(method = %self.method, error = %err, "failed to create job");
            }
        }
    }

    /// Block until the single reply is available and take it.
    pub fn wait_reply(&self) -> Reply {
        let mut state = self.state.lock();
        loop {
            if let Some(reply) = state.reply.take() {
                return reply;
            }
            if state.delivered {
                return Err(RequestError::InvalidArgument(format!(
                    "reply for {} already taken",
                    self.method
                )));
            }
            self.replied.wait(&mut state);
        }
    }

    fn deliver(&self, state: &mut EntryState, reply: Reply) {
        debug_assert!(!state.delivered);
        state.delivered = true;
        state.reply = Some(reply);
        self.replied.notify_all();
    }

    fn create_job(&self) -> Result<Arc<Job>, RequestError> {
        create_job(&self.registry)
    }

    fn arm_timer(self: &Arc<Self>, wait: Duration) {
        let (disarm_tx, disarm_rx) = bounded::<()>(0);
        self.state.lock().disarm = Some(disarm_tx);
        let entry = Arc::downgrade(self);
        thread::spawn(move || {
            if let Err(RecvTimeoutError::Timeout) = disarm_rx.recv_timeout(wait) {
                if let Some(entry) = entry.upgrade() {
                    entry.expire();
                }
            }
        });
    }
}

/// Mint, construct and register a job.
pub fn create_job(registry: &ResourceRegistry) -> Result<Arc<Job>, RequestError> {
    let job = Arc::new(Job::new(registry.mint(HandleKind::Job)));
    registry.register(ManagedObject::job(job.clone()), true)?;
    Ok(job)
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
