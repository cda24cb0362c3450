//! External command execution.
//!
//! [`Executor`] is the seam to the lvm tool; [`LvmExecutor`] runs the real
//! binary. [`CommandRunner`] wraps any executor with the global execution
//! lock, timing statistics and the read-only retry policy.

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;

use crate::error::{launch_err, SyncError};

/// Exit status and captured streams of one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// A running command whose stdout is consumed line by line.
pub trait Streaming: Send {
    /// Next stdout line, or `None` once the stream is closed.
    fn next_line(&mut self) -> Option<String>;

    /// Wait for exit and return the status with captured stderr.
    fn finish(self: Box<Self>) -> Result<CommandOutput, SyncError>;
}

/// Runs lvm subcommands. `argv[0]` is the subcommand (`pvs`, `vgcreate`, ...).
pub trait Executor: Send + Sync {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput, SyncError>;

    fn spawn(&self, argv: &[String]) -> Result<Box<dyn Streaming>, SyncError>;
}

// ---------------------------------------------------------------------------
// Real binary
// ---------------------------------------------------------------------------

/// Executes through the multiplexing `lvm` binary.
#[derive(Debug, Clone)]
pub struct LvmExecutor {
    binary: PathBuf,
}

impl LvmExecutor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, argv: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(argv)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl Executor for LvmExecutor {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput, SyncError> {
        let output = self
            .command(argv)
            .output()
            .map_err(|e| launch_err(&self.binary, e))?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, argv: &[String]) -> Result<Box<dyn Streaming>, SyncError> {
        let mut child = self
            .command(argv)
            .spawn()
            .map_err(|e| launch_err(&self.binary, e))?;
        let stdout = child.stdout.take().map(BufReader::new);
        // Drained on its own thread so a chatty stderr cannot block stdout.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });
        Ok(Box::new(ChildStream {
            binary: self.binary.clone(),
            child,
            stdout,
            stderr,
        }))
    }
}

struct ChildStream {
    binary: PathBuf,
    child: Child,
    stdout: Option<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
}

impl Streaming for ChildStream {
    fn next_line(&mut self) -> Option<String> {
        let reader = self.stdout.as_mut()?;
        let mut line = String::new();
        match reader.read_line(&mut line) {
            Ok(0) | Err(_) => {
                self.stdout = None;
                None
            }
            Ok(_) => Some(line.trim_end().to_string()),
        }
    }

    fn finish(mut self: Box<Self>) -> Result<CommandOutput, SyncError> {
        self.stdout = None;
        let status = self
            .child
            .wait()
            .map_err(|e| launch_err(&self.binary, e))?;
        let stderr = self
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        Ok(CommandOutput {
            code: status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr,
        })
    }
}

// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Bounded retry for read-only queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            delay: Duration::from_millis(200),
        }
    }
}

/// Count and cumulative wall time of external invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CommandStats {
    pub count: u64,
    pub total_secs: f64,
}

/// Serializes every invocation behind one lock and keeps statistics.
pub struct CommandRunner {
    executor: Arc<dyn Executor>,
    exec_lock: Mutex<()>,
    stats: Mutex<CommandStats>,
    retry: RetryPolicy,
}

impl CommandRunner {
    pub fn new(executor: Arc<dyn Executor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            exec_lock: Mutex::new(()),
            stats: Mutex::new(CommandStats::default()),
            retry,
        }
    }

    /// Run once. Non-zero exits are returned, not turned into errors.
    pub fn run(&self, argv: &[String]) -> Result<CommandOutput, SyncError> {
        let output = {
            let _guard = self.exec_lock.lock();
            let started = Instant::now();
            tracing::debug!("exec: {}", argv.join(" "));
            let result = self.executor.execute(argv);
            let mut stats = self.stats.lock();
            stats.count += 1;
            stats.total_secs += started.elapsed().as_secs_f64();
            result?
        };

        if !output.success() {
            tracing::error!(
                "{} exited {}: {}",
                argv.join(" "),
                output.code,
                output.stderr.trim()
            );
        } else if !output.stderr.trim().is_empty() {
            tracing::warn!("{} stderr: {}", argv.join(" "), output.stderr.trim());
        }
        Ok(output)
    }

    /// Run a read-only query, retrying non-zero exits up to the policy bound.
    /// Returns stdout on success.
    ///
    /// Any non-zero exit counts as transient; stderr is not inspected. A
    /// permanent failure (bad column, missing binary) therefore uses the whole
    /// attempt budget before surfacing as [`SyncError::QueryFailed`].
    pub fn query(&self, argv: &[String]) -> Result<String, SyncError> {
        let attempts = self.retry.attempts.max(1);
        let mut last = CommandOutput::default();
        for attempt in 1..=attempts {
            last = self.run(argv)?;
            if last.success() {
                return Ok(last.stdout);
            }
            if attempt < attempts {
                tracing::debug!("retrying {} (attempt {attempt}/{attempts})", argv[0]);
                thread::sleep(self.retry.delay);
            }
        }
        Err(SyncError::QueryFailed {
            command: argv.join(" "),
            attempts,
            code: last.code,
            stderr: last.stderr.trim().to_string(),
        })
    }

    /// Launch a streaming command. Only the launch holds the execution lock;
    /// reading progress happens outside it.
    pub fn spawn(&self, argv: &[String]) -> Result<Box<dyn Streaming>, SyncError> {
        let _guard = self.exec_lock.lock();
        tracing::debug!("spawn: {}", argv.join(" "));
        let mut stats = self.stats.lock();
        stats.count += 1;
        drop(stats);
        self.executor.spawn(argv)
    }

    pub fn stats(&self) -> CommandStats {
        *self.stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLvm;

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    fn runner(fake: &Arc<FakeLvm>) -> CommandRunner {
        CommandRunner::new(
            fake.clone(),
            RetryPolicy {
                attempts: 3,
                delay: Duration::from_millis(1),
            },
        )
    }

    #[test]
    fn query_retries_transient_failures() {
        let fake = Arc::new(FakeLvm::new());
        fake.fail_next_queries(2);
        let runner = runner(&fake);

        runner.query(&argv(&["vgs"])).expect("third attempt succeeds");
        assert_eq!(runner.stats().count, 3);
    }

    #[test]
    fn query_gives_up_after_policy_bound() {
        let fake = Arc::new(FakeLvm::new());
        fake.fail_next_queries(10);
        let runner = runner(&fake);

        let err = runner.query(&argv(&["pvs"])).unwrap_err();
        assert!(
            matches!(err, SyncError::QueryFailed { attempts: 3, code: 5, .. }),
            "got: {err}"
        );
    }

    #[test]
    fn query_retries_permanent_failures_too() {
        let fake = Arc::new(FakeLvm::new());
        let runner = runner(&fake);

        let err = runner.query(&argv(&["vgdisplay"])).unwrap_err();
        assert!(matches!(err, SyncError::QueryFailed { attempts: 3, .. }), "got: {err}");
        assert_eq!(fake.calls_of("vgdisplay"), 3);
    }

    #[test]
    fn run_returns_failures_without_retrying() {
        let fake = Arc::new(FakeLvm::new());
        let runner = runner(&fake);

        let out = runner.run(&argv(&["vgremove", "-f", "nope"])).expect("run");
        assert_eq!(out.code, 5);
        assert!(out.stderr.contains("nope"));
        assert_eq!(runner.stats().count, 1);
    }
}
