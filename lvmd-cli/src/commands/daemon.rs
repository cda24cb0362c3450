//! `lvmd start|stop|status|refresh|events`: daemon lifecycle and control.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use serde_json::{json, Value};

use lvmd_daemon::paths::default_config_path;
use lvmd_daemon::{
    open_subscription, request_status, request_stop, start_blocking, DaemonConfig, DaemonError,
    Overrides,
};

use super::{outcome_line, print_json, Client};

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Refresh when block devices appear or disappear.
    #[arg(long)]
    pub udev: bool,

    /// Seconds a move may show no progress before it is finalized.
    #[arg(long, value_name = "SECS")]
    pub stall_grace: Option<u64>,

    /// The lvm binary to run.
    #[arg(long)]
    pub lvm_binary: Option<PathBuf>,

    /// Request worker threads.
    #[arg(long)]
    pub workers: Option<usize>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(long)]
    pub debug: bool,
}

impl StartArgs {
    pub fn run(self, socket: Option<PathBuf>) -> Result<()> {
        let config = self.config()?;
        let overrides = Overrides {
            lvm_binary: self.lvm_binary,
            socket_path: socket,
            use_event_watch: self.udev.then_some(true),
            stall_grace_secs: self.stall_grace,
            workers: self.workers,
            debug: self.debug,
        };
        let config = config
            .with_overrides(overrides)
            .context("invalid daemon configuration")?;
        start_blocking(config).context("daemon exited with error")
    }

    fn config(&self) -> Result<DaemonConfig> {
        let path = self.config.clone().unwrap_or_else(default_config_path);
        DaemonConfig::load(&path).with_context(|| format!("failed to load {}", path.display()))
    }
}

pub fn stop(client: &Client) -> Result<()> {
    match request_stop(client.socket()) {
        Ok(()) => println!("daemon stop requested"),
        Err(DaemonError::DaemonNotRunning { .. }) => println!("daemon is not running"),
        Err(err) => return Err(err).context("failed to stop daemon"),
    }
    Ok(())
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

impl StatusArgs {
    pub fn run(self, client: &Client) -> Result<()> {
        let status = match request_status(client.socket()) {
            Ok(status) => status,
            Err(DaemonError::DaemonNotRunning { .. }) => json!({
                "running": false,
                "socket": client.socket().display().to_string(),
            }),
            Err(err) => return Err(err).context("failed to query daemon status"),
        };
        if self.json {
            return print_json(&status);
        }
        print_summary(&status);
        Ok(())
    }
}

fn print_summary(status: &Value) {
    if status["running"] != json!(true) {
        println!("{} ({})", "lvmd is not running".red(), status["socket"].as_str().unwrap_or("?"));
        return;
    }
    let objects = &status["objects"];
    println!(
        "lvmd v{} | {} | up {}s | {} worker(s)",
        env!("CARGO_PKG_VERSION"),
        "running".green(),
        status["uptime_secs"],
        status["workers"],
    );
    println!(
        "{} PVs | {} VGs | {} LVs ({} hidden) | {} jobs | {} active moves",
        objects["pvs"], objects["vgs"], objects["lvs"], objects["hidden_lvs"], objects["jobs"],
        status["active_moves"],
    );
    println!(
        "lvm commands: {} run, {:.2}s total | refreshes: {} executed of {} requested",
        status["commands"]["count"],
        status["commands"]["total_secs"].as_f64().unwrap_or(0.0),
        status["refresh"]["executed"],
        status["refresh"]["requested"],
    );
}

#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// Seconds to wait: -1 blocks, 0 returns a job immediately.
    #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
    pub timeout: i64,
}

impl RefreshArgs {
    pub fn run(self, client: &Client) -> Result<()> {
        let outcome = client.call("refresh", Value::Null, Some(self.timeout))?;
        match outcome.get("value").and_then(Value::as_u64) {
            Some(changes) => println!("refresh applied {changes} change(s)"),
            None => println!("{}", outcome_line(&outcome)),
        }
        Ok(())
    }
}

pub fn events(client: &Client) -> Result<()> {
    let subscription = open_subscription(client.socket()).context("failed to subscribe")?;
    for event in subscription {
        let event = event.context("event stream failed")?;
        let kind = event["event"].as_str().unwrap_or("event");
        let handle = event["handle"].as_str().unwrap_or("?");
        let detail = match kind {
            "properties_changed" => event["changed"].to_string(),
            "object_added" => event["properties"]["Name"].to_string(),
            _ => String::new(),
        };
        let kind = match kind {
            "object_added" => kind.green(),
            "object_removed" => kind.red(),
            _ => kind.yellow(),
        };
        println!("{kind} {handle} {detail}");
    }
    Ok(())
}
