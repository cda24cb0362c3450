pub mod daemon;
pub mod inspect;
pub mod job;
pub mod volumes;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use lvmd_core::{Handle, BASE_PATH, EMPTY_PATH};
use lvmd_daemon::paths::default_socket_path;
use lvmd_daemon::protocol;
use lvmd_daemon::DaemonRequest;

/// Connection settings shared by every client subcommand.
#[derive(Debug, Clone)]
pub struct Client {
    socket: PathBuf,
}

impl Client {
    pub fn new(socket: Option<PathBuf>) -> Self {
        Self {
            socket: socket.unwrap_or_else(default_socket_path),
        }
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    pub fn call(&self, cmd: &str, args: Value, timeout: Option<i64>) -> Result<Value> {
        let request = DaemonRequest {
            cmd: cmd.to_string(),
            args,
            timeout,
        };
        protocol::call(&self.socket, &request).with_context(|| format!("`{cmd}` request failed"))
    }

    /// Object path as given, or the object an lvm name or UUID refers to.
    pub fn resolve(&self, target: &str) -> Result<Handle> {
        if target.starts_with(BASE_PATH) {
            return target
                .parse()
                .with_context(|| format!("'{target}' is not a valid object path"));
        }
        let found = self.call("lookup", json!({ "key": target }), None)?;
        let path = found["handle"].as_str().unwrap_or(EMPTY_PATH);
        if path == EMPTY_PATH {
            bail!("no object named '{target}'");
        }
        path.parse()
            .with_context(|| format!("daemon returned invalid object path '{path}'"))
    }
}

pub fn print_json(value: &Value) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("failed to render JSON")?
    );
    Ok(())
}

/// Render an operation reply: either its value or the job to follow.
pub fn outcome_line(outcome: &Value) -> String {
    if let Some(job) = outcome.get("job").and_then(Value::as_str) {
        return format!("job started: {job} (follow with `lvmd job wait {job}`)");
    }
    match outcome.get("value") {
        Some(Value::String(path)) => path.clone(),
        Some(Value::Null) | None => "done".to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_rendering() {
        assert_eq!(
            outcome_line(&json!({ "job": "/com/redhat/lvmdbus1/Job/4" })),
            "job started: /com/redhat/lvmdbus1/Job/4 (follow with `lvmd job wait /com/redhat/lvmdbus1/Job/4`)"
        );
        assert_eq!(
            outcome_line(&json!({ "value": "/com/redhat/lvmdbus1/Vg/1" })),
            "/com/redhat/lvmdbus1/Vg/1"
        );
        assert_eq!(outcome_line(&json!({ "value": 3 })), "3");
        assert_eq!(outcome_line(&json!({ "value": null })), "done");
    }

    #[test]
    fn object_paths_resolve_without_a_daemon() {
        let client = Client::new(Some(PathBuf::from("/nonexistent/lvmd.sock")));
        let handle = client.resolve("/com/redhat/lvmdbus1/Lv/7").expect("path");
        assert_eq!(handle.to_string(), "/com/redhat/lvmdbus1/Lv/7");
        assert!(client.resolve("/com/redhat/lvmdbus1/Nope/1").is_err());
        assert!(client.resolve("vg0").is_err(), "names need the daemon");
    }
}
