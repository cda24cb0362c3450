use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Lines, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use lvmd_core::Handle;

use crate::error::{io_err, DaemonError};

/// JSON newline-delimited request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub args: Value,
    /// Seconds: -1 blocks, 0 returns a job at once, positive waits that
    /// long before handing back a job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<i64>,
}

impl DaemonRequest {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Value::Null,
            timeout: None,
        }
    }

    pub fn with_args<T: Serialize>(mut self, args: &T) -> Result<Self, DaemonError> {
        self.args = serde_json::to_value(args)?;
        Ok(self)
    }

    pub fn with_timeout(mut self, timeout: Option<i64>) -> Self {
        self.timeout = timeout;
        self
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Numeric error code for failed operations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
            code: None,
        }
    }

    pub fn failure(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            ..Self::error(message)
        }
    }
}

// ---------------------------------------------------------------------------
// Arguments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandleArgs {
    pub handle: Handle,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetArgs {
    pub handle: Handle,
    pub property: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupArgs {
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobWaitArgs {
    pub handle: Handle,
    /// Seconds; absent or negative waits indefinitely.
    #[serde(default)]
    pub seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalEventArgs {
    pub event: String,
    pub lvm_id: String,
    pub lvm_uuid: String,
    pub seqno: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvCreateArgs {
    pub device: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgCreateArgs {
    pub name: String,
    pub pvs: Vec<Handle>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgRenameArgs {
    pub vg: Handle,
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveArgs {
    pub handle: Handle,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LvCreateArgs {
    pub vg: Handle,
    pub name: String,
    pub size_bytes: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LvMoveArgs {
    pub lv: Handle,
    pub src: Handle,
    #[serde(default)]
    pub dest: Option<Handle>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgExtendArgs {
    pub vg: Handle,
    pub pvs: Vec<Handle>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VgReduceArgs {
    pub vg: Handle,
    /// Empty drops every unused PV.
    #[serde(default)]
    pub pvs: Vec<Handle>,
    #[serde(default)]
    pub missing: bool,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LvRenameArgs {
    pub lv: Handle,
    pub name: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LvSnapshotArgs {
    pub lv: Handle,
    pub name: String,
    /// Zero picks a default for thick origins.
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LvResizeArgs {
    pub lv: Handle,
    pub size_bytes: u64,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvMoveArgs {
    pub src: Handle,
    #[serde(default)]
    pub dest: Option<Handle>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning {
            socket: socket.to_path_buf(),
        });
    }

    UnixStream::connect(socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.to_path_buf(),
            }
        } else {
            io_err(socket, err)
        }
    })
}

fn write_request(
    stream: &mut UnixStream,
    socket: &Path,
    request: &DaemonRequest,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(request)?;
    stream
        .write_all(payload.as_bytes())
        .map_err(|e| io_err(socket, e))?;
    stream.write_all(b"\n").map_err(|e| io_err(socket, e))?;
    stream.flush().map_err(|e| io_err(socket, e))
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(socket: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let mut stream = connect(socket)?;
    write_request(&mut stream, socket, request)?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    let read = reader
        .read_line(&mut line)
        .map_err(|e| io_err(socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    let response: DaemonResponse = serde_json::from_str(line.trim_end())?;
    Ok(response)
}

/// Send a request and unwrap the response payload.
pub fn call(socket: &Path, request: &DaemonRequest) -> Result<Value, DaemonError> {
    response_into_data(send_request(socket, request)?)
}

/// Status, retried briefly so a just-started daemon has time to bind.
pub fn request_status(socket: &Path) -> Result<Value, DaemonError> {
    let request = DaemonRequest::new("status");

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request(socket, &request) {
            Ok(response) => return response_into_data(response),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(socket: &Path) -> Result<(), DaemonError> {
    call(socket, &DaemonRequest::new("stop")).map(|_| ())
}

/// Open an event subscription. The daemon acknowledges once, then writes
/// one JSON object event per line until the connection closes.
pub fn open_subscription(socket: &Path) -> Result<Subscription, DaemonError> {
    let mut stream = connect(socket)?;
    write_request(&mut stream, socket, &DaemonRequest::new("subscribe"))?;

    let mut lines = BufReader::new(stream).lines();
    let ack = lines
        .next()
        .ok_or_else(|| DaemonError::Protocol("subscription closed before acknowledgement".into()))?
        .map_err(|e| io_err(socket, e))?;
    response_into_data(serde_json::from_str(&ack)?)?;
    Ok(Subscription { lines })
}

pub struct Subscription {
    lines: Lines<BufReader<UnixStream>>,
}

impl Iterator for Subscription {
    type Item = Result<Value, DaemonError>;

    fn next(&mut self) -> Option<Self::Item> {
        let line = match self.lines.next()? {
            Ok(line) => line,
            Err(err) => return Some(Err(DaemonError::Protocol(err.to_string()))),
        };
        Some(serde_json::from_str(&line).map_err(DaemonError::from))
    }
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        let message = response
            .error
            .unwrap_or_else(|| "unknown daemon error".to_string());
        Err(DaemonError::Protocol(match response.code {
            Some(code) => format!("{message} (code {code})"),
            None => message,
        }))
    }
}
