use std::fs;
use std::io::ErrorKind;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use lvmd_core::{path_or_empty, Handle, HandleKind, Job, ManagedObject, ResourceRegistry};
use lvmd_sync::{CommandRunner, Executor, LvmExecutor, ReconcileSummary, StateSync};

use crate::config::DaemonConfig;
use crate::error::{io_err, DaemonError, RequestError};
use crate::events::BroadcastSink;
use crate::manager::Manager;
use crate::monitor::MoveMonitor;
use crate::processor::RequestProcessor;
use crate::protocol::{
    DaemonRequest, DaemonResponse, ExternalEventArgs, GetArgs, HandleArgs, JobWaitArgs, LookupArgs,
    LvCreateArgs, LvMoveArgs, LvRenameArgs, LvResizeArgs, LvSnapshotArgs, PvCreateArgs, PvMoveArgs,
    RemoveArgs, VgCreateArgs, VgExtendArgs, VgReduceArgs, VgRenameArgs,
};
use crate::refresh::RefreshCoalescer;
use crate::request::{Reply, Timeout};
use crate::shutdown::Shutdown;
use crate::watcher::watcher_task;

/// Everything one running daemon owns.
pub struct Daemon {
    config: DaemonConfig,
    manager: Arc<Manager>,
    events: BroadcastSink,
    shutdown: Shutdown,
    started_at: DateTime<Utc>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Daemon {
    /// Wire the registry, workers and move monitor around `executor`.
    pub fn new(config: DaemonConfig, executor: Arc<dyn Executor>) -> Result<Arc<Self>, DaemonError> {
        config.validate()?;
        let events = BroadcastSink::new(config.event_capacity);
        let registry = Arc::new(ResourceRegistry::new(Arc::new(events.clone())));
        let runner = Arc::new(CommandRunner::new(executor, config.retry_policy()));
        let sync = Arc::new(StateSync::new(runner, Arc::clone(&registry)));
        let shutdown = Shutdown::new();

        let processor = RequestProcessor::start(registry, config.workers, shutdown.clone());
        let monitor = MoveMonitor::new(
            Arc::clone(&sync),
            Arc::clone(&processor),
            config.monitor_config(),
            shutdown.clone(),
        );
        let refresh = RefreshCoalescer::new(Arc::clone(&sync), Arc::clone(&processor));
        let manager = Manager::new(sync, processor, Arc::clone(&monitor), refresh);
        let monitor_thread = monitor
            .spawn()
            .map_err(|e| io_err("move monitor thread", e))?;

        Ok(Arc::new(Self {
            config,
            manager,
            events,
            shutdown,
            started_at: Utc::now(),
            monitor_thread: Mutex::new(Some(monitor_thread)),
        }))
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn manager(&self) -> &Arc<Manager> {
        &self.manager
    }

    pub fn events(&self) -> &BroadcastSink {
        &self.events
    }

    fn registry(&self) -> &Arc<ResourceRegistry> {
        self.manager.registry()
    }

    /// First reconcile, before any client is served.
    pub fn initial_load(&self) -> Result<ReconcileSummary, DaemonError> {
        Ok(self.manager.sync().refresh()?)
    }

    /// Stop workers and the monitor and wait for them. Idempotent.
    pub fn teardown(&self) {
        self.shutdown.trigger();
        self.manager.processor().join();
        if let Some(handle) = self.monitor_thread.lock().take() {
            if handle.join().is_err() {
                tracing::error!("move monitor thread panicked");
            }
        }
    }

    pub fn status(&self) -> Value {
        let registry = self.registry();
        let count = |kinds: &[HandleKind]| registry.handles_of(kinds).len();
        let uptime = Utc::now().signed_duration_since(self.started_at);
        json!({
            "running": true,
            "started_at": self.started_at.to_rfc3339(),
            "uptime_secs": uptime.num_seconds(),
            "socket": self.config.socket_path.display().to_string(),
            "lvm_binary": self.config.lvm_binary.display().to_string(),
            "event_watch": self.config.use_event_watch,
            "workers": self.manager.processor().worker_count(),
            "pending_requests": self.manager.processor().pending(),
            "objects": {
                "pvs": count(&[HandleKind::Pv]),
                "vgs": count(&[HandleKind::Vg]),
                "lvs": count(&[HandleKind::Lv, HandleKind::ThinPool, HandleKind::CachePool]),
                "hidden_lvs": count(&[HandleKind::HiddenLv]),
                "jobs": count(&[HandleKind::Job]),
                "reservations": registry.reservations().len(),
            },
            "active_moves": self.manager.monitor().active(),
            "commands": self.manager.sync().runner().stats(),
            "refresh": self.manager.refresher().stats(),
        })
    }

    /// Dispatch one request. Blocks while an operation runs, so callers on an
    /// async runtime go through `spawn_blocking`.
    pub fn handle_request(&self, request: &DaemonRequest) -> DaemonResponse {
        let timeout = request.timeout.map_or(Timeout::Blocking, Timeout::from_secs);
        let manager = &self.manager;

        let result: Result<Value, RequestError> = match request.cmd.as_str() {
            "status" => Ok(self.status()),
            "list" => args::<ListArgs>(request).map(|a| self.list(a.kind.as_deref())),
            "get_all" => args::<HandleArgs>(request).and_then(|a| {
                let object = self.object(a.handle)?;
                Ok(object_json(&object))
            }),
            "get" => args::<GetArgs>(request).and_then(|a| {
                let object = self.object(a.handle)?;
                object
                    .properties()
                    .get(a.property.as_str())
                    .map(|value| json!({ "handle": a.handle, "property": a.property, "value": value }))
                    .ok_or_else(|| {
                        RequestError::InvalidArgument(format!(
                            "{} has no property '{}'",
                            a.handle, a.property
                        ))
                    })
            }),
            "introspect" => args::<HandleArgs>(request).and_then(|a| {
                let object = self.object(a.handle)?;
                let types: Vec<Value> = object
                    .property_types()
                    .into_iter()
                    .map(|(name, ty)| json!({ "name": name, "type": ty.signature() }))
                    .collect();
                Ok(json!({ "handle": a.handle, "properties": types }))
            }),
            "lookup" => args::<LookupArgs>(request)
                .map(|a| json!({ "handle": path_or_empty(manager.lookup(&a.key)) })),
            "job_wait" => args::<JobWaitArgs>(request).and_then(|a| self.job_wait(a)),
            "job_get_error" => args::<HandleArgs>(request).and_then(|a| {
                let job = self.job(a.handle)?;
                let (code, message) = job.get_error();
                Ok(json!({ "code": code, "message": message }))
            }),
            "job_remove" => args::<HandleArgs>(request).and_then(|a| {
                self.registry().remove_job(a.handle)?;
                Ok(json!({ "removed": a.handle }))
            }),
            "refresh" => reply_json(manager.refresh(timeout)),
            "external_event" => args::<ExternalEventArgs>(request).map(|a| {
                let queued = manager.external_event(&a.event, &a.lvm_id, &a.lvm_uuid, a.seqno);
                json!({ "refresh_queued": queued })
            }),
            "pv_create" => args::<PvCreateArgs>(request)
                .and_then(|a| reply_json(manager.pv_create(a.device, a.options, timeout))),
            "pv_remove" => args::<RemoveArgs>(request)
                .and_then(|a| reply_json(manager.pv_remove(a.handle, a.options, timeout))),
            "pv_move" => args::<PvMoveArgs>(request)
                .and_then(|a| reply_json(manager.pv_move(a.src, a.dest, a.options, timeout))),
            "vg_create" => args::<VgCreateArgs>(request)
                .and_then(|a| reply_json(manager.vg_create(a.name, a.pvs, a.options, timeout))),
            "vg_rename" => args::<VgRenameArgs>(request)
                .and_then(|a| reply_json(manager.vg_rename(a.vg, a.name, a.options, timeout))),
            "vg_extend" => args::<VgExtendArgs>(request)
                .and_then(|a| reply_json(manager.vg_extend(a.vg, a.pvs, a.options, timeout))),
            "vg_reduce" => args::<VgReduceArgs>(request).and_then(|a| {
                reply_json(manager.vg_reduce(a.vg, a.missing, a.pvs, a.options, timeout))
            }),
            "vg_remove" => args::<RemoveArgs>(request)
                .and_then(|a| reply_json(manager.vg_remove(a.handle, a.options, timeout))),
            "lv_create_linear" => args::<LvCreateArgs>(request).and_then(|a| {
                reply_json(manager.lv_create_linear(a.vg, a.name, a.size_bytes, a.options, timeout))
            }),
            "lv_remove" => args::<RemoveArgs>(request)
                .and_then(|a| reply_json(manager.lv_remove(a.handle, a.options, timeout))),
            "lv_rename" => args::<LvRenameArgs>(request)
                .and_then(|a| reply_json(manager.lv_rename(a.lv, a.name, a.options, timeout))),
            "lv_snapshot" => args::<LvSnapshotArgs>(request).and_then(|a| {
                reply_json(manager.lv_snapshot(a.lv, a.name, a.size_bytes, a.options, timeout))
            }),
            "lv_resize" => args::<LvResizeArgs>(request)
                .and_then(|a| reply_json(manager.lv_resize(a.lv, a.size_bytes, a.options, timeout))),
            "lv_move" => args::<LvMoveArgs>(request).and_then(|a| {
                reply_json(manager.lv_move(a.lv, a.src, a.dest, a.options, timeout))
            }),
            other => return DaemonResponse::error(format!("unknown command '{other}'")),
        };

        match result {
            Ok(data) => DaemonResponse::ok(data),
            Err(err) => {
                tracing::debug!(cmd = %request.cmd, error = %err, "request failed");
                DaemonResponse::failure(err.code(), err.to_string())
            }
        }
    }

    fn object(&self, handle: Handle) -> Result<ManagedObject, RequestError> {
        self.registry()
            .lookup_by_handle(handle)
            .ok_or_else(|| RequestError::NotFound(handle.to_string()))
    }

    fn job(&self, handle: Handle) -> Result<Arc<lvmd_core::Job>, RequestError> {
        self.registry()
            .job(handle)
            .ok_or_else(|| RequestError::NotFound(handle.to_string()))
    }

    fn list(&self, kind: Option<&str>) -> Value {
        let objects: Vec<Value> = self
            .registry()
            .objects()
            .iter()
            .filter(|o| kind.map_or(true, |k| o.handle().kind().segment().eq_ignore_ascii_case(k)))
            .map(object_json)
            .collect();
        Value::Array(objects)
    }

    fn job_wait(&self, args: JobWaitArgs) -> Result<Value, RequestError> {
        let job = self.job(args.handle)?;
        let timeout = args
            .seconds
            .filter(|secs| *secs >= 0)
            .map(|secs| Duration::from_secs(secs as u64));
        let complete = wait_job(&job, timeout, &self.shutdown);
        Ok(json!({
            "handle": args.handle,
            "complete": complete,
            "properties": job.properties(),
        }))
    }
}

/// Slice length for job waits, bounding how long shutdown goes unnoticed.
const JOB_WAIT_SLICE: Duration = Duration::from_millis(200);

/// Wait for `job` until it completes, `timeout` elapses or the daemon shuts
/// down. Returns whether the job is complete.
fn wait_job(job: &Job, timeout: Option<Duration>, shutdown: &Shutdown) -> bool {
    let deadline = timeout.map(|timeout| Instant::now() + timeout);
    loop {
        let slice = deadline.map_or(JOB_WAIT_SLICE, |deadline| {
            deadline
                .saturating_duration_since(Instant::now())
                .min(JOB_WAIT_SLICE)
        });
        if job.wait(Some(slice)) {
            return true;
        }
        let expired = deadline.map_or(false, |deadline| Instant::now() >= deadline);
        if expired || shutdown.is_triggered() {
            return job.is_complete();
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ListArgs {
    #[serde(default)]
    kind: Option<String>,
}

fn args<T: DeserializeOwned>(request: &DaemonRequest) -> Result<T, RequestError> {
    let value = if request.args.is_null() {
        json!({})
    } else {
        request.args.clone()
    };
    serde_json::from_value(value).map_err(|err| {
        RequestError::InvalidArgument(format!("arguments for '{}': {err}", request.cmd))
    })
}

fn reply_json(reply: Reply) -> Result<Value, RequestError> {
    reply.map(|outcome| json!(outcome))
}

fn object_json(object: &ManagedObject) -> Value {
    json!({
        "handle": object.handle(),
        "properties": object.properties(),
    })
}

// ---------------------------------------------------------------------------
// Async runtime
// ---------------------------------------------------------------------------

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing(config.debug);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Run the daemon against the real lvm binary.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    let executor = Arc::new(LvmExecutor::new(&config.lvm_binary));
    let daemon = Daemon::new(config, executor)?;
    serve(daemon).await
}

/// Load state, then serve the socket until stopped.
pub async fn serve(daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let result = serve_inner(Arc::clone(&daemon)).await;
    let teardown = Arc::clone(&daemon);
    tokio::task::spawn_blocking(move || teardown.teardown())
        .await
        .map_err(|err| DaemonError::Protocol(format!("teardown join error: {err}")))?;
    tracing::info!("daemon stopped");
    result
}

async fn serve_inner(daemon: Arc<Daemon>) -> Result<(), DaemonError> {
    let loader = Arc::clone(&daemon);
    let summary = tokio::task::spawn_blocking(move || loader.initial_load())
        .await
        .map_err(|err| DaemonError::Protocol(format!("initial load join error: {err}")))??;
    tracing::info!(
        objects = daemon.registry().len(),
        added = summary.added,
        "initial state loaded",
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(16);

    let socket_handle = {
        let shutdown = shutdown_tx.clone();
        let daemon = Arc::clone(&daemon);
        tokio::spawn(async move {
            let result = socket_server_task(daemon, shutdown.clone(), shutdown.subscribe()).await;
            let _ = shutdown.send(());
            result
        })
    };

    let watcher_handle = {
        let shutdown = shutdown_tx.clone();
        let enabled = daemon.config.use_event_watch;
        let paths = daemon.config.watch_paths.clone();
        let refresh = Arc::clone(daemon.manager.refresher());
        let mut shutdown_rx = shutdown.subscribe();
        tokio::spawn(async move {
            if !enabled {
                let _ = shutdown_rx.recv().await;
                return Ok(());
            }
            let result = watcher_task(paths, refresh, shutdown_rx).await;
            let _ = shutdown.send(());
            result
        })
    };

    let periodic_handle = {
        let shutdown = shutdown_tx.clone();
        let interval = daemon.config.refresh_interval();
        let refresh = Arc::clone(daemon.manager.refresher());
        tokio::spawn(async move {
            periodic_refresh_task(interval, refresh, shutdown.subscribe()).await
        })
    };

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move { signal_task(shutdown).await })
    };

    let (socket_result, watcher_result, periodic_result, signal_result) = tokio::join!(
        socket_handle,
        watcher_handle,
        periodic_handle,
        signal_handle
    );

    handle_join("socket_server", socket_result)?;
    handle_join("watcher", watcher_result)?;
    handle_join("periodic_refresh", periodic_result)?;
    handle_join("signal_handler", signal_result)?;
    Ok(())
}

async fn signal_task(shutdown: broadcast::Sender<()>) -> Result<(), DaemonError> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut shutdown_rx = shutdown.subscribe();
    let mut terminate =
        signal(SignalKind::terminate()).map_err(|e| io_err("SIGTERM handler", e))?;
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        _ = terminate.recv() => {
            tracing::info!("received SIGTERM, shutting down daemon");
            let _ = shutdown.send(());
            Ok(())
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => {
                    tracing::info!("received ctrl-c, shutting down daemon");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(DaemonError::Protocol(format!("ctrl-c handler failed: {err}"))),
            }
        }
    }
}

async fn periodic_refresh_task(
    interval: Option<Duration>,
    refresh: Arc<RefreshCoalescer>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let Some(period) = interval else {
        let _ = shutdown_rx.recv().await;
        return Ok(());
    };
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    interval.tick().await;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = interval.tick() => {
                refresh.request("periodic");
            }
        }
    }
    Ok(())
}

async fn socket_server_task(
    daemon: Arc<Daemon>,
    shutdown_tx: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let socket = daemon.config.socket_path.clone();
    if let Some(dir) = socket.parent() {
        if !dir.exists() {
            fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        }
    }
    prepare_socket_for_bind(&socket)?;

    let listener = UnixListener::bind(&socket).map_err(|e| io_err(&socket, e))?;
    set_socket_permissions(&socket)?;
    tracing::info!(socket = %socket.display(), "listening");

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            accepted = listener.accept() => {
                let (stream, _) = accepted.map_err(|e| io_err(&socket, e))?;
                let daemon = Arc::clone(&daemon);
                let shutdown_tx = shutdown_tx.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_socket_client(stream, daemon, shutdown_tx).await {
                        tracing::error!(error = %err, "socket client error");
                    }
                });
            }
        }
    }

    if socket.exists() {
        let _ = fs::remove_file(&socket);
    }
    Ok(())
}

async fn handle_socket_client(
    stream: UnixStream,
    daemon: Arc<Daemon>,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<(), DaemonError> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| io_err("daemon socket read", e))?
    {
        if line.trim().is_empty() {
            continue;
        }

        let request: DaemonRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                write_response(
                    &mut writer,
                    &DaemonResponse::error(format!("invalid request JSON: {err}")),
                )
                .await?;
                continue;
            }
        };

        match request.cmd.as_str() {
            "stop" => {
                let _ = shutdown_tx.send(());
                write_response(&mut writer, &DaemonResponse::ok(json!({ "stopping": true })))
                    .await?;
                break;
            }
            "subscribe" => {
                return stream_events(&daemon, writer, shutdown_tx.subscribe()).await;
            }
            _ => {
                let worker = Arc::clone(&daemon);
                let response = tokio::task::spawn_blocking(move || worker.handle_request(&request))
                    .await
                    .unwrap_or_else(|err| DaemonResponse::error(format!("request task failed: {err}")));
                write_response(&mut writer, &response).await?;
            }
        }
    }

    Ok(())
}

async fn stream_events(
    daemon: &Daemon,
    mut writer: OwnedWriteHalf,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    let mut events = daemon.events.subscribe();
    write_response(&mut writer, &DaemonResponse::ok(json!({ "subscribed": true }))).await?;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    let payload = serde_json::to_string(&event)?;
                    let written = async {
                        writer.write_all(payload.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                        writer.flush().await
                    }
                    .await;
                    if let Err(err) = written {
                        tracing::debug!(error = %err, "subscriber went away");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "subscriber lagging, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    Ok(())
}

fn prepare_socket_for_bind(socket: &Path) -> Result<(), DaemonError> {
    if !socket.exists() {
        return Ok(());
    }

    match StdUnixStream::connect(socket) {
        Ok(_) => {
            return Err(DaemonError::Protocol(format!(
                "daemon socket already in use: {}",
                socket.display()
            )));
        }
        Err(err) => {
            tracing::warn!(
                socket = %socket.display(),
                error = %err,
                "removing stale daemon socket before bind",
            );
        }
    }

    match fs::remove_file(socket) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(socket, err)),
    }
}

async fn write_response(
    writer: &mut OwnedWriteHalf,
    response: &DaemonResponse,
) -> Result<(), DaemonError> {
    let payload = serde_json::to_string(response)?;
    writer
        .write_all(payload.as_bytes())
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| io_err("daemon socket write", e))?;
    writer
        .flush()
        .await
        .map_err(|e| io_err("daemon socket flush", e))?;
    Ok(())
}

fn handle_join(
    task: &str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Protocol(format!(
            "{task} task join failure: {err}"
        ))),
    }
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` when asked for.
pub fn init_tracing(debug: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn set_socket_permissions(path: &Path) -> Result<(), DaemonError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(|e| io_err(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvmd_sync::testing::FakeLvm;
    use lvmd_sync::RetryPolicy;
    use tempfile::TempDir;

    fn daemon_with(fake: Arc<FakeLvm>) -> Arc<Daemon> {
        let config = DaemonConfig {
            query_retry_delay_ms: 1,
            ..DaemonConfig::default()
        };
        assert_eq!(config.retry_policy().attempts, RetryPolicy::default().attempts);
        let daemon = Daemon::new(config, fake).expect("daemon");
        daemon.initial_load().expect("load");
        daemon
    }

    fn request(cmd: &str, args: Value) -> DaemonRequest {
        DaemonRequest {
            cmd: cmd.to_string(),
            args,
            timeout: None,
        }
    }

    #[test]
    fn status_reports_counts_and_stats() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_vg("vg0", &["/dev/sda"]);
        fake.add_lv("vg0", "data", 1 << 30);
        let daemon = daemon_with(fake);

        let status = daemon.status();
        assert_eq!(status["running"], json!(true));
        assert_eq!(status["objects"]["pvs"], json!(1));
        assert_eq!(status["objects"]["vgs"], json!(1));
        assert_eq!(status["objects"]["lvs"], json!(1));
        assert_eq!(status["active_moves"], json!(0));
        assert!(status["commands"]["count"].as_u64().expect("count") >= 3);
        daemon.teardown();
    }

    #[test]
    fn get_list_lookup_and_introspect() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_vg("vg0", &["/dev/sda"]);
        let daemon = daemon_with(fake);

        let found = daemon.handle_request(&request("lookup", json!({ "key": "vg0" })));
        assert!(found.ok);
        let handle = found.data.expect("data")["handle"].clone();
        assert_eq!(handle, json!("/com/redhat/lvmdbus1/Vg/0"));

        let all = daemon.handle_request(&request("get_all", json!({ "handle": handle })));
        let data = all.data.expect("data");
        assert_eq!(data["properties"]["Name"], json!("vg0"));

        let one = daemon.handle_request(&request(
            "get",
            json!({ "handle": handle, "property": "Name" }),
        ));
        assert_eq!(one.data.expect("data")["value"], json!("vg0"));
        let absent = daemon.handle_request(&request(
            "get",
            json!({ "handle": handle, "property": "Colour" }),
        ));
        assert!(!absent.ok);

        let listed = daemon.handle_request(&request("list", json!({ "kind": "pv" })));
        assert_eq!(listed.data.expect("data").as_array().expect("array").len(), 1);

        let types = daemon.handle_request(&request("introspect", json!({ "handle": handle })));
        let props = types.data.expect("data")["properties"].clone();
        assert!(props
            .as_array()
            .expect("array")
            .iter()
            .any(|p| p["name"] == json!("Seqno")));

        let missing = daemon.handle_request(&request("lookup", json!({ "key": "nope" })));
        assert_eq!(missing.data.expect("data")["handle"], json!("/"));
        daemon.teardown();
    }

    #[test]
    fn bad_arguments_and_unknown_commands_fail_cleanly() {
        let daemon = daemon_with(Arc::new(FakeLvm::new()));

        let bad = daemon.handle_request(&request("get", json!({ "handle": "/nope" })));
        assert!(!bad.ok);
        assert!(bad.error.expect("error").contains("arguments for 'get'"));

        let unknown = daemon.handle_request(&request("frobnicate", Value::Null));
        assert_eq!(unknown.error.as_deref(), Some("unknown command 'frobnicate'"));
        daemon.teardown();
    }

    #[test]
    fn unbounded_job_wait_returns_on_teardown() {
        let daemon = daemon_with(Arc::new(FakeLvm::new()));
        let job = crate::request::create_job(daemon.registry()).expect("job");
        let waiter = {
            let daemon = Arc::clone(&daemon);
            let args = json!({ "handle": job.handle() });
            std::thread::spawn(move || daemon.handle_request(&request("job_wait", args)))
        };
        std::thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        daemon.teardown();
        let response = waiter.join().expect("waiter");
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(response.ok, "{:?}", response.error);
        assert_eq!(response.data.expect("data")["complete"], json!(false));
    }

    #[test]
    fn bounded_job_wait_gives_up_at_its_deadline() {
        let shutdown = Shutdown::new();
        let job = Job::new(Handle::new(HandleKind::Job, 0));
        let started = Instant::now();
        assert!(!wait_job(&job, Some(Duration::from_millis(300)), &shutdown));
        assert!(started.elapsed() >= Duration::from_millis(300));

        job.complete(Ok(lvmd_core::OpValue::Unit));
        assert!(wait_job(&job, Some(Duration::ZERO), &shutdown));
    }

    #[test]
    fn failed_mutation_reports_command_code() {
        let fake = Arc::new(FakeLvm::new());
        fake.fail_next("pvcreate", 5, "  Device /dev/sdz not found.");
        let daemon = daemon_with(fake);

        let response =
            daemon.handle_request(&request("pv_create", json!({ "device": "/dev/sdz" })));
        assert!(!response.ok);
        assert_eq!(response.code, Some(5));
        assert!(response.error.expect("error").contains("not found"));
        assert!(daemon.registry().reservations().is_empty());
        daemon.teardown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn socket_round_trip_status_subscribe_and_stop() {
        let dir = TempDir::new().expect("tempdir");
        let socket = dir.path().join("lvmd.sock");
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        let config = DaemonConfig {
            socket_path: socket.clone(),
            query_retry_delay_ms: 1,
            ..DaemonConfig::default()
        };
        let daemon = Daemon::new(config, fake).expect("daemon");
        let server = tokio::spawn(serve(daemon));

        let client_socket = socket.clone();
        tokio::task::spawn_blocking(move || {
            let status = crate::protocol::request_status(&client_socket).expect("status");
            assert_eq!(status["objects"]["pvs"], json!(1));

            let mut events = crate::protocol::open_subscription(&client_socket).expect("subscribe");
            let created = crate::protocol::call(
                &client_socket,
                &DaemonRequest::new("pv_create")
                    .with_args(&PvCreateArgs {
                        device: "/dev/sdb".into(),
                        options: Default::default(),
                    })
                    .expect("args"),
            )
            .expect("pv_create");
            assert_eq!(created["value"], json!("/com/redhat/lvmdbus1/Pv/1"));

            let added = events
                .by_ref()
                .map(|event| event.expect("json"))
                .find(|event| event["event"] == json!("object_added"))
                .expect("object_added event");
            assert_eq!(added["handle"], json!("/com/redhat/lvmdbus1/Pv/1"));

            crate::protocol::request_stop(&client_socket).expect("stop");
        })
        .await
        .expect("client");

        server.await.expect("join").expect("serve");
        assert!(!socket.exists(), "socket is removed on shutdown");
    }
}
