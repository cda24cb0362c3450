//! The operations exposed to clients.
//!
//! Argument checks that need no registry state happen before submission and
//! fail directly. Everything else runs on a request worker: look up the
//! targets, reserve a handle for anything being created, run the lvm command,
//! then reconcile so the registry reflects the result.

use std::collections::BTreeMap;
use std::sync::Arc;

use lvmd_core::{Handle, HandleKind, LvState, ManagedObject, OpValue, ResourceRegistry, ResourceState};
use lvmd_sync::{commands, ReconcileSummary, StateSync};

use crate::error::RequestError;
use crate::monitor::MoveMonitor;
use crate::mover;
use crate::processor::RequestProcessor;
use crate::refresh::RefreshCoalescer;
use crate::request::{create_job, Outcome, Reply, Timeout};
use crate::validate;

/// Extra lvm flags supplied by the caller.
pub type Options = BTreeMap<String, String>;

pub struct Manager {
    sync: Arc<StateSync>,
    processor: Arc<RequestProcessor>,
    monitor: Arc<MoveMonitor>,
    refresh: Arc<RefreshCoalescer>,
}

impl Manager {
    pub fn new(
        sync: Arc<StateSync>,
        processor: Arc<RequestProcessor>,
        monitor: Arc<MoveMonitor>,
        refresh: Arc<RefreshCoalescer>,
    ) -> Arc<Self> {
        Arc::new(Self {
            sync,
            processor,
            monitor,
            refresh,
        })
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        self.sync.registry()
    }

    pub fn sync(&self) -> &Arc<StateSync> {
        &self.sync
    }

    pub fn processor(&self) -> &Arc<RequestProcessor> {
        &self.processor
    }

    pub fn monitor(&self) -> &Arc<MoveMonitor> {
        &self.monitor
    }

    pub fn refresher(&self) -> &Arc<RefreshCoalescer> {
        &self.refresh
    }

    fn submit<F>(self: &Arc<Self>, method: &str, timeout: Timeout, op: F) -> Reply
    where
        F: FnOnce(&Manager) -> Result<OpValue, RequestError> + Send + 'static,
    {
        let me = Arc::clone(self);
        self.processor.call(method, timeout, move || op(&me))
    }

    // -----------------------------------------------------------------------
    // Physical volumes
    // -----------------------------------------------------------------------

    pub fn pv_create(self: &Arc<Self>, device: String, options: Options, timeout: Timeout) -> Reply {
        validate::device_path(&device)?;
        self.submit("PvCreate", timeout, move |m| {
            m.ensure_absent(&device)?;
            let handle = m.reserve(&device, HandleKind::Pv)?;
            m.create_with(handle, &device, commands::pv_create(&[device.clone()], &options))
        })
    }

    /// Wipe the label from a PV that belongs to no volume group.
    pub fn pv_remove(self: &Arc<Self>, pv: Handle, options: Options, timeout: Timeout) -> Reply {
        self.submit("PvRemove", timeout, move |m| {
            let device = m.live(pv, &[HandleKind::Pv])?.identity().name.clone();
            m.run(commands::pv_remove(&device, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    /// Foreground move of every extent on `src`. Progress streams into the
    /// returned job.
    pub fn pv_move(
        self: &Arc<Self>,
        src: Handle,
        dest: Option<Handle>,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        let reply = self.submit("PvMove", timeout, move |m| {
            let src_dev = m.live(src, &[HandleKind::Pv])?.identity().name.clone();
            let dest_dev = m.optional_pv(dest)?;
            let argv = commands::pv_move(&src_dev, dest_dev.as_deref(), None, false, &options);
            let stream = m.sync.runner().spawn(&argv)?;

            let job = create_job(m.registry())?;
            job.mark_running();
            let spawned = mover::spawn(
                stream,
                Arc::clone(&job),
                Arc::clone(&m.processor),
                Arc::clone(&m.sync),
            );
            if let Err(err) = spawned {
                let err = RequestError::Command {
                    code: -1,
                    stderr: format!("cannot follow pvmove: {err}"),
                };
                if job.complete(Err(err.to_job_error())) {
                    m.registry().notify_job(&job, &job.properties());
                }
            }
            Ok(OpValue::Handle(job.handle()))
        });
        job_outcome(reply)
    }

    // -----------------------------------------------------------------------
    // Volume groups
    // -----------------------------------------------------------------------

    pub fn vg_create(
        self: &Arc<Self>,
        name: String,
        pvs: Vec<Handle>,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        validate::vg_name(&name)?;
        if pvs.is_empty() {
            return Err(RequestError::InvalidArgument(
                "at least one physical volume is required".into(),
            ));
        }
        self.submit("VgCreate", timeout, move |m| {
            let devices = m.pv_devices(&pvs)?;
            m.ensure_absent(&name)?;
            let handle = m.reserve(&name, HandleKind::Vg)?;
            m.create_with(handle, &name, commands::vg_create(&name, &devices, &options))
        })
    }

    /// Rename by UUID; the new name arrives through reconciliation.
    pub fn vg_rename(
        self: &Arc<Self>,
        vg: Handle,
        new_name: String,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        validate::vg_name(&new_name)?;
        self.submit("VgRename", timeout, move |m| {
            let object = m.live(vg, &[HandleKind::Vg])?;
            let identity = object.identity();
            let current = identity.uuid().unwrap_or(&identity.name).to_string();
            m.ensure_absent(&new_name)?;
            m.run(commands::vg_rename(&current, &new_name, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    pub fn vg_extend(
        self: &Arc<Self>,
        vg: Handle,
        pvs: Vec<Handle>,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        if pvs.is_empty() {
            return Err(RequestError::InvalidArgument(
                "at least one physical volume is required".into(),
            ));
        }
        self.submit("VgExtend", timeout, move |m| {
            let name = m.live(vg, &[HandleKind::Vg])?.identity().name.clone();
            let devices = m.pv_devices(&pvs)?;
            m.run(commands::vg_extend(&name, &devices, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    /// Drop `pvs` from the group, or every unused PV when `pvs` is empty.
    /// `missing` also drops PVs lvm can no longer find.
    pub fn vg_reduce(
        self: &Arc<Self>,
        vg: Handle,
        missing: bool,
        pvs: Vec<Handle>,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        self.submit("VgReduce", timeout, move |m| {
            let name = m.live(vg, &[HandleKind::Vg])?.identity().name.clone();
            let devices = m.pv_devices(&pvs)?;
            m.run(commands::vg_reduce(&name, &devices, missing, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    pub fn vg_remove(self: &Arc<Self>, vg: Handle, options: Options, timeout: Timeout) -> Reply {
        self.submit("VgRemove", timeout, move |m| {
            let name = m.live(vg, &[HandleKind::Vg])?.identity().name.clone();
            m.run(commands::vg_remove(&name, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    // -----------------------------------------------------------------------
    // Logical volumes
    // -----------------------------------------------------------------------

    pub fn lv_create_linear(
        self: &Arc<Self>,
        vg: Handle,
        name: String,
        size_bytes: u64,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        if size_bytes == 0 {
            return Err(RequestError::InvalidArgument("size must be positive".into()));
        }
        self.submit("LvCreateLinear", timeout, move |m| {
            let vg_name = m.live(vg, &[HandleKind::Vg])?.identity().name.clone();
            validate::lv_name(&vg_name, &name)?;
            let full_name = format!("{vg_name}/{name}");
            m.ensure_absent(&full_name)?;
            let handle = m.reserve(&full_name, HandleKind::Lv)?;
            m.create_with(
                handle,
                &full_name,
                commands::lv_create_linear(&vg_name, &name, size_bytes, &options),
            )
        })
    }

    pub fn lv_remove(self: &Arc<Self>, lv: Handle, options: Options, timeout: Timeout) -> Reply {
        self.submit("LvRemove", timeout, move |m| {
            let full_name = m.live(lv, LV_KINDS)?.identity().name.clone();
            m.run(commands::lv_remove(&full_name, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    /// The handle is kept; the new name arrives through reconciliation.
    pub fn lv_rename(
        self: &Arc<Self>,
        lv: Handle,
        new_name: String,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        self.submit("LvRename", timeout, move |m| {
            let state = m.lv_state(lv)?;
            validate::lv_name(&state.vg_name, &new_name)?;
            m.ensure_absent(&format!("{}/{new_name}", state.vg_name))?;
            m.run(commands::lv_rename(&state.full_name(), &new_name, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    /// Snapshot named `name` in the origin's group. A zero size on a thick
    /// origin picks 1/80th of the origin rounded up to 512 bytes; thin
    /// origins are left to lvm.
    pub fn lv_snapshot(
        self: &Arc<Self>,
        lv: Handle,
        name: String,
        size_bytes: u64,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        self.submit("LvSnapshot", timeout, move |m| {
            let origin = m.lv_state(lv)?;
            validate::lv_name(&origin.vg_name, &name)?;
            let size = match (size_bytes, origin.pool_lv.is_some()) {
                (0, false) => default_snapshot_size(origin.size_bytes),
                (size, _) => size,
            };
            let full_name = format!("{}/{name}", origin.vg_name);
            m.ensure_absent(&full_name)?;
            let handle = m.reserve(&full_name, HandleKind::Lv)?;
            m.create_with(
                handle,
                &full_name,
                commands::lv_snapshot(&origin.full_name(), &name, size, &options),
            )
        })
    }

    /// Set the size to `new_size_bytes`. Already at that size is a no-op.
    pub fn lv_resize(
        self: &Arc<Self>,
        lv: Handle,
        new_size_bytes: u64,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        if new_size_bytes == 0 {
            return Err(RequestError::InvalidArgument("size must be positive".into()));
        }
        self.submit("LvResize", timeout, move |m| {
            let state = m.lv_state(lv)?;
            let delta = i128::from(new_size_bytes) - i128::from(state.size_bytes);
            if delta == 0 {
                return Ok(OpValue::Unit);
            }
            let delta = i64::try_from(delta)
                .map_err(|_| RequestError::InvalidArgument(format!("size change too large: {delta}")))?;
            m.run(commands::lv_resize(&state.full_name(), delta, &options))?;
            m.refresh_now()?;
            Ok(OpValue::Unit)
        })
    }

    /// Background move of one volume's extents off `src`, tracked by the
    /// move monitor.
    pub fn lv_move(
        self: &Arc<Self>,
        lv: Handle,
        src: Handle,
        dest: Option<Handle>,
        options: Options,
        timeout: Timeout,
    ) -> Reply {
        let reply = self.submit("LvMove", timeout, move |m| {
            let full_name = m.live(lv, LV_KINDS)?.identity().name.clone();
            let src_dev = m.live(src, &[HandleKind::Pv])?.identity().name.clone();
            let dest_dev = m.optional_pv(dest)?;
            m.run(commands::pv_move(
                &src_dev,
                dest_dev.as_deref(),
                Some(&full_name),
                true,
                &options,
            ))?;

            let moves = m.monitor.current_moves()?;
            let job = create_job(m.registry())?;
            let launched = moves
                .values()
                .find(|status| status.src_dev == src_dev && !m.monitor.is_tracked(&status.key));
            match launched {
                Some(status) => m.monitor.track(status.key.clone(), status, Arc::clone(&job)),
                None => {
                    tracing::info!(lv = %full_name, "move already finished at launch");
                    let outcome = m.refresh_now().map(|_| OpValue::Unit);
                    if job.complete(outcome.map_err(|err| err.to_job_error())) {
                        m.registry().notify_job(&job, &job.properties());
                    }
                }
            }
            Ok(OpValue::Handle(job.handle()))
        });
        job_outcome(reply)
    }

    // -----------------------------------------------------------------------
    // Manager-level calls
    // -----------------------------------------------------------------------

    /// Full reconcile; the value is the number of changes applied.
    pub fn refresh(self: &Arc<Self>, timeout: Timeout) -> Reply {
        self.submit("Refresh", timeout, |m| {
            let summary = m.refresh_now()?;
            Ok(OpValue::Count(summary.total() as u64))
        })
    }

    /// `key` is tried as a UUID and as a name.
    pub fn lookup(&self, key: &str) -> Option<Handle> {
        let registry = self.registry();
        registry
            .lookup_by_uuid(key)
            .and_then(|handle| registry.lookup_by_handle(handle))
            .or_else(|| registry.find(None, key))
            .map(|object| object.handle())
    }

    /// Notification from lvm that something changed. Skipped when the named
    /// VG is already known at `seqno`. Returns whether a refresh was queued.
    pub fn external_event(
        self: &Arc<Self>,
        event: &str,
        lvm_id: &str,
        uuid: &str,
        seqno: u64,
    ) -> bool {
        if let Some(object) = self.registry().find(Some(uuid), lvm_id) {
            if let Some(ResourceState::Vg(vg)) = object.state() {
                if vg.seqno == seqno {
                    tracing::debug!(event, vg = %lvm_id, seqno, "state already current");
                    return false;
                }
            }
        }
        self.refresh.request(&format!("external event {event}"))
    }

    // -----------------------------------------------------------------------
    // Worker-side helpers
    // -----------------------------------------------------------------------

    fn live(&self, handle: Handle, kinds: &[HandleKind]) -> Result<ManagedObject, RequestError> {
        let object = self
            .registry()
            .lookup_by_handle(handle)
            .ok_or_else(|| RequestError::NotFound(handle.to_string()))?;
        if !kinds.contains(&handle.kind()) {
            return Err(RequestError::InvalidArgument(format!(
                "{handle} is not a {}",
                kinds
                    .iter()
                    .map(|k| k.segment())
                    .collect::<Vec<_>>()
                    .join(" or ")
            )));
        }
        Ok(object)
    }

    fn lv_state(&self, lv: Handle) -> Result<LvState, RequestError> {
        match self.live(lv, LV_KINDS)?.state() {
            Some(ResourceState::Lv(state)) => Ok(state.clone()),
            _ => Err(RequestError::InvalidArgument(format!("{lv} is not a logical volume"))),
        }
    }

    fn pv_devices(&self, pvs: &[Handle]) -> Result<Vec<String>, RequestError> {
        pvs.iter()
            .map(|pv| self.live(*pv, &[HandleKind::Pv]).map(|o| o.identity().name.clone()))
            .collect()
    }

    fn optional_pv(&self, pv: Option<Handle>) -> Result<Option<String>, RequestError> {
        pv.map(|h| self.live(h, &[HandleKind::Pv]).map(|o| o.identity().name.clone()))
            .transpose()
    }

    fn ensure_absent(&self, name: &str) -> Result<(), RequestError> {
        match self.registry().find(None, name) {
            Some(_) => Err(RequestError::AlreadyExists(name.to_string())),
            None => Ok(()),
        }
    }

    /// Reserve the handle the object will be registered under.
    fn reserve(&self, name: &str, kind: HandleKind) -> Result<Handle, RequestError> {
        self.registry()
            .lookup_by_identity(None, name, Some(kind))
            .ok_or_else(|| RequestError::NotFound(name.to_string()))
    }

    fn run(&self, argv: Vec<String>) -> Result<(), RequestError> {
        let output = self.sync.runner().run(&argv)?;
        if output.success() {
            Ok(())
        } else {
            Err(RequestError::Command {
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    fn refresh_now(&self) -> Result<ReconcileSummary, RequestError> {
        Ok(self.sync.refresh()?)
    }

    /// Run a create command, reconcile, and return the created object.
    fn create_with(&self, reserved: Handle, name: &str, argv: Vec<String>) -> Result<OpValue, RequestError> {
        if let Err(err) = self.run(argv) {
            self.registry().release(reserved);
            return Err(err);
        }
        self.refresh_now()?;
        if self.registry().lookup_by_handle(reserved).is_some() {
            return Ok(OpValue::Handle(reserved));
        }
        self.registry()
            .find(None, name)
            .map(|object| OpValue::Handle(object.handle()))
            .ok_or_else(|| RequestError::NotFound(name.to_string()))
    }
}

const LV_KINDS: &[HandleKind] = &[
    HandleKind::Lv,
    HandleKind::ThinPool,
    HandleKind::CachePool,
    HandleKind::HiddenLv,
];

fn default_snapshot_size(origin_bytes: u64) -> u64 {
    let space = origin_bytes / 80;
    space + 512 - space % 512
}

/// Move operations return their own job as the value; present it as a job.
fn job_outcome(reply: Reply) -> Reply {
    match reply? {
        Outcome::Value(OpValue::Handle(handle)) if handle.kind() == HandleKind::Job => {
            Ok(Outcome::Job(handle))
        }
        other => Ok(other),
    }
}
