//! In-memory stand-in for the lvm binary.
//!
//! [`FakeLvm`] keeps a small model of PVs, VGs, LVs and running moves, answers
//! the report commands from it and applies the mutating commands the daemon
//! issues. Delays, one-shot failures and transient query failures can be
//! injected. Background moves advance by a fixed step on every status query.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::SyncError;
use crate::exec::{CommandOutput, Executor, Streaming};
use crate::tabular::format_row;

pub const PV_SIZE: u64 = 10 << 30;
pub const EXTENT: u64 = 4 << 20;

const VALUE_FLAGS: &[&str] = &["--size", "--name", "-n", "-i", "--select", "--separator", "--units", "-o"];

#[derive(Debug, Clone)]
struct FakePv {
    uuid: String,
    vg: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeVg {
    uuid: String,
    seqno: u64,
}

#[derive(Debug, Clone)]
struct FakeLv {
    uuid: String,
    vg: String,
    name: String,
    size: u64,
    attr: String,
    layout: String,
    segtype: String,
    pool: Option<String>,
    origin: Option<String>,
    data_lv: Option<String>,
    metadata_lv: Option<String>,
    devices: Vec<String>,
}

#[derive(Debug, Clone)]
struct FakeMove {
    src: String,
    dest: String,
    lv: Option<String>,
    percent: f64,
    step: f64,
}

#[derive(Debug)]
struct Model {
    pvs: BTreeMap<String, FakePv>,
    vgs: BTreeMap<String, FakeVg>,
    lvs: BTreeMap<String, FakeLv>,
    moves: BTreeMap<String, FakeMove>,
    next_id: u64,
    next_move: u64,
    move_step: f64,
    stream_step: f64,
    stream_line_delay: Duration,
}

impl Default for Model {
    fn default() -> Self {
        Self {
            pvs: BTreeMap::new(),
            vgs: BTreeMap::new(),
            lvs: BTreeMap::new(),
            moves: BTreeMap::new(),
            next_id: 0,
            next_move: 0,
            move_step: 25.0,
            stream_step: 25.0,
            stream_line_delay: Duration::ZERO,
        }
    }
}

impl Model {
    fn uuid(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:04}", self.next_id)
    }

    fn bump(&mut self, vg: &str) {
        if let Some(vg) = self.vgs.get_mut(vg) {
            vg.seqno += 1;
        }
    }

    fn pv_used(&self, pv: &str) -> u64 {
        self.lvs
            .values()
            .filter(|lv| lv.devices.first().map(String::as_str) == Some(pv))
            .map(|lv| lv.size)
            .sum()
    }

    fn vg_pvs(&self, vg: &str) -> Vec<String> {
        self.pvs
            .iter()
            .filter(|(_, pv)| pv.vg.as_deref() == Some(vg))
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn vg_size(&self, vg: &str) -> u64 {
        self.vg_pvs(vg).len() as u64 * PV_SIZE
    }

    fn vg_used(&self, vg: &str) -> u64 {
        self.vg_pvs(vg).iter().map(|pv| self.pv_used(pv)).sum()
    }

    /// Finish a relocation: volumes on `src` now live on `dest`.
    fn relocate(&mut self, src: &str, dest: &str, only: Option<&str>) {
        let mut touched = Vec::new();
        for (full, lv) in self.lvs.iter_mut() {
            if only.map_or(false, |o| o != full.as_str()) {
                continue;
            }
            for dev in lv.devices.iter_mut() {
                if dev == src {
                    *dev = dest.to_string();
                    touched.push(lv.vg.clone());
                }
            }
        }
        for vg in touched {
            self.bump(&vg);
        }
    }
}

/// One-shot failure of a subcommand.
#[derive(Debug, Clone)]
struct Failure {
    code: i32,
    stderr: String,
}

pub struct FakeLvm {
    model: Arc<Mutex<Model>>,
    calls: Mutex<Vec<Vec<String>>>,
    failing_queries: AtomicU32,
    failures: Mutex<HashMap<String, Failure>>,
    delays: Mutex<HashMap<String, Duration>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl Default for FakeLvm {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeLvm {
    pub fn new() -> Self {
        Self {
            model: Arc::new(Mutex::new(Model::default())),
            calls: Mutex::new(Vec::new()),
            failing_queries: AtomicU32::new(0),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    // --- injection -------------------------------------------------------

    /// The next `n` report commands exit 5 as if lvm lost a lock race.
    pub fn fail_next_queries(&self, n: u32) {
        self.failing_queries.store(n, Ordering::SeqCst);
    }

    /// The next invocation of `subcommand` fails with `code` and `stderr`.
    pub fn fail_next(&self, subcommand: &str, code: i32, stderr: &str) {
        self.failures.lock().insert(
            subcommand.to_string(),
            Failure {
                code,
                stderr: stderr.to_string(),
            },
        );
    }

    /// Every invocation of `subcommand` sleeps `delay` first.
    pub fn set_delay(&self, subcommand: &str, delay: Duration) {
        self.delays.lock().insert(subcommand.to_string(), delay);
    }

    /// Percent added to every background move per status query.
    pub fn set_move_step(&self, step: f64) {
        let mut model = self.model.lock();
        model.move_step = step;
        for mv in model.moves.values_mut() {
            mv.step = step;
        }
    }

    /// Percent per progress line of a foreground move, and the pause between lines.
    pub fn set_stream(&self, step: f64, line_delay: Duration) {
        let mut model = self.model.lock();
        model.stream_step = step;
        model.stream_line_delay = line_delay;
    }

    /// Freeze every running background move.
    pub fn stall_moves(&self) {
        self.set_move_step(0.0);
    }

    // --- model edits -----------------------------------------------------

    pub fn add_pv(&self, device: &str) -> String {
        let mut model = self.model.lock();
        let uuid = model.uuid("pv");
        model.pvs.insert(
            device.to_string(),
            FakePv {
                uuid: uuid.clone(),
                vg: None,
            },
        );
        uuid
    }

    pub fn add_vg(&self, name: &str, devices: &[&str]) -> String {
        let mut model = self.model.lock();
        let uuid = model.uuid("vg");
        model.vgs.insert(
            name.to_string(),
            FakeVg {
                uuid: uuid.clone(),
                seqno: 1,
            },
        );
        for dev in devices {
            if let Some(pv) = model.pvs.get_mut(*dev) {
                pv.vg = Some(name.to_string());
            }
        }
        uuid
    }

    pub fn add_lv(&self, vg: &str, name: &str, size: u64) -> String {
        let mut model = self.model.lock();
        let device = model.vg_pvs(vg).into_iter().next();
        let uuid = model.uuid("lv");
        model.lvs.insert(
            format!("{vg}/{name}"),
            FakeLv {
                uuid: uuid.clone(),
                vg: vg.to_string(),
                name: name.to_string(),
                size,
                attr: "-wi-a-----".into(),
                layout: "linear".into(),
                segtype: "linear".into(),
                pool: None,
                origin: None,
                data_lv: None,
                metadata_lv: None,
                devices: device.into_iter().collect(),
            },
        );
        model.bump(vg);
        uuid
    }

    /// Turn a plain volume into a thin pool with hidden data and metadata volumes.
    pub fn convert_to_thin_pool(&self, full_name: &str) {
        let mut model = self.model.lock();
        let Some(mut lv) = model.lvs.remove(full_name) else {
            return;
        };
        let data = format!("[{}_tdata]", lv.name);
        let meta = format!("[{}_tmeta]", lv.name);
        for hidden in [&data, &meta] {
            let uuid = model.uuid("lv");
            model.lvs.insert(
                format!("{}/{hidden}", lv.vg),
                FakeLv {
                    uuid,
                    name: hidden.clone(),
                    attr: "Twi-ao----".into(),
                    layout: "linear".into(),
                    segtype: "linear".into(),
                    pool: None,
                    data_lv: None,
                    metadata_lv: None,
                    ..lv.clone()
                },
            );
        }
        lv.attr = "twi-a-tz--".into();
        lv.layout = "thin,pool".into();
        lv.segtype = "thin-pool".into();
        lv.devices = vec![data.trim_matches(|c| c == '[' || c == ']').to_string()];
        lv.data_lv = Some(data);
        lv.metadata_lv = Some(meta);
        let vg = lv.vg.clone();
        model.lvs.insert(full_name.to_string(), lv);
        model.bump(&vg);
    }

    /// Rename behind the daemon's back.
    pub fn rename_vg(&self, old: &str, new: &str) {
        let mut model = self.model.lock();
        rename_vg_in(&mut model, old, new);
    }

    pub fn remove_lv(&self, full_name: &str) {
        let mut model = self.model.lock();
        if let Some(lv) = model.lvs.remove(full_name) {
            model.bump(&lv.vg);
        }
    }

    /// Start a background move as if another tool had issued it.
    pub fn start_move(&self, src: &str, dest: &str) -> String {
        let mut model = self.model.lock();
        start_move_in(&mut model, src, dest, None)
    }

    // --- inspection ------------------------------------------------------

    pub fn calls(&self) -> Vec<Vec<String>> {
        self.calls.lock().clone()
    }

    pub fn calls_of(&self, subcommand: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|argv| argv.first().map(String::as_str) == Some(subcommand))
            .count()
    }

    /// Highest number of invocations observed running at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn seqno(&self, vg: &str) -> Option<u64> {
        self.model.lock().vgs.get(vg).map(|vg| vg.seqno)
    }

    pub fn moves_running(&self) -> usize {
        self.model.lock().moves.len()
    }

    pub fn lv_devices(&self, full_name: &str) -> Vec<String> {
        self.model
            .lock()
            .lvs
            .get(full_name)
            .map(|lv| lv.devices.clone())
            .unwrap_or_default()
    }

    // --- dispatch --------------------------------------------------------

    fn enter(&self, argv: &[String]) {
        self.calls.lock().push(argv.to_vec());
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = argv
            .first()
            .and_then(|sub| self.delays.lock().get(sub).copied());
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn dispatch(&self, argv: &[String]) -> CommandOutput {
        let Some(sub) = argv.first().map(String::as_str) else {
            return CommandOutput::failed(3, "no command");
        };
        if let Some(failure) = self.failures.lock().remove(sub) {
            return CommandOutput::failed(failure.code, failure.stderr);
        }
        let (flags, args) = split_args(&argv[1..]);

        if matches!(sub, "pvs" | "vgs" | "lvs") {
            let failing = self.failing_queries.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_queries.store(failing - 1, Ordering::SeqCst);
                return CommandOutput::failed(5, "  Unable to obtain global lock.");
            }
            let columns: Vec<&str> = flags
                .get("-o")
                .map(|c| c.split(',').collect())
                .unwrap_or_default();
            let mut model = self.model.lock();
            return CommandOutput::ok(match sub {
                "pvs" => render_pvs(&model, &columns),
                "vgs" => render_vgs(&model, &columns),
                _ if flags.contains_key("--select") => render_moves(&mut model, &columns),
                _ => render_lvs(&model, &columns),
            });
        }

        let mut model = self.model.lock();
        let result = match sub {
            "pvcreate" => pv_create(&mut model, &args),
            "vgcreate" => vg_create(&mut model, &args),
            "vgrename" => vg_rename(&mut model, &args),
            "vgremove" => vg_remove(&mut model, &args),
            "pvremove" => pv_remove(&mut model, &args),
            "vgextend" => vg_extend(&mut model, &args),
            "vgreduce" => vg_reduce(&mut model, &flags, &args),
            "lvcreate" if flags.contains_key("-s") => lv_snapshot(&mut model, &flags, &args),
            "lvcreate" => lv_create(&mut model, &flags, &args),
            "lvremove" => lv_remove(&mut model, &args),
            "lvrename" => lv_rename(&mut model, &args),
            "lvresize" => lv_resize(&mut model, &flags, &args),
            "pvmove" => pv_move_background(&mut model, &flags, &args),
            other => Err(format!("  Unknown command: {other}")),
        };
        match result {
            Ok(stdout) => CommandOutput::ok(stdout),
            Err(stderr) => CommandOutput::failed(5, stderr),
        }
    }
}

impl Executor for FakeLvm {
    fn execute(&self, argv: &[String]) -> Result<CommandOutput, SyncError> {
        self.enter(argv);
        let output = self.dispatch(argv);
        self.leave();
        Ok(output)
    }

    fn spawn(&self, argv: &[String]) -> Result<Box<dyn Streaming>, SyncError> {
        self.enter(argv);
        let stream = self.stream(argv);
        self.leave();
        Ok(Box::new(stream))
    }
}

impl FakeLvm {
    fn stream(&self, argv: &[String]) -> FakeStream {
        let failure = argv
            .first()
            .and_then(|sub| self.failures.lock().remove(sub));
        let (flags, args) = split_args(argv.get(1..).unwrap_or_default());
        let model = self.model.lock();
        let step = model.stream_step.max(1.0);
        let line_delay = model.stream_line_delay;

        let (Some(src), true) = (args.first().cloned(), argv.first().map(String::as_str) == Some("pvmove")) else {
            return FakeStream::done(CommandOutput::failed(3, "  Unsupported streaming command."));
        };
        let dest = match args.get(1).cloned().or_else(|| pick_dest(&model, &src)) {
            Some(dest) => dest,
            None => return FakeStream::done(CommandOutput::failed(5, "  No extents available for allocation.")),
        };
        drop(model);

        let mut lines = VecDeque::new();
        let mut percent = 0.0;
        while percent < 100.0 {
            percent = f64::min(percent + step, 100.0);
            lines.push_back(format!("  {src}: Moved: {percent:.1}%"));
            if failure.is_some() && percent >= 50.0 {
                break;
            }
        }

        let only = flags.get("-n").cloned();
        let model = Arc::clone(&self.model);
        let (result, on_finish): (CommandOutput, Option<Box<dyn FnOnce() + Send>>) = match failure {
            Some(failure) => (CommandOutput::failed(failure.code, failure.stderr), None),
            None => (
                CommandOutput::ok(String::new()),
                Some(Box::new(move || model.lock().relocate(&src, &dest, only.as_deref()))),
            ),
        };
        FakeStream {
            lines,
            line_delay,
            result,
            on_finish,
        }
    }
}

struct FakeStream {
    lines: VecDeque<String>,
    line_delay: Duration,
    result: CommandOutput,
    on_finish: Option<Box<dyn FnOnce() + Send>>,
}

impl FakeStream {
    fn done(result: CommandOutput) -> Self {
        Self {
            lines: VecDeque::new(),
            line_delay: Duration::ZERO,
            result,
            on_finish: None,
        }
    }
}

impl Streaming for FakeStream {
    fn next_line(&mut self) -> Option<String> {
        let line = self.lines.pop_front()?;
        if !self.line_delay.is_zero() {
            thread::sleep(self.line_delay);
        }
        Some(line)
    }

    fn finish(mut self: Box<Self>) -> Result<CommandOutput, SyncError> {
        if let Some(on_finish) = self.on_finish.take() {
            on_finish();
        }
        Ok(self.result.clone())
    }
}

// ---------------------------------------------------------------------------
// Argument handling
// ---------------------------------------------------------------------------

fn split_args(argv: &[String]) -> (HashMap<String, String>, Vec<String>) {
    let mut flags = HashMap::new();
    let mut args = Vec::new();
    let mut iter = argv.iter();
    while let Some(arg) = iter.next() {
        if VALUE_FLAGS.contains(&arg.as_str()) {
            flags.insert(arg.clone(), iter.next().cloned().unwrap_or_default());
        } else if arg.starts_with('-') {
            flags.insert(arg.clone(), String::new());
        } else {
            args.push(arg.clone());
        }
    }
    (flags, args)
}

fn pick_dest(model: &Model, src: &str) -> Option<String> {
    let vg = model.pvs.get(src)?.vg.clone()?;
    model.vg_pvs(&vg).into_iter().find(|pv| pv != src)
}

fn start_move_in(model: &mut Model, src: &str, dest: &str, lv: Option<String>) -> String {
    let vg = model
        .pvs
        .get(src)
        .and_then(|pv| pv.vg.clone())
        .unwrap_or_default();
    let key = format!("{vg}/[pvmove{}]", model.next_move);
    model.next_move += 1;
    let step = model.move_step;
    model.moves.insert(
        key.clone(),
        FakeMove {
            src: src.to_string(),
            dest: dest.to_string(),
            lv,
            percent: 0.0,
            step,
        },
    );
    key
}

fn rename_vg_in(model: &mut Model, old: &str, new: &str) {
    let Some(mut vg) = model.vgs.remove(old) else {
        return;
    };
    vg.seqno += 1;
    model.vgs.insert(new.to_string(), vg);
    for pv in model.pvs.values_mut() {
        if pv.vg.as_deref() == Some(old) {
            pv.vg = Some(new.to_string());
        }
    }
    let moved: Vec<String> = model
        .lvs
        .keys()
        .filter(|k| k.starts_with(&format!("{old}/")))
        .cloned()
        .collect();
    for key in moved {
        if let Some(mut lv) = model.lvs.remove(&key) {
            lv.vg = new.to_string();
            model.lvs.insert(format!("{new}/{}", lv.name), lv);
        }
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

fn pv_create(model: &mut Model, args: &[String]) -> Result<String, String> {
    if args.is_empty() {
        return Err("  Please enter a physical volume path.".into());
    }
    if let Some(dev) = args.iter().find(|d| model.pvs.contains_key(*d)) {
        return Err(format!("  Physical volume {dev} is already a PV."));
    }
    for dev in args {
        let uuid = model.uuid("pv");
        model.pvs.insert(dev.clone(), FakePv { uuid, vg: None });
    }
    Ok(format!("  Physical volume \"{}\" successfully created.", args.join(" ")))
}

fn vg_create(model: &mut Model, args: &[String]) -> Result<String, String> {
    let (name, devices) = args.split_first().ok_or("  Please provide volume group name")?;
    if model.vgs.contains_key(name) {
        return Err(format!("  A volume group called {name} already exists."));
    }
    for dev in devices {
        match model.pvs.get(dev) {
            None => return Err(format!("  Device {dev} not found.")),
            Some(pv) if pv.vg.is_some() => {
                return Err(format!("  Physical volume '{dev}' is already in volume group"))
            }
            Some(_) => {}
        }
    }
    let uuid = model.uuid("vg");
    model.vgs.insert(name.clone(), FakeVg { uuid, seqno: 1 });
    for dev in devices {
        if let Some(pv) = model.pvs.get_mut(dev) {
            pv.vg = Some(name.clone());
        }
    }
    Ok(format!("  Volume group \"{name}\" successfully created"))
}

fn pv_remove(model: &mut Model, args: &[String]) -> Result<String, String> {
    let dev = args.first().ok_or("  Please enter a physical volume path.")?;
    match model.pvs.get(dev) {
        None => Err(format!("  No PV found on device {dev}.")),
        Some(FakePv { vg: Some(vg), .. }) => Err(format!(
            "  PV {dev} is used by VG {vg} so please use vgreduce first."
        )),
        Some(_) => {
            model.pvs.remove(dev);
            Ok(format!("  Labels on physical volume \"{dev}\" successfully wiped."))
        }
    }
}

fn vg_extend(model: &mut Model, args: &[String]) -> Result<String, String> {
    let (vg, devices) = args.split_first().ok_or("  Please enter volume group name and physical volume(s)")?;
    if !model.vgs.contains_key(vg) {
        return Err(format!("  Volume group \"{vg}\" not found"));
    }
    if devices.is_empty() {
        return Err("  Please enter physical volume(s)".into());
    }
    for dev in devices {
        match model.pvs.get(dev) {
            None => return Err(format!("  Device {dev} not found.")),
            Some(FakePv { vg: Some(owner), .. }) => {
                return Err(format!("  Physical volume '{dev}' is already in volume group '{owner}'"))
            }
            Some(_) => {}
        }
    }
    for dev in devices {
        if let Some(pv) = model.pvs.get_mut(dev) {
            pv.vg = Some(vg.clone());
        }
    }
    model.bump(vg);
    Ok(format!("  Volume group \"{vg}\" successfully extended"))
}

fn vg_reduce(model: &mut Model, flags: &HashMap<String, String>, args: &[String]) -> Result<String, String> {
    let (vg, devices) = args.split_first().ok_or("  Please give volume group name")?;
    if !model.vgs.contains_key(vg) {
        return Err(format!("  Volume group \"{vg}\" not found"));
    }
    let members = model.vg_pvs(vg);
    let targets: Vec<String> = if flags.contains_key("--all") {
        let unused: Vec<String> = members.iter().filter(|pv| model.pv_used(pv) == 0).cloned().collect();
        let keep = usize::from(unused.len() == members.len());
        unused.into_iter().skip(keep).collect()
    } else {
        devices.to_vec()
    };
    for dev in &targets {
        if !members.contains(dev) {
            return Err(format!("  Physical Volume \"{dev}\" not found in Volume Group \"{vg}\"."));
        }
        if model.pv_used(dev) > 0 {
            return Err(format!("  Physical volume \"{dev}\" still in use"));
        }
    }
    if targets.len() >= members.len() {
        return Err(format!("  Can't remove final physical volume from volume group \"{vg}\""));
    }
    for dev in &targets {
        if let Some(pv) = model.pvs.get_mut(dev) {
            pv.vg = None;
        }
    }
    model.bump(vg);
    Ok(format!("  Removed {} physical volume(s) from volume group \"{vg}\"", targets.len()))
}

fn vg_rename(model: &mut Model, args: &[String]) -> Result<String, String> {
    let [current, new] = args else {
        return Err("  Old and new volume group names need specifying".into());
    };
    let old = model
        .vgs
        .iter()
        .find(|(name, vg)| *name == current || vg.uuid == *current)
        .map(|(name, _)| name.clone())
        .ok_or_else(|| format!("  Volume group \"{current}\" not found"))?;
    if model.vgs.contains_key(new) {
        return Err(format!("  New volume group \"{new}\" already exists"));
    }
    rename_vg_in(model, &old, new);
    Ok(format!("  Volume group \"{old}\" successfully renamed to \"{new}\""))
}

fn vg_remove(model: &mut Model, args: &[String]) -> Result<String, String> {
    let name = args.first().ok_or("  Please enter one or more volume group paths.")?;
    if model.vgs.remove(name).is_none() {
        return Err(format!("  Volume group \"{name}\" not found"));
    }
    model.lvs.retain(|_, lv| lv.vg != *name);
    for pv in model.pvs.values_mut() {
        if pv.vg.as_deref() == Some(name.as_str()) {
            pv.vg = None;
        }
    }
    Ok(format!("  Volume group \"{name}\" successfully removed"))
}

fn lv_create(model: &mut Model, flags: &HashMap<String, String>, args: &[String]) -> Result<String, String> {
    let vg = args.first().ok_or("  Please specify a volume group.")?;
    let name = flags.get("--name").ok_or("  Please specify a name.")?;
    let size: u64 = flags
        .get("--size")
        .and_then(|s| s.trim_end_matches('B').parse().ok())
        .ok_or("  Invalid size.")?;
    if !model.vgs.contains_key(vg) {
        return Err(format!("  Volume group \"{vg}\" not found"));
    }
    let full = format!("{vg}/{name}");
    if model.lvs.contains_key(&full) {
        return Err(format!("  Logical Volume \"{name}\" already exists in volume group \"{vg}\""));
    }
    if model.vg_used(vg) + size > model.vg_size(vg) {
        return Err(format!("  Volume group \"{vg}\" has insufficient free space."));
    }
    let device = model
        .vg_pvs(vg)
        .into_iter()
        .find(|pv| model.pv_used(pv) + size <= PV_SIZE);
    let uuid = model.uuid("lv");
    model.lvs.insert(
        full,
        FakeLv {
            uuid,
            vg: vg.clone(),
            name: name.clone(),
            size,
            attr: "-wi-a-----".into(),
            layout: "linear".into(),
            segtype: "linear".into(),
            pool: None,
            origin: None,
            data_lv: None,
            metadata_lv: None,
            devices: device.into_iter().collect(),
        },
    );
    model.bump(vg);
    Ok(format!("  Logical volume \"{name}\" created."))
}

fn lv_snapshot(model: &mut Model, flags: &HashMap<String, String>, args: &[String]) -> Result<String, String> {
    let origin_full = args.first().ok_or("  Please specify a logical volume to act as the snapshot origin.")?;
    let name = flags.get("--name").ok_or("  Please specify a name.")?;
    let origin = model
        .lvs
        .get(origin_full)
        .cloned()
        .ok_or_else(|| format!("  Failed to find logical volume \"{origin_full}\""))?;
    let size: u64 = match flags.get("--size") {
        Some(raw) => raw.trim_end_matches('B').parse().map_err(|_| "  Invalid size.")?,
        None if origin.pool.is_some() => origin.size,
        None => return Err("  Please specify either size or extents with snapshots.".into()),
    };
    let full = format!("{}/{name}", origin.vg);
    if model.lvs.contains_key(&full) {
        return Err(format!("  Logical Volume \"{name}\" already exists in volume group \"{}\"", origin.vg));
    }
    let uuid = model.uuid("lv");
    model.lvs.insert(
        full,
        FakeLv {
            uuid,
            name: name.clone(),
            size,
            attr: "swi-a-s---".into(),
            origin: Some(origin.name.clone()),
            ..origin.clone()
        },
    );
    model.bump(&origin.vg);
    Ok(format!("  Logical volume \"{name}\" created."))
}

fn lv_rename(model: &mut Model, args: &[String]) -> Result<String, String> {
    let [full, new_name] = args else {
        return Err("  Old and new logical volume names required".into());
    };
    let mut lv = model
        .lvs
        .remove(full)
        .ok_or_else(|| format!("  Existing logical volume \"{full}\" not found"))?;
    let new_full = format!("{}/{new_name}", lv.vg);
    if model.lvs.contains_key(&new_full) {
        let vg = lv.vg.clone();
        model.lvs.insert(full.clone(), lv);
        return Err(format!("  Logical Volume \"{new_name}\" already exists in volume group \"{vg}\""));
    }
    let old_name = std::mem::replace(&mut lv.name, new_name.clone());
    let vg = lv.vg.clone();
    model.lvs.insert(new_full, lv);
    for other in model.lvs.values_mut().filter(|other| other.vg == vg) {
        if other.origin.as_deref() == Some(old_name.as_str()) {
            other.origin = Some(new_name.clone());
        }
    }
    model.bump(&vg);
    Ok(format!("  Renamed \"{old_name}\" to \"{new_name}\" in volume group \"{vg}\""))
}

fn lv_resize(model: &mut Model, flags: &HashMap<String, String>, args: &[String]) -> Result<String, String> {
    let full = args.first().ok_or("  Please specify a logical volume path.")?;
    let delta: i64 = flags
        .keys()
        .find_map(|flag| flag.strip_prefix("-L"))
        .and_then(|raw| raw.trim_end_matches('B').parse().ok())
        .ok_or("  Please specify either size or extents.")?;
    let (vg, size) = model
        .lvs
        .get(full)
        .map(|lv| (lv.vg.clone(), lv.size))
        .ok_or_else(|| format!("  Logical volume {full} not found in volume group"))?;
    let new_size = size
        .checked_add_signed(delta)
        .filter(|size| *size > 0)
        .ok_or("  New size would be zero or negative.")?;
    if delta > 0 && model.vg_used(&vg) + delta.unsigned_abs() > model.vg_size(&vg) {
        return Err(format!("  Insufficient free space: volume group \"{vg}\" is full."));
    }
    if let Some(lv) = model.lvs.get_mut(full) {
        lv.size = new_size;
    }
    model.bump(&vg);
    Ok(format!("  Logical volume {full} successfully resized."))
}

fn lv_remove(model: &mut Model, args: &[String]) -> Result<String, String> {
    let full = args.first().ok_or("  Please enter a logical volume path.")?;
    let lv = model
        .lvs
        .remove(full)
        .ok_or_else(|| format!("  Failed to find logical volume \"{full}\""))?;
    model.bump(&lv.vg);
    Ok(format!("  Logical volume \"{}\" successfully removed", lv.name))
}

fn pv_move_background(model: &mut Model, flags: &HashMap<String, String>, args: &[String]) -> Result<String, String> {
    if !flags.contains_key("-b") {
        return Err("  Foreground pvmove must be spawned.".into());
    }
    let src = args.first().ok_or("  Please specify a source physical volume.")?;
    if !model.pvs.contains_key(src) {
        return Err(format!("  Physical volume {src} not found"));
    }
    if model.moves.values().any(|m| m.src == *src) {
        return Err(format!("  Detected pvmove in progress for {src}"));
    }
    let dest = args
        .get(1)
        .cloned()
        .or_else(|| pick_dest(model, src))
        .ok_or("  No extents available for allocation.")?;
    start_move_in(model, src, &dest, flags.get("-n").cloned());
    Ok(String::new())
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

fn render(rows: Vec<Vec<String>>) -> String {
    rows.iter()
        .map(|row| {
            let refs: Vec<&str> = row.iter().map(String::as_str).collect();
            format_row(&refs)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_pvs(model: &Model, columns: &[&str]) -> String {
    let rows = model
        .pvs
        .iter()
        .map(|(name, pv)| {
            let used = model.pv_used(name);
            let vg_uuid = pv
                .vg
                .as_ref()
                .and_then(|vg| model.vgs.get(vg))
                .map(|vg| vg.uuid.clone())
                .unwrap_or_default();
            columns
                .iter()
                .map(|col| match *col {
                    "pv_name" => name.clone(),
                    "pv_uuid" => pv.uuid.clone(),
                    "pv_fmt" => "lvm2".into(),
                    "pv_size" | "dev_size" => PV_SIZE.to_string(),
                    "pv_free" => (PV_SIZE - used).to_string(),
                    "pv_used" => used.to_string(),
                    "pv_mda_size" => "1044480".into(),
                    "pv_mda_free" => "507904".into(),
                    "pe_start" => "1048576".into(),
                    "pv_pe_count" => (PV_SIZE / EXTENT).to_string(),
                    "pv_pe_alloc_count" => (used / EXTENT).to_string(),
                    "pv_attr" => (if pv.vg.is_some() { "a--" } else { "---" }).to_string(),
                    "vg_name" => pv.vg.clone().unwrap_or_default(),
                    "vg_uuid" => vg_uuid.clone(),
                    "pv_ba_start" | "pv_ba_size" => "0".into(),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    render(rows)
}

fn render_vgs(model: &Model, columns: &[&str]) -> String {
    let rows = model
        .vgs
        .iter()
        .map(|(name, vg)| {
            let size = model.vg_size(name);
            let free = size - model.vg_used(name).min(size);
            let pv_count = model.vg_pvs(name).len();
            let lv_count = model
                .lvs
                .values()
                .filter(|lv| lv.vg == *name && !lv.name.starts_with('['))
                .count();
            columns
                .iter()
                .map(|col| match *col {
                    "vg_name" => name.clone(),
                    "vg_uuid" => vg.uuid.clone(),
                    "vg_fmt" => "lvm2".into(),
                    "vg_size" => size.to_string(),
                    "vg_free" => free.to_string(),
                    "vg_extent_size" => EXTENT.to_string(),
                    "vg_extent_count" => (size / EXTENT).to_string(),
                    "vg_free_count" => (free / EXTENT).to_string(),
                    "max_lv" | "max_pv" | "snap_count" => "0".into(),
                    "pv_count" | "vg_mda_count" | "vg_mda_used_count" => pv_count.to_string(),
                    "lv_count" => lv_count.to_string(),
                    "vg_seqno" => vg.seqno.to_string(),
                    "vg_mda_free" => "507904".into(),
                    "vg_mda_size" => "1044480".into(),
                    "vg_attr" => "wz--n-".into(),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    render(rows)
}

fn render_lvs(model: &Model, columns: &[&str]) -> String {
    let rows = model
        .lvs
        .values()
        .map(|lv| {
            let hidden = lv.name.starts_with('[');
            let vg_uuid = model.vgs.get(&lv.vg).map(|vg| vg.uuid.clone()).unwrap_or_default();
            let pool_uuid = lv
                .pool
                .as_ref()
                .and_then(|p| model.lvs.get(&format!("{}/{p}", lv.vg)))
                .map(|p| p.uuid.clone())
                .unwrap_or_default();
            let origin_uuid = lv
                .origin
                .as_ref()
                .and_then(|o| model.lvs.get(&format!("{}/{o}", lv.vg)))
                .map(|o| o.uuid.clone())
                .unwrap_or_default();
            let devices: Vec<String> = lv.devices.iter().map(|d| format!("{d}(0)")).collect();
            columns
                .iter()
                .map(|col| match *col {
                    "lv_uuid" => lv.uuid.clone(),
                    "lv_name" => lv.name.clone(),
                    "lv_path" if !hidden => format!("/dev/{}/{}", lv.vg, lv.name),
                    "lv_size" => lv.size.to_string(),
                    "vg_name" => lv.vg.clone(),
                    "vg_uuid" => vg_uuid.clone(),
                    "pool_lv_uuid" => pool_uuid.clone(),
                    "pool_lv" => lv.pool.clone().unwrap_or_default(),
                    "origin" => lv.origin.clone().unwrap_or_default(),
                    "origin_uuid" => origin_uuid.clone(),
                    "data_percent" if lv.layout.contains("pool") => "0.00".into(),
                    "lv_attr" => lv.attr.clone(),
                    "lv_active" => "active".into(),
                    "data_lv" => lv.data_lv.clone().unwrap_or_default(),
                    "metadata_lv" => lv.metadata_lv.clone().unwrap_or_default(),
                    "lv_layout" => lv.layout.clone(),
                    "segtype" => lv.segtype.clone(),
                    "devices" => devices.join(","),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    render(rows)
}

/// Advance every move by its step, retire finished ones, report the rest.
fn render_moves(model: &mut Model, columns: &[&str]) -> String {
    let mut finished = Vec::new();
    for (key, mv) in model.moves.iter_mut() {
        mv.percent = f64::min(mv.percent + mv.step, 100.0);
        if mv.percent >= 100.0 {
            finished.push(key.clone());
        }
    }
    for key in finished {
        if let Some(mv) = model.moves.remove(&key) {
            model.relocate(&mv.src, &mv.dest, mv.lv.as_deref());
        }
    }

    let rows = model
        .moves
        .iter()
        .map(|(key, mv)| {
            columns
                .iter()
                .map(|col| match *col {
                    "lv_full_name" => key.clone(),
                    "move_pv" => mv.src.clone(),
                    "copy_percent" => format!("{:.2}", mv.percent),
                    "devices" => format!("{}(0),{}(0)", mv.src, mv.dest),
                    _ => String::new(),
                })
                .collect()
        })
        .collect();
    render(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands;
    use crate::exec::{CommandRunner, RetryPolicy};
    use crate::inventory;

    fn runner(fake: &Arc<FakeLvm>) -> CommandRunner {
        CommandRunner::new(fake.clone(), RetryPolicy::default())
    }

    #[test]
    fn reports_round_trip_through_inventory() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_pv("/dev/sdb");
        fake.add_vg("vg0", &["/dev/sda", "/dev/sdb"]);
        fake.add_lv("vg0", "data", 8 << 20);

        let inv = inventory::fetch(&runner(&fake)).expect("fetch");
        assert_eq!(inv.pvs.len(), 2);
        assert_eq!(inv.vgs[0].pv_count, 2);
        assert_eq!(inv.vgs[0].free_bytes, 2 * PV_SIZE - (8 << 20));
        assert_eq!(inv.lvs[0].full_name(), "vg0/data");
        assert_eq!(inv.lvs[0].devices[0].identity.name, "/dev/sda");
    }

    #[test]
    fn background_moves_advance_per_query_and_relocate() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_pv("/dev/sdb");
        fake.add_vg("vg0", &["/dev/sda", "/dev/sdb"]);
        fake.add_lv("vg0", "data", 8 << 20);
        fake.set_move_step(50.0);
        let runner = runner(&fake);

        let none = BTreeMap::new();
        let out = runner
            .run(&commands::pv_move("/dev/sda", None, Some("vg0/data"), true, &none))
            .expect("pvmove");
        assert!(out.success());

        let first = inventory::fetch_moves(&runner).expect("moves");
        assert_eq!(first.len(), 1);
        let second = inventory::fetch_moves(&runner).expect("moves");
        assert!(second.is_empty());
        assert_eq!(fake.lv_devices("vg0/data"), ["/dev/sdb"]);
    }

    #[test]
    fn streaming_move_reports_progress_lines() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_pv("/dev/sdb");
        fake.add_vg("vg0", &["/dev/sda", "/dev/sdb"]);
        fake.add_lv("vg0", "data", 8 << 20);

        let mut stream = runner(&fake)
            .spawn(&commands::pv_move("/dev/sda", None, None, false, &BTreeMap::new()))
            .expect("spawn");
        let mut lines = Vec::new();
        while let Some(line) = stream.next_line() {
            lines.push(line);
        }
        assert_eq!(lines.last().map(String::as_str), Some("  /dev/sda: Moved: 100.0%"));
        assert!(stream.finish().expect("finish").success());
        assert_eq!(fake.lv_devices("vg0/data"), ["/dev/sdb"]);
    }
}
