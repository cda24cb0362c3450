//! Reconciliation against the in-memory lvm model.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use lvmd_core::{EventSink, Handle, HandleKind, PropertyBag, ResourceRegistry};
use lvmd_sync::testing::FakeLvm;
use lvmd_sync::{CommandRunner, RetryPolicy, StateSync, SyncError};

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl Recorder {
    fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for Recorder {
    fn object_added(&self, handle: Handle, _: &PropertyBag) {
        self.events.lock().push(format!("added {handle}"));
    }
    fn object_removed(&self, handle: Handle) {
        self.events.lock().push(format!("removed {handle}"));
    }
    fn properties_changed(&self, handle: Handle, changed: &PropertyBag) {
        let keys: Vec<&str> = changed.keys().copied().collect();
        self.events
            .lock()
            .push(format!("changed {handle} {}", keys.join(",")));
    }
}

struct Fixture {
    fake: Arc<FakeLvm>,
    sink: Arc<Recorder>,
    sync: Arc<StateSync>,
}

fn fixture() -> Fixture {
    let _ = env_logger::builder().is_test(true).try_init();
    let fake = Arc::new(FakeLvm::new());
    fake.add_pv("/dev/sda");
    fake.add_pv("/dev/sdb");
    fake.add_vg("vg0", &["/dev/sda", "/dev/sdb"]);
    fake.add_lv("vg0", "data", 64 << 20);

    let sink = Arc::new(Recorder::default());
    let runner = Arc::new(CommandRunner::new(
        fake.clone(),
        RetryPolicy {
            attempts: 3,
            delay: Duration::from_millis(1),
        },
    ));
    let registry = Arc::new(ResourceRegistry::new(sink.clone()));
    let sync = Arc::new(StateSync::new(runner, registry));
    Fixture { fake, sink, sync }
}

#[test]
fn first_pass_adds_everything_second_pass_is_silent() {
    let f = fixture();

    let first = f.sync.refresh().expect("first refresh");
    assert_eq!(first.added, 4, "two PVs, one VG, one LV");
    assert_eq!(f.sink.take().len(), 4);

    let second = f.sync.refresh().expect("second refresh");
    assert_eq!(second.total(), 0);
    assert!(f.sink.take().is_empty(), "unchanged inventory emits nothing");
}

#[test]
fn concurrent_refreshes_never_duplicate() {
    let f = fixture();
    f.fake.set_delay("lvs", Duration::from_millis(5));

    let workers: Vec<_> = (0..4)
        .map(|_| {
            let sync = Arc::clone(&f.sync);
            thread::spawn(move || sync.refresh().expect("refresh"))
        })
        .collect();
    let added: usize = workers
        .into_iter()
        .map(|w| w.join().expect("join").added)
        .sum();

    assert_eq!(added, 4);
    assert_eq!(f.sync.registry().len(), 4);
    assert_eq!(f.fake.peak_concurrency(), 1, "lvm calls are serialized");
}

#[test]
fn external_rename_keeps_the_handle() {
    let f = fixture();
    f.sync.refresh().expect("refresh");
    let registry = f.sync.registry();
    let vg = registry
        .lookup_by_identity(None, "vg0", None)
        .expect("vg0 registered");
    let lv = registry
        .lookup_by_identity(None, "vg0/data", None)
        .expect("lv registered");
    f.sink.take();

    f.fake.rename_vg("vg0", "tank");
    let summary = f.sync.refresh().expect("refresh");

    assert_eq!(summary.added, 0);
    assert_eq!(summary.removed, 0);
    assert_eq!(registry.lookup_by_identity(None, "tank", None), Some(vg));
    assert_eq!(registry.lookup_by_identity(None, "tank/data", None), Some(lv));
    assert!(registry.lookup_by_identity(None, "vg0", None).is_none());

    let events = f.sink.take();
    assert!(
        events.iter().any(|e| e.starts_with(&format!("changed {vg}")) && e.contains("Name")),
        "got: {events:?}"
    );
}

#[test]
fn renamed_vg_keeps_its_handle_when_a_newcomer_takes_the_old_name() {
    let f = fixture();
    f.sync.refresh().expect("refresh");
    let registry = f.sync.registry();
    let original = registry
        .lookup_by_identity(None, "vg0", None)
        .expect("vg0 registered");
    let original_uuid = registry
        .lookup_by_handle(original)
        .and_then(|object| object.identity().uuid().map(str::to_string))
        .expect("vg0 uuid");
    let lv = registry
        .lookup_by_identity(None, "vg0/data", None)
        .expect("lv registered");

    f.fake.rename_vg("vg0", "zz");
    f.fake.add_pv("/dev/sdc");
    let newcomer_uuid = f.fake.add_vg("vg0", &["/dev/sdc"]);
    let summary = f.sync.refresh().expect("refresh");

    assert_eq!(summary.removed, 0, "nothing vanished: {summary:?}");
    assert_eq!(registry.lookup_by_uuid(&original_uuid), Some(original));
    assert_eq!(registry.lookup_by_identity(None, "zz", None), Some(original));
    assert_eq!(registry.lookup_by_identity(None, "zz/data", None), Some(lv));

    let newcomer = registry
        .lookup_by_identity(None, "vg0", None)
        .expect("new vg0 registered");
    assert_ne!(newcomer, original);
    assert_eq!(registry.lookup_by_uuid(&newcomer_uuid), Some(newcomer));
    assert!(registry.reservations().is_empty());
}

#[test]
fn vanished_volume_is_removed_and_referrers_update() {
    let f = fixture();
    f.sync.refresh().expect("refresh");
    let registry = f.sync.registry();
    let lv = registry
        .lookup_by_identity(None, "vg0/data", None)
        .expect("lv");
    f.sink.take();

    f.fake.remove_lv("vg0/data");
    let summary = f.sync.refresh().expect("refresh");

    assert_eq!(summary.removed, 1);
    assert!(registry.lookup_by_handle(lv).is_none());
    let events = f.sink.take();
    assert!(events.contains(&format!("removed {lv}")), "got: {events:?}");
    let vg = registry.lookup_by_identity(None, "vg0", None).expect("vg");
    assert!(
        events.iter().any(|e| e.starts_with(&format!("changed {vg}")) && e.contains("Lvs")),
        "got: {events:?}"
    );
}

#[test]
fn thin_pool_conversion_hides_internal_volumes_from_the_vg() {
    let f = fixture();
    f.fake.convert_to_thin_pool("vg0/data");
    f.sync.refresh().expect("refresh");
    let registry = f.sync.registry();

    assert_eq!(registry.handles_of(&[HandleKind::ThinPool]).len(), 1);
    assert_eq!(registry.handles_of(&[HandleKind::HiddenLv]).len(), 2);

    let vg = registry.lookup_by_identity(None, "vg0", None).expect("vg");
    let props = registry.lookup_by_handle(vg).expect("vg object").properties();
    let lvs = serde_json::to_value(&props["Lvs"]).expect("json");
    assert_eq!(lvs.as_array().map(Vec::len), Some(1));
}

#[test]
fn persistent_query_failure_leaves_registry_untouched() {
    let f = fixture();
    f.sync.refresh().expect("refresh");
    let before = f.sync.registry().len();

    f.fake.fail_next_queries(100);
    let err = f.sync.refresh().unwrap_err();
    assert!(matches!(err, SyncError::QueryFailed { attempts: 3, .. }), "got: {err}");
    assert_eq!(f.sync.registry().len(), before);
}
