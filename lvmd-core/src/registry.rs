//! The resource registry: handle → object, with name and UUID reverse indices.
//!
//! # Locking
//!
//! All state lives behind one reentrant lock. [`ResourceRegistry::locked`]
//! hands callers a guard that keeps every other thread out while they perform
//! a multi-step update; single calls made while holding it re-enter freely.
//!
//! # Reservations
//!
//! Resolving a peer reference that has not been registered yet mints a handle
//! and indexes the identity with no object attached. The later `register` of
//! that resource fills the reservation, so references built earlier stay
//! valid. `lookup_by_handle` never returns a bare reservation.
//!
//! # Events
//!
//! Notifications go to the [`EventSink`] only after the internal state is
//! consistent and the interior borrow has been released.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};

use crate::error::RegistryError;
use crate::job::{Job, JOB_PROPERTY_TYPES};
use crate::schema::{HandleResolver, PropertyType, ResourceState};
use crate::types::{
    diff_properties, Handle, HandleFactory, HandleKind, Identity, ObjectRef, PropertyBag,
};

// ---------------------------------------------------------------------------
// Event sink
// ---------------------------------------------------------------------------

/// Receiver of the three registry notifications.
pub trait EventSink: Send + Sync {
    fn object_added(&self, handle: Handle, properties: &PropertyBag);
    fn object_removed(&self, handle: Handle);
    fn properties_changed(&self, handle: Handle, changed: &PropertyBag);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn object_added(&self, _: Handle, _: &PropertyBag) {}
    fn object_removed(&self, _: Handle) {}
    fn properties_changed(&self, _: Handle, _: &PropertyBag) {}
}

// ---------------------------------------------------------------------------
// Managed objects
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum ObjectBody {
    Resource {
        state: ResourceState,
        properties: PropertyBag,
    },
    Job(Arc<Job>),
}

/// An exposed entity: a resource snapshot with its property bag, or a job.
#[derive(Debug, Clone)]
pub struct ManagedObject {
    handle: Handle,
    identity: Identity,
    body: ObjectBody,
}

impl ManagedObject {
    pub fn resource(handle: Handle, state: ResourceState, properties: PropertyBag) -> Self {
        Self {
            handle,
            identity: state.identity(),
            body: ObjectBody::Resource { state, properties },
        }
    }

    pub fn job(job: Arc<Job>) -> Self {
        let handle = job.handle();
        Self {
            handle,
            identity: Identity::named(handle.to_string()),
            body: ObjectBody::Job(job),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn body(&self) -> &ObjectBody {
        &self.body
    }

    pub fn state(&self) -> Option<&ResourceState> {
        match &self.body {
            ObjectBody::Resource { state, .. } => Some(state),
            ObjectBody::Job(_) => None,
        }
    }

    pub fn as_job(&self) -> Option<&Arc<Job>> {
        match &self.body {
            ObjectBody::Job(job) => Some(job),
            ObjectBody::Resource { .. } => None,
        }
    }

    /// Current property bag. Job properties are read live.
    pub fn properties(&self) -> PropertyBag {
        match &self.body {
            ObjectBody::Resource { properties, .. } => properties.clone(),
            ObjectBody::Job(job) => job.properties(),
        }
    }

    pub fn property_types(&self) -> Vec<(&'static str, PropertyType)> {
        match &self.body {
            ObjectBody::Resource { state, .. } => state.property_types(),
            ObjectBody::Job(_) => JOB_PROPERTY_TYPES.to_vec(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Entry {
    object: Option<ManagedObject>,
    name: String,
    uuid: Option<String>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<Handle, Entry>,
    by_name: HashMap<String, Handle>,
    by_uuid: HashMap<String, Handle>,
}

impl Inner {
    /// UUID first. A name match only counts when the entry holding the name
    /// has no UUID or the same one; a different UUID is a different resource.
    fn find(&self, uuid: Option<&str>, name: &str) -> Option<Handle> {
        let uuid = uuid.filter(|u| !u.is_empty());
        if let Some(handle) = uuid.and_then(|u| self.by_uuid.get(u)) {
            return Some(*handle);
        }
        let handle = *self.by_name.get(name)?;
        let held = self.entries.get(&handle).and_then(|entry| entry.uuid.as_deref());
        match (uuid, held) {
            (Some(wanted), Some(held)) if wanted != held => None,
            _ => Some(handle),
        }
    }

    fn index(&mut self, handle: Handle, name: &str, uuid: Option<&str>) {
        self.by_name.insert(name.to_string(), handle);
        if let Some(uuid) = uuid.filter(|u| !u.is_empty()) {
            self.by_uuid.insert(uuid.to_string(), handle);
        }
    }

    fn unindex(&mut self, handle: Handle, name: &str, uuid: Option<&str>) {
        if self.by_name.get(name) == Some(&handle) {
            self.by_name.remove(name);
        }
        if let Some(uuid) = uuid {
            if self.by_uuid.get(uuid) == Some(&handle) {
                self.by_uuid.remove(uuid);
            }
        }
    }

    /// A live object other than `handle` holding either key.
    fn holder(&self, handle: Handle, identity: &Identity) -> Option<Handle> {
        let by_uuid = identity.uuid().and_then(|u| self.by_uuid.get(u));
        let by_name = self.by_name.get(&identity.name);
        by_uuid
            .into_iter()
            .chain(by_name)
            .copied()
            .find(|other| {
                *other != handle
                    && self
                        .entries
                        .get(other)
                        .map_or(false, |entry| entry.object.is_some())
            })
    }
}

/// Guard returned by [`ResourceRegistry::locked`].
pub struct RegistryLock<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<Inner>>,
}

pub struct ResourceRegistry {
    inner: ReentrantMutex<RefCell<Inner>>,
    handles: HandleFactory,
    sink: Arc<dyn EventSink>,
}

impl ResourceRegistry {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            inner: ReentrantMutex::new(RefCell::new(Inner::default())),
            handles: HandleFactory::new(),
            sink,
        }
    }

    /// Hold the registry for a multi-step update. Calls from the same thread
    /// re-enter; other threads block until the guard drops.
    pub fn locked(&self) -> RegistryLock<'_> {
        RegistryLock {
            _guard: self.inner.lock(),
        }
    }

    /// Mint a fresh handle without indexing anything.
    pub fn mint(&self, kind: HandleKind) -> Handle {
        self.handles.next(kind)
    }

    /// Register `object` under its handle, filling a reservation if one
    /// exists.
    pub fn register(&self, object: ManagedObject, emit: bool) -> Result<(), RegistryError> {
        let handle = object.handle();
        let added = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();

            if let Some(entry) = inner.entries.get(&handle) {
                if entry.object.is_some() {
                    return Err(RegistryError::AlreadyExists {
                        handle: handle.to_string(),
                    });
                }
            }
            if let Some(holder) = inner.holder(handle, object.identity()) {
                return Err(RegistryError::IdentityInUse {
                    name: object.identity().name.clone(),
                    holder: holder.to_string(),
                });
            }

            let identity = object.identity().clone();
            if let Some(old) = inner.entries.remove(&handle) {
                inner.unindex(handle, &old.name, old.uuid.as_deref());
            }
            inner.index(handle, &identity.name, identity.uuid());
            let properties = emit.then(|| object.properties());
            inner.entries.insert(
                handle,
                Entry {
                    object: Some(object),
                    name: identity.name,
                    uuid: identity.uuid,
                },
            );
            properties
        };

        if let Some(properties) = added {
            self.sink.object_added(handle, &properties);
        }
        Ok(())
    }

    /// Delete the object and its indices. Returns the removed object, or
    /// `None` if nothing live was registered under `handle`.
    pub fn remove(&self, handle: Handle, emit: bool) -> Option<ManagedObject> {
        let removed = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let live = inner
                .entries
                .get(&handle)
                .map_or(false, |entry| entry.object.is_some());
            if !live {
                return None;
            }
            let entry = inner.entries.remove(&handle)?;
            inner.unindex(handle, &entry.name, entry.uuid.as_deref());
            entry.object
        };

        if emit && removed.is_some() {
            self.sink.object_removed(handle);
        }
        removed
    }

    /// Drop an unfilled reservation. Live objects are left alone.
    pub fn release(&self, handle: Handle) -> bool {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let reserved = inner
            .entries
            .get(&handle)
            .map_or(false, |entry| entry.object.is_none());
        if reserved {
            if let Some(entry) = inner.entries.remove(&handle) {
                inner.unindex(handle, &entry.name, entry.uuid.as_deref());
            }
        }
        reserved
    }

    pub fn lookup_by_handle(&self, handle: Handle) -> Option<ManagedObject> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.entries.get(&handle).and_then(|entry| entry.object.clone())
    }

    /// Find a handle by UUID first, then by name. With `create`, a miss mints
    /// and indexes a reservation of that category; so does a hit of another
    /// category, which then takes over the identity's indices.
    pub fn lookup_by_identity(
        &self,
        uuid: Option<&str>,
        name: &str,
        create: Option<HandleKind>,
    ) -> Option<Handle> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        let found = inner.find(uuid, name);
        match (found, create) {
            (Some(handle), None) => return Some(handle),
            (Some(handle), Some(kind)) if handle.kind() == kind => return Some(handle),
            (None, None) => return None,
            _ => {}
        }
        let kind = create?;
        let handle = self.handles.next(kind);
        inner.index(handle, name, uuid);
        inner.entries.insert(
            handle,
            Entry {
                object: None,
                name: name.to_string(),
                uuid: uuid.filter(|u| !u.is_empty()).map(str::to_string),
            },
        );
        Some(handle)
    }

    /// Handle indexed under `uuid`, live or reserved.
    pub fn lookup_by_uuid(&self, uuid: &str) -> Option<Handle> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.by_uuid.get(uuid).copied()
    }

    /// Like `lookup_by_identity` without creation, but only live objects.
    pub fn find(&self, uuid: Option<&str>, name: &str) -> Option<ManagedObject> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let handle = inner.find(uuid, name)?;
        inner.entries.get(&handle).and_then(|entry| entry.object.clone())
    }

    /// Replace the identity indices of `handle` in one step. Readers see the
    /// old keys or the new keys, never both and never neither.
    pub fn rename(&self, handle: Handle, identity: &Identity) -> Result<(), RegistryError> {
        let guard = self.inner.lock();
        let mut inner = guard.borrow_mut();
        if !inner.entries.contains_key(&handle) {
            return Err(RegistryError::NotFound {
                handle: handle.to_string(),
            });
        }
        if let Some(holder) = inner.holder(handle, identity) {
            return Err(RegistryError::IdentityInUse {
                name: identity.name.clone(),
                holder: holder.to_string(),
            });
        }

        let Inner {
            entries,
            by_name,
            by_uuid,
        } = &mut *inner;
        let entry = entries.get_mut(&handle).ok_or_else(|| RegistryError::NotFound {
            handle: handle.to_string(),
        })?;

        if by_name.get(&entry.name) == Some(&handle) {
            by_name.remove(&entry.name);
        }
        if let Some(old) = &entry.uuid {
            if by_uuid.get(old) == Some(&handle) {
                by_uuid.remove(old);
            }
        }
        by_name.insert(identity.name.clone(), handle);
        if let Some(uuid) = identity.uuid() {
            by_uuid.insert(uuid.to_string(), handle);
        }
        entry.name = identity.name.clone();
        entry.uuid = identity.uuid.clone();
        if let Some(object) = entry.object.as_mut() {
            object.identity = identity.clone();
        }
        Ok(())
    }

    /// Swap in a fresh resource snapshot and bag. Returns the changed fields;
    /// a change event is emitted only when that set is non-empty.
    pub fn update(
        &self,
        handle: Handle,
        state: ResourceState,
        properties: PropertyBag,
        emit: bool,
    ) -> Result<PropertyBag, RegistryError> {
        let changed = {
            let guard = self.inner.lock();
            let mut inner = guard.borrow_mut();
            let object = inner
                .entries
                .get_mut(&handle)
                .and_then(|entry| entry.object.as_mut())
                .ok_or_else(|| RegistryError::NotFound {
                    handle: handle.to_string(),
                })?;
            match &mut object.body {
                ObjectBody::Resource {
                    state: current,
                    properties: bag,
                } => {
                    let changed = diff_properties(bag, &properties);
                    *current = state;
                    *bag = properties;
                    changed
                }
                ObjectBody::Job(_) => {
                    return Err(RegistryError::NotFound {
                        handle: handle.to_string(),
                    })
                }
            }
        };

        if emit && !changed.is_empty() {
            self.sink.properties_changed(handle, &changed);
        }
        Ok(changed)
    }

    /// Announce a job's current properties, typically after progress.
    pub fn notify_job(&self, job: &Job, changed: &PropertyBag) {
        if !changed.is_empty() && self.lookup_by_handle(job.handle()).is_some() {
            self.sink.properties_changed(job.handle(), changed);
        }
    }

    pub fn job(&self, handle: Handle) -> Option<Arc<Job>> {
        self.lookup_by_handle(handle)
            .and_then(|object| object.as_job().cloned())
    }

    /// Remove a job; refused until it has completed.
    pub fn remove_job(&self, handle: Handle) -> Result<(), RegistryError> {
        let _lock = self.locked();
        let object = self
            .lookup_by_handle(handle)
            .ok_or_else(|| RegistryError::NotFound {
                handle: handle.to_string(),
            })?;
        let job = object.as_job().ok_or_else(|| RegistryError::NotAJob {
            handle: handle.to_string(),
        })?;
        if !job.is_complete() {
            return Err(RegistryError::JobNotComplete {
                handle: handle.to_string(),
            });
        }
        self.remove(handle, true);
        Ok(())
    }

    /// Live objects, ordered by handle.
    pub fn objects(&self) -> Vec<ManagedObject> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut objects: Vec<_> = inner
            .entries
            .values()
            .filter_map(|entry| entry.object.clone())
            .collect();
        objects.sort_by_key(|object| object.handle());
        objects
    }

    /// Live handles of the given categories, ordered.
    pub fn handles_of(&self, kinds: &[HandleKind]) -> Vec<Handle> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut handles: Vec<_> = inner
            .entries
            .iter()
            .filter(|(handle, entry)| entry.object.is_some() && kinds.contains(&handle.kind()))
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    /// Handles minted by reference resolution that no object has filled yet.
    pub fn reservations(&self) -> Vec<Handle> {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        let mut handles: Vec<_> = inner
            .entries
            .iter()
            .filter(|(_, entry)| entry.object.is_none())
            .map(|(handle, _)| *handle)
            .collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        inner.entries.values().filter(|e| e.object.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HandleResolver for ResourceRegistry {
    fn resolve(&self, target: &ObjectRef) -> Handle {
        let uuid = target.identity.uuid();
        let name = &target.identity.name;
        match self.lookup_by_identity(uuid, name, Some(target.kind)) {
            Some(handle) => handle,
            None => self.mint(target.kind),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{PvState, VgState};
    use crate::types::PropertyValue;
    use parking_lot::Mutex;
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl EventSink for Recorder {
        fn object_added(&self, handle: Handle, _: &PropertyBag) {
            self.events.lock().push(format!("added {handle}"));
        }
        fn object_removed(&self, handle: Handle) {
            self.events.lock().push(format!("removed {handle}"));
        }
        fn properties_changed(&self, handle: Handle, changed: &PropertyBag) {
            let keys: Vec<_> = changed.keys().copied().collect();
            self.events.lock().push(format!("changed {handle} {}", keys.join(",")));
        }
    }

    fn registry() -> (ResourceRegistry, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        (ResourceRegistry::new(recorder.clone()), recorder)
    }

    fn vg(name: &str, uuid: &str) -> ResourceState {
        ResourceState::Vg(VgState {
            name: name.into(),
            uuid: uuid.into(),
            ..VgState::default()
        })
    }

    fn register_vg(reg: &ResourceRegistry, name: &str, uuid: &str) -> Handle {
        let state = vg(name, uuid);
        let handle = reg
            .lookup_by_identity(Some(uuid), name, Some(HandleKind::Vg))
            .expect("handle");
        let props = state.properties(reg);
        reg.register(ManagedObject::resource(handle, state, props), true)
            .expect("register");
        handle
    }

    #[test]
    fn register_then_lookup_both_ways() {
        let (reg, recorder) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");

        assert_eq!(reg.lookup_by_identity(Some("u-0"), "other", None), Some(handle));
        assert_eq!(reg.lookup_by_identity(None, "vg0", None), Some(handle));
        assert!(reg.lookup_by_handle(handle).is_some());
        assert_eq!(recorder.events.lock().as_slice(), [format!("added {handle}")]);
    }

    #[test]
    fn duplicate_handle_is_rejected() {
        let (reg, _) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");
        let state = vg("vg1", "u-1");
        let err = reg
            .register(ManagedObject::resource(handle, state, PropertyBag::new()), false)
            .unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyExists { .. }), "got: {err}");
    }

    #[test]
    fn remove_clears_indices_and_emits() {
        let (reg, recorder) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");

        assert!(reg.remove(handle, true).is_some());
        assert!(reg.lookup_by_handle(handle).is_none());
        assert_eq!(reg.lookup_by_identity(Some("u-0"), "vg0", None), None);
        assert!(reg.remove(handle, true).is_none());
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn name_held_under_another_uuid_is_not_a_match() {
        let (reg, _) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");

        assert_eq!(reg.lookup_by_identity(Some("u-1"), "vg0", None), None);
        assert_eq!(reg.lookup_by_identity(None, "vg0", None), Some(handle));
        assert_eq!(reg.lookup_by_uuid("u-0"), Some(handle));

        let fresh = reg
            .lookup_by_identity(Some("u-1"), "vg0", Some(HandleKind::Vg))
            .expect("reservation");
        assert_ne!(fresh, handle);
        assert_eq!(reg.lookup_by_identity(Some("u-0"), "zz", None), Some(handle));
    }

    #[test]
    fn rename_swaps_name_index_and_keeps_handle() {
        let (reg, _) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");

        reg.rename(handle, &Identity::new("u-0", "data")).expect("rename");
        assert_eq!(reg.lookup_by_identity(None, "vg0", None), None);
        assert_eq!(reg.lookup_by_identity(None, "data", None), Some(handle));
        assert_eq!(
            reg.lookup_by_handle(handle).expect("object").identity().name,
            "data"
        );
    }

    #[test]
    fn rename_onto_live_identity_fails() {
        let (reg, _) = registry();
        let a = register_vg(&reg, "a", "u-a");
        register_vg(&reg, "b", "u-b");
        let err = reg.rename(a, &Identity::new("u-a", "b")).unwrap_err();
        assert!(matches!(err, RegistryError::IdentityInUse { .. }), "got: {err}");
    }

    #[test]
    fn reference_reservation_is_filled_by_register() {
        let (reg, _) = registry();
        let pv = ResourceState::Pv(PvState {
            name: "/dev/sda".into(),
            uuid: "pv-u".into(),
            vg: Some(ObjectRef::new(Identity::new("vg-u", "vg0"), HandleKind::Vg)),
            ..PvState::default()
        });
        let props = pv.properties(&reg);
        let PropertyValue::Path(Some(vg_handle)) = props["Vg"] else {
            panic!("expected a vg path, got {:?}", props["Vg"]);
        };
        assert!(reg.lookup_by_handle(vg_handle).is_none());
        assert_eq!(reg.reservations(), vec![vg_handle]);

        let filled = register_vg(&reg, "vg0", "vg-u");
        assert_eq!(filled, vg_handle);
        assert!(reg.reservations().is_empty());
    }

    #[test]
    fn update_emits_only_changed_fields() {
        let (reg, recorder) = registry();
        let handle = register_vg(&reg, "vg0", "u-0");
        let next = ResourceState::Vg(VgState {
            name: "vg0".into(),
            uuid: "u-0".into(),
            free_bytes: 42,
            ..VgState::default()
        });
        let props = next.properties(&reg);

        let changed = reg.update(handle, next.clone(), props.clone(), true).expect("update");
        assert_eq!(changed.keys().copied().collect::<Vec<_>>(), ["FreeBytes"]);
        let unchanged = reg.update(handle, next, props, true).expect("update");
        assert!(unchanged.is_empty());
        assert_eq!(recorder.events.lock().len(), 2);
    }

    #[test]
    fn remove_job_requires_completion() {
        let (reg, _) = registry();
        let job = Arc::new(Job::new(reg.mint(HandleKind::Job)));
        reg.register(ManagedObject::job(job.clone()), true).expect("register");

        let err = reg.remove_job(job.handle()).unwrap_err();
        assert!(matches!(err, RegistryError::JobNotComplete { .. }), "got: {err}");

        job.complete(Ok(crate::types::OpValue::Unit));
        reg.remove_job(job.handle()).expect("remove");
        assert!(reg.job(job.handle()).is_none());
    }

    #[test]
    fn locked_scope_excludes_other_threads() {
        let (reg, _) = registry();
        let reg = Arc::new(reg);
        let handle = register_vg(&reg, "vg0", "u-0");

        let guard = reg.locked();
        reg.rename(handle, &Identity::new("u-0", "vg1")).expect("reentrant rename");

        let other = Arc::clone(&reg);
        let reader = thread::spawn(move || other.lookup_by_identity(None, "vg1", None));
        thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        reg.rename(handle, &Identity::new("u-0", "vg2")).expect("reentrant rename");
        drop(guard);

        assert_eq!(reader.join().expect("reader"), None);
    }
}
