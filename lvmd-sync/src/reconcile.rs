//! Reconciliation of a fetched inventory against the registry.
//!
//! `reconcile_and_apply` holds the registry lock for the whole pass, so no
//! reader ever observes a half-applied refresh. Entities whose UUID is
//! already indexed are applied first, so renames release their old names
//! before any newcomer is matched by name. Order of work per entity: match
//! by UUID-or-name, rename if the identity moved, then diff and apply the
//! property bag. Objects absent from the inventory are removed last.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;

use lvmd_core::{Handle, HandleKind, ManagedObject, ResourceRegistry, ResourceState};

use crate::error::SyncError;
use crate::exec::CommandRunner;
use crate::inventory::{self, Inventory};

/// Resource categories owned by reconciliation. Jobs are never touched.
const RESOURCE_KINDS: &[HandleKind] = &[
    HandleKind::Pv,
    HandleKind::Vg,
    HandleKind::Lv,
    HandleKind::ThinPool,
    HandleKind::CachePool,
    HandleKind::HiddenLv,
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub added: usize,
    pub removed: usize,
    pub changed: usize,
    pub renamed: usize,
}

impl ReconcileSummary {
    pub fn total(&self) -> usize {
        self.added + self.removed + self.changed + self.renamed
    }
}

pub struct StateSync {
    runner: Arc<CommandRunner>,
    registry: Arc<ResourceRegistry>,
}

impl StateSync {
    pub fn new(runner: Arc<CommandRunner>, registry: Arc<ResourceRegistry>) -> Self {
        Self { runner, registry }
    }

    pub fn runner(&self) -> &Arc<CommandRunner> {
        &self.runner
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn fetch(&self) -> Result<Inventory, SyncError> {
        inventory::fetch(&self.runner)
    }

    /// Fetch and apply in one step.
    pub fn refresh(&self) -> Result<ReconcileSummary, SyncError> {
        let inventory = self.fetch()?;
        self.reconcile_and_apply(inventory)
    }

    pub fn reconcile_and_apply(&self, inventory: Inventory) -> Result<ReconcileSummary, SyncError> {
        let registry = &*self.registry;
        let _lock = registry.locked();
        let mut summary = ReconcileSummary::default();
        let mut seen: HashSet<Handle> = HashSet::new();

        let (known, unknown): (Vec<_>, Vec<_>) = inventory.into_states().partition(|state| {
            state
                .identity()
                .uuid()
                .and_then(|uuid| registry.lookup_by_uuid(uuid))
                .is_some()
        });

        for state in known.into_iter().chain(unknown) {
            let handle = self.claim_handle(&state, &mut summary);
            seen.insert(handle);

            let identity = state.identity();
            match registry.lookup_by_handle(handle) {
                Some(existing) => {
                    if existing.identity() != &identity {
                        match registry.rename(handle, &identity) {
                            Ok(()) => {
                                tracing::info!("renamed {handle}: {} -> {identity}", existing.identity());
                                summary.renamed += 1;
                            }
                            Err(err) => {
                                tracing::warn!("rename of {handle} deferred: {err}");
                                continue;
                            }
                        }
                    }
                    let properties = state.properties(registry);
                    let changed = registry.update(handle, state, properties, true)?;
                    if !changed.is_empty() {
                        tracing::debug!("{handle}: {} field(s) changed", changed.len());
                        summary.changed += 1;
                    }
                }
                None => {
                    let properties = state.properties(registry);
                    registry.register(ManagedObject::resource(handle, state, properties), true)?;
                    tracing::debug!("added {handle} ({identity})");
                    summary.added += 1;
                }
            }
        }

        for handle in registry.handles_of(RESOURCE_KINDS) {
            if !seen.contains(&handle) && registry.remove(handle, true).is_some() {
                tracing::debug!("removed {handle}");
                summary.removed += 1;
            }
        }

        if summary.total() > 0 {
            tracing::info!(
                "reconciled: +{} -{} ~{} renamed {}",
                summary.added,
                summary.removed,
                summary.changed,
                summary.renamed
            );
        }
        Ok(summary)
    }

    /// Handle for a fetched entity: the existing one, or a fresh one when the
    /// entity is new or changed category (e.g. converted into a pool).
    fn claim_handle(&self, state: &ResourceState, summary: &mut ReconcileSummary) -> Handle {
        let registry = &*self.registry;
        let identity = state.identity();
        let kind = state.handle_kind();

        if let Some(existing) = registry.lookup_by_identity(identity.uuid(), &identity.name, None) {
            if existing.kind() == kind {
                return existing;
            }
            if registry.remove(existing, true).is_some() {
                tracing::info!("{existing} changed category to {kind}");
                summary.removed += 1;
            } else {
                registry.release(existing);
            }
        }
        registry
            .lookup_by_identity(identity.uuid(), &identity.name, Some(kind))
            .unwrap_or_else(|| registry.mint(kind))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::RetryPolicy;
    use crate::testing::FakeLvm;
    use lvmd_core::NullSink;

    fn state_sync(fake: &Arc<FakeLvm>) -> StateSync {
        let runner = Arc::new(CommandRunner::new(fake.clone(), RetryPolicy::default()));
        StateSync::new(runner, Arc::new(ResourceRegistry::new(Arc::new(NullSink))))
    }

    #[test]
    fn category_change_replaces_the_handle() {
        let fake = Arc::new(FakeLvm::new());
        fake.add_pv("/dev/sda");
        fake.add_vg("vg0", &["/dev/sda"]);
        fake.add_lv("vg0", "lv", 4 << 20);
        let sync = state_sync(&fake);
        sync.refresh().expect("refresh");
        let before = sync
            .registry()
            .lookup_by_identity(None, "vg0/lv", None)
            .expect("lv");
        assert_eq!(before.kind(), HandleKind::Lv);

        fake.convert_to_thin_pool("vg0/lv");
        sync.refresh().expect("refresh");
        let after = sync
            .registry()
            .lookup_by_identity(None, "vg0/lv", None)
            .expect("pool");
        assert_eq!(after.kind(), HandleKind::ThinPool);
        assert!(sync.registry().lookup_by_handle(before).is_none());
    }

    #[test]
    fn jobs_survive_reconciliation() {
        let fake = Arc::new(FakeLvm::new());
        let sync = state_sync(&fake);
        let registry = sync.registry();
        let job = Arc::new(lvmd_core::Job::new(registry.mint(HandleKind::Job)));
        registry
            .register(ManagedObject::job(job.clone()), false)
            .expect("register job");

        sync.refresh().expect("refresh");
        assert!(registry.job(job.handle()).is_some());
    }
}
