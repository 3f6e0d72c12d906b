//! Per-type change collection on top of a storage's change records.
//!
//! A [`ComponentChangesCollector`] watches a set of component types (concrete
//! types or families) and keeps, between two [`pop`](ComponentChangesCollector::pop)
//! calls, the latest update of each watched component per entity and every
//! deleted entity that held one. Intermediate updates are folded away, so a
//! consumer polling at its own pace sees only the state it has to catch up
//! with.
//!
//! # Example
//!
//! ```
//! use strata_changes::ComponentChangesCollector;
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Score(u32);
//!
//! let storage = EcsStorage::new();
//! let collector = ComponentChangesCollector::attach(&storage, &[ComponentType::of::<Score>()]);
//!
//! let player = storage.create_entity();
//! player.set_component(Score(1)).set_component(Score(2));
//!
//! let report = collector.pop();
//! assert_eq!(report.updated.len(), 1);
//! assert_eq!(report.updated[0].components[0].component.value::<Score>(), Some(Score(2)));
//! assert!(!collector.has_updates());
//! ```

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use strata_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Latest watched components of one updated entity, ordered by type.
#[derive(Debug, Clone)]
pub struct EntityUpdated {
    pub entity: Entity,
    pub components: Vec<ComponentChange>,
}

/// A deleted entity with the watched components it held.
#[derive(Debug, Clone)]
pub struct EntityDeleted {
    pub entity: Entity,
    pub components: Vec<ComponentChange>,
}

/// Everything collected since the previous pop, ordered by entity id.
#[derive(Debug, Clone, Default)]
pub struct CollectorReport {
    pub updated: Vec<EntityUpdated>,
    pub deleted: Vec<EntityDeleted>,
}

impl CollectorReport {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Listener side
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Pending {
    updated: BTreeMap<EntityId, BTreeMap<ComponentType, ComponentChange>>,
    deleted: BTreeMap<EntityId, Vec<ComponentChange>>,
}

struct Watcher {
    watched: HashSet<ComponentType>,
    resolver: Arc<dyn TypeFamilyResolver>,
    pending: Mutex<Pending>,
}

impl Watcher {
    /// Whether `concrete`, or one of its families, is watched.
    fn watches(&self, concrete: ComponentType) -> bool {
        self.watched.contains(&concrete)
            || self
                .resolver
                .families(concrete)
                .iter()
                .any(|family| self.watched.contains(family))
    }
}

impl ChangeListener for Watcher {
    fn on_components_updated(&self, changes: &[ComponentChange]) {
        let mut pending = self.pending.lock();
        for change in changes.iter().filter(|c| self.watches(c.component_type)) {
            let id = change.entity.id().clone();
            pending.deleted.remove(&id);
            pending
                .updated
                .entry(id)
                .or_default()
                .insert(change.component_type, change.clone());
        }
    }

    fn on_components_deleted(&self, changes: &[ComponentChange]) {
        let mut pending = self.pending.lock();
        for change in changes.iter().filter(|c| self.watches(c.component_type)) {
            let id = change.entity.id();
            pending.updated.remove(id);
            pending
                .deleted
                .entry(id.clone())
                .or_default()
                .push(change.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// ComponentChangesCollector
// ---------------------------------------------------------------------------

/// Subscribed collector of watched component changes.
///
/// Dropping the collector unsubscribes it from the storage.
pub struct ComponentChangesCollector {
    storage: EcsStorage,
    subscription: ListenerId,
    watcher: Arc<Watcher>,
}

impl ComponentChangesCollector {
    /// Subscribe to `storage`, watching `types`. Family types match every
    /// concrete member the storage's resolver assigns to them.
    pub fn attach(storage: &EcsStorage, types: &[ComponentType]) -> Self {
        let watcher = Arc::new(Watcher {
            watched: types.iter().copied().collect(),
            resolver: Arc::clone(storage.family_resolver()),
            pending: Mutex::new(Pending::default()),
        });
        let subscription = storage.subscribe(watcher.clone());
        tracing::debug!(storage = %storage.name(), types = types.len(), "changes collector attached");
        Self {
            storage: storage.clone(),
            subscription,
            watcher,
        }
    }

    /// Watched types, sorted.
    pub fn watched(&self) -> Vec<ComponentType> {
        let mut types: Vec<ComponentType> = self.watcher.watched.iter().copied().collect();
        types.sort();
        types
    }

    /// Whether anything was collected since the last pop.
    pub fn has_updates(&self) -> bool {
        let pending = self.watcher.pending.lock();
        !pending.updated.is_empty() || !pending.deleted.is_empty()
    }

    /// Take everything collected so far.
    pub fn pop(&self) -> CollectorReport {
        let Pending { updated, deleted } = std::mem::take(&mut *self.watcher.pending.lock());

        let updated: Vec<EntityUpdated> = updated
            .into_values()
            .filter_map(|by_type| {
                let components: Vec<ComponentChange> = by_type.into_values().collect();
                let entity = components.last()?.entity.clone();
                Some(EntityUpdated { entity, components })
            })
            .collect();
        let deleted: Vec<EntityDeleted> = deleted
            .into_values()
            .filter_map(|components| {
                let entity = components.first()?.entity.clone();
                Some(EntityDeleted { entity, components })
            })
            .collect();

        tracing::trace!(
            storage = %self.storage.name(),
            updated = updated.len(),
            deleted = deleted.len(),
            "changes collector popped"
        );
        CollectorReport { updated, deleted }
    }
}

impl Drop for ComponentChangesCollector {
    fn drop(&mut self) {
        self.storage.unsubscribe(self.subscription);
    }
}

impl std::fmt::Debug for ComponentChangesCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentChangesCollector")
            .field("storage", &self.storage.name())
            .field("watched", &self.watched())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
