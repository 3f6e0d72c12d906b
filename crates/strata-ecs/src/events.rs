//! Change records produced by storage mutations and the listener seam.
//!
//! Every mutation collects its records into a [`ChangeSet`]. The storage
//! hands the set to subscribed [`ChangeListener`]s once its write section has
//! been released, or folds it into the running batch when inside
//! `batch_update` / `merge_package`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::component::{Component, ComponentType};
use crate::entity::{Entity, EntityId};

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// What happened to a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// A single component change.
///
/// `previous` is only meaningful for [`ChangeKind::Updated`]; it is
/// [`Component::EMPTY`] otherwise (and also for the updated record that
/// accompanies a first write).
#[derive(Debug, Clone)]
pub struct ComponentChange {
    pub kind: ChangeKind,
    pub entity: Entity,
    pub component_type: ComponentType,
    pub component: Component,
    pub previous: Component,
}

/// An entity that did not exist before, with the components created on it.
#[derive(Debug, Clone)]
pub struct EntityCreated {
    pub entity: Entity,
    pub components: Vec<ComponentChange>,
}

// ---------------------------------------------------------------------------
// ChangeSet
// ---------------------------------------------------------------------------

/// All records produced by one operation or one batch.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    pub entities_created: Vec<EntityCreated>,
    pub components_created: Vec<ComponentChange>,
    pub components_updated: Vec<ComponentChange>,
    pub components_deleted: Vec<ComponentChange>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entities_created.is_empty()
            && self.components_created.is_empty()
            && self.components_updated.is_empty()
            && self.components_deleted.is_empty()
    }

    pub(crate) fn push(&mut self, change: ComponentChange) {
        match change.kind {
            ChangeKind::Created => self.components_created.push(change),
            ChangeKind::Updated => self.components_updated.push(change),
            ChangeKind::Deleted => self.components_deleted.push(change),
        }
    }

    pub(crate) fn append(&mut self, mut other: ChangeSet) {
        self.entities_created.append(&mut other.entities_created);
        self.components_created.append(&mut other.components_created);
        self.components_updated.append(&mut other.components_updated);
        self.components_deleted.append(&mut other.components_deleted);
    }

    /// Attach to every created entity all component-created records of that
    /// entity found anywhere in the set. Used when a batch is flushed so an
    /// entity created early in the batch reports components set later on.
    pub(crate) fn coalesce(&mut self) {
        if self.entities_created.is_empty() {
            return;
        }
        let mut created_by_entity: HashMap<&EntityId, Vec<ComponentChange>> = HashMap::new();
        for change in &self.components_created {
            created_by_entity
                .entry(change.entity.id())
                .or_default()
                .push(change.clone());
        }
        let mut merged: Vec<Vec<ComponentChange>> = Vec::with_capacity(self.entities_created.len());
        for created in &self.entities_created {
            merged.push(
                created_by_entity
                    .get(created.entity.id())
                    .cloned()
                    .unwrap_or_default(),
            );
        }
        for (created, components) in self.entities_created.iter_mut().zip(merged) {
            created.components = components;
        }
    }
}

// ---------------------------------------------------------------------------
// Listeners
// ---------------------------------------------------------------------------

/// Receiver of change records. All methods default to no-ops.
///
/// Callbacks run after the storage released its write section, on the
/// thread that performed the mutation. They may call back into the storage.
pub trait ChangeListener: Send + Sync {
    fn on_entities_created(&self, _created: &[EntityCreated]) {}

    fn on_components_created(&self, _changes: &[ComponentChange]) {}

    fn on_components_updated(&self, _changes: &[ComponentChange]) {}

    fn on_components_deleted(&self, _changes: &[ComponentChange]) {}
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

/// Deliver `changes` to `listeners` in the fixed record order.
pub(crate) fn dispatch(listeners: &[Arc<dyn ChangeListener>], changes: &ChangeSet) {
    if !changes.entities_created.is_empty() {
        for listener in listeners {
            listener.on_entities_created(&changes.entities_created);
        }
    }
    if !changes.components_created.is_empty() {
        for listener in listeners {
            listener.on_components_created(&changes.components_created);
        }
    }
    if !changes.components_updated.is_empty() {
        for listener in listeners {
            listener.on_components_updated(&changes.components_updated);
        }
    }
    if !changes.components_deleted.is_empty() {
        for listener in listeners {
            listener.on_components_deleted(&changes.components_deleted);
        }
    }
}
