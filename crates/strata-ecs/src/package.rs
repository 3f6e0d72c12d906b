//! Packages: batches of component writes and deletions for replication.
//!
//! A producer fills an [`EcsPackage`] from live entities, from change
//! records, or by subscribing the package to a storage as a listener. A
//! consumer applies it to another storage with
//! [`EcsStorage::merge_package`]. Merging passes captured versions through
//! the regular write path, so older components are dropped and equal or
//! newer ones overwrite. Deletions run after updates and always win.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use parking_lot::RwLock;

use crate::component::{Component, ComponentType, ComponentValue, EntityTags};
use crate::entity::{Entity, EntityId};
use crate::events::{ChangeKind, ChangeListener, ChangeSet, ComponentChange};
use crate::storage::EcsStorage;

// ---------------------------------------------------------------------------
// PackageContents
// ---------------------------------------------------------------------------

/// Plain snapshot of a package.
#[derive(Debug, Clone, Default)]
pub struct PackageContents {
    /// entity -> component type name -> component
    pub updated: BTreeMap<EntityId, BTreeMap<String, Component>>,
    pub deleted: BTreeSet<EntityId>,
    pub deleted_tags: BTreeSet<String>,
    /// Tags of each updated entity when it was captured.
    pub entity_tags: BTreeMap<EntityId, BTreeSet<String>>,
}

impl PackageContents {
    pub fn is_empty(&self) -> bool {
        self.updated.is_empty() && self.deleted.is_empty() && self.deleted_tags.is_empty()
    }

    /// Mark `id` updated and record `tags` for it, even without components.
    fn touch(&mut self, id: &EntityId, tags: impl IntoIterator<Item = String>) {
        self.updated.entry(id.clone()).or_default();
        let captured = self.entity_tags.entry(id.clone()).or_default();
        captured.extend(tags);
    }

    fn add(&mut self, id: &EntityId, component: &Component) {
        self.touch(id, None);
        let Some(concrete) = component.component_type() else {
            return;
        };
        // Tags travel in `entity_tags`, never as a component.
        if concrete == EntityTags::component_type() {
            if let Some(current) = component.downcast_ref::<EntityTags>() {
                self.touch(id, current.to_vec());
            }
            return;
        }
        if let Some(components) = self.updated.get_mut(id) {
            components.insert(concrete.name().to_owned(), component.clone());
        }
    }
}

// ---------------------------------------------------------------------------
// EcsPackage
// ---------------------------------------------------------------------------

/// Thread-safe accumulator of pending updates and deletions.
#[derive(Debug, Default)]
pub struct EcsPackage {
    contents: RwLock<PackageContents>,
}

impl EcsPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contents(contents: PackageContents) -> Self {
        Self {
            contents: RwLock::new(contents),
        }
    }

    /// A copy of the current contents.
    pub fn contents(&self) -> PackageContents {
        self.contents.read().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.read().is_empty()
    }

    pub fn clear(&self) {
        *self.contents.write() = PackageContents::default();
    }

    /// Capture `components` of `entity` along with the entity's tags.
    pub fn add_component(&self, entity: &Entity, components: &[Component]) -> &Self {
        let mut contents = self.contents.write();
        contents.touch(entity.id(), entity.tags());
        for component in components {
            contents.add(entity.id(), component);
        }
        self
    }

    /// Capture the current `T` of `entity`, if it has one. The entity and
    /// its tags are captured either way.
    pub fn add_component_of<T: ComponentValue>(&self, entity: &Entity) -> &Self {
        let found = entity.get_components_of(ComponentType::of::<T>());
        self.add_component(entity, &found)
    }

    /// Capture raw data, as decoded from the wire.
    pub fn add_raw(&self, id: EntityId, tags: &[String], components: &[Component]) -> &Self {
        let mut contents = self.contents.write();
        contents.touch(&id, tags.iter().cloned());
        for component in components {
            contents.add(&id, component);
        }
        self
    }

    /// Capture every component of every entity in `entities`.
    pub fn add_all_components(&self, entities: &[Entity]) -> &Self {
        for entity in entities {
            let components = entity.get_all_components();
            self.add_component(entity, &components);
        }
        self
    }

    /// Capture one change record. Deleted records mark the entity deleted.
    pub fn add_from_change(&self, change: &ComponentChange) -> &Self {
        match change.kind {
            ChangeKind::Created | ChangeKind::Updated => {
                self.add_component(&change.entity, std::slice::from_ref(&change.component))
            }
            ChangeKind::Deleted => self.add_deleted_ids(&[change.entity.id().clone()]),
        }
    }

    pub fn add_from_changes(&self, changes: &[ComponentChange]) -> &Self {
        for change in changes {
            self.add_from_change(change);
        }
        self
    }

    pub fn add_deleted_entity(&self, entities: &[Entity]) -> &Self {
        let mut contents = self.contents.write();
        contents
            .deleted
            .extend(entities.iter().map(|e| e.id().clone()));
        self
    }

    pub fn add_deleted_ids(&self, ids: &[EntityId]) -> &Self {
        self.contents.write().deleted.extend(ids.iter().cloned());
        self
    }

    /// Delete, on merge, every target entity carrying any of `tags`.
    pub fn add_delete_by_tag(&self, tags: &[&str]) -> &Self {
        self.contents
            .write()
            .deleted_tags
            .extend(tags.iter().map(|t| (*t).to_owned()));
        self
    }
}

impl Clone for EcsPackage {
    fn clone(&self) -> Self {
        Self::from_contents(self.contents())
    }
}

impl fmt::Display for EcsPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let contents = self.contents.read();
        writeln!(f, "Updated:")?;
        for (id, components) in &contents.updated {
            writeln!(f, "  {id}:")?;
            for (name, component) in components {
                writeln!(f, "    {name}: {component}")?;
            }
        }
        writeln!(f, "Deleted:")?;
        for id in &contents.deleted {
            writeln!(f, "  {id}")?;
        }
        writeln!(f, "Deleted tags:")?;
        for tag in &contents.deleted_tags {
            writeln!(f, "  {tag}")?;
        }
        Ok(())
    }
}

/// A subscribed package records every update and deletion it is told about.
impl ChangeListener for EcsPackage {
    fn on_components_updated(&self, changes: &[ComponentChange]) {
        self.add_from_changes(changes);
    }

    fn on_components_deleted(&self, changes: &[ComponentChange]) {
        self.add_from_changes(changes);
    }
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub entities_created: usize,
    pub components_written: usize,
    pub components_rejected: usize,
    pub entities_deleted: usize,
}

impl EcsStorage {
    /// Apply `package` to this storage in one write section.
    ///
    /// Updates first (creating missing entities with the captured tags),
    /// then deletions by tag against this storage's tag index, then
    /// deletions by id. Records are emitted once, when the section ends.
    pub fn merge_package(&self, package: &EcsPackage) -> MergeReport {
        let contents = package.contents();
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let mut report = MergeReport::default();

        for (id, components) in &contents.updated {
            let tags: Vec<&str> = contents
                .entity_tags
                .get(id)
                .map(|tags| tags.iter().map(String::as_str).collect())
                .unwrap_or_default();
            // New entities get their components before buckets see them.
            if !self.snapshot(|data| data.exists(id.as_str())) {
                let entity = self.insert_entity(
                    id,
                    tags.as_slice(),
                    components.values().cloned().collect(),
                    &mut changes,
                );
                let written = entity.cached_components().len();
                report.entities_created += 1;
                report.components_written += written;
                report.components_rejected += components.len().saturating_sub(written);
                continue;
            }

            let (entity, _) = self.create_or_get_locked(id, tags.as_slice(), &mut changes);
            let mut guard = self.data_write();
            for component in components.values() {
                match self.write_component(&mut guard, id, component.clone(), false, &mut changes) {
                    Some(stored) => {
                        entity.cache(&stored);
                        report.components_written += 1;
                    }
                    None => report.components_rejected += 1,
                }
            }
        }

        let mut doomed: Vec<EntityId> = self
            .snapshot(|data| data.with_any_tag(&contents.deleted_tags.iter().collect::<Vec<_>>()))
            .into_iter()
            .collect();
        doomed.sort();
        for id in doomed.iter().chain(contents.deleted.iter()) {
            if self.delete_locked(id, &mut changes) {
                report.entities_deleted += 1;
            }
        }

        tracing::debug!(
            storage = %self.name(),
            created = report.entities_created,
            written = report.components_written,
            rejected = report.components_rejected,
            deleted = report.entities_deleted,
            "package merged"
        );
        scope.record(changes);
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
