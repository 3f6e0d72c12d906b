//! The storage engine: indices, the versioned write path, entity lifecycle.
//!
//! All indices live in one [`Indices`] value behind a data lock. Callers never
//! touch that lock directly; they enter the storage's reentrant [`Gate`]
//! first (read side for queries, write side for mutations) and the engine
//! takes the data lock only for short, callback-free steps. User callbacks
//! (predicates, factories, bucket key functions) run inside the gate but
//! outside the data lock, which is what makes re-entrant storage calls from
//! those callbacks safe.
//!
//! Change records are collected per write section and emitted to listeners
//! once the outermost write section ends.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock, RwLockWriteGuard};

use crate::bucket::BucketHook;
use crate::component::{
    Component, ComponentBundle, ComponentType, ComponentValue, EntityTags, TERMINAL_VERSION,
    UNSET_VERSION,
};
use crate::entity::{Entity, EntityId};
use crate::events::{self, ChangeKind, ChangeListener, ChangeSet, ComponentChange, EntityCreated, ListenerId};
use crate::family::{DeclaredFamilies, TypeFamilyResolver};
use crate::gate::{Gate, GateReadGuard, GateWriteGuard};
use crate::EcsError;

type FamilyMap = HashMap<ComponentType, HashMap<ComponentType, Component>>;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Storage construction options.
#[derive(Clone)]
pub struct StorageConfig {
    /// Name attached to every log event of the storage.
    pub name: String,
    /// Family policy used by the write path and family views.
    pub family_resolver: Arc<dyn TypeFamilyResolver>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: "default".to_owned(),
            family_resolver: Arc::new(DeclaredFamilies::new()),
        }
    }
}

impl fmt::Debug for StorageConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageConfig")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Version of one component type on one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeVersion {
    pub component_type: ComponentType,
    pub version: u64,
}

// ---------------------------------------------------------------------------
// Indices
// ---------------------------------------------------------------------------

/// Every index of a storage. Invariants span all fields, so they share a lock.
#[derive(Debug, Default)]
pub(crate) struct Indices {
    /// entity -> family type -> concrete type -> component
    pub(crate) components: HashMap<EntityId, FamilyMap>,
    /// family type -> entities holding a member of the family
    pub(crate) by_type: HashMap<ComponentType, HashSet<EntityId>>,
    pub(crate) by_tag: HashMap<String, HashSet<EntityId>>,
    pub(crate) tags_of: HashMap<EntityId, BTreeSet<String>>,
}

impl Indices {
    pub(crate) fn exists(&self, id: &str) -> bool {
        self.components.contains_key(id)
    }

    pub(crate) fn tags(&self, id: &str) -> BTreeSet<String> {
        self.tags_of.get(id).cloned().unwrap_or_default()
    }

    /// The authoritative copy of `concrete` on `id`.
    pub(crate) fn concrete(&self, id: &str, concrete: ComponentType) -> Option<&Component> {
        self.components.get(id)?.get(&concrete)?.get(&concrete)
    }

    /// Every component stored under `family` on `id`, ordered by concrete type.
    pub(crate) fn under(&self, id: &str, family: ComponentType) -> Vec<Component> {
        let Some(members) = self.components.get(id).and_then(|f| f.get(&family)) else {
            return Vec::new();
        };
        let mut entries: Vec<(&ComponentType, &Component)> = members.iter().collect();
        entries.sort_by_key(|(ty, _)| **ty);
        entries.into_iter().map(|(_, c)| c.clone()).collect()
    }

    /// Components whose family is their own concrete type.
    pub(crate) fn all_concrete(&self, id: &str) -> Vec<Component> {
        let Some(families) = self.components.get(id) else {
            return Vec::new();
        };
        let mut own: Vec<(ComponentType, Component)> = families
            .iter()
            .filter_map(|(family, members)| members.get(family).map(|c| (*family, c.clone())))
            .collect();
        own.sort_by_key(|(ty, _)| *ty);
        own.into_iter().map(|(_, c)| c).collect()
    }

    pub(crate) fn family_types(&self, id: &str) -> Vec<ComponentType> {
        let mut types: Vec<ComponentType> = self
            .components
            .get(id)
            .map(|f| f.keys().copied().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Entities carrying any of `tags`.
    pub(crate) fn with_any_tag<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<EntityId> {
        tags.iter()
            .filter_map(|t| self.by_tag.get(t.as_ref()))
            .flat_map(|ids| ids.iter().cloned())
            .collect()
    }

    /// Sorted ids holding `family`, restricted to `tags` (any of) when given.
    pub(crate) fn candidates<S: AsRef<str>>(&self, family: ComponentType, tags: &[S]) -> Vec<EntityId> {
        let Some(ids) = self.by_type.get(&family) else {
            return Vec::new();
        };
        let mut out: Vec<EntityId> = if tags.is_empty() {
            ids.iter().cloned().collect()
        } else {
            let tagged = self.with_any_tag(tags);
            ids.iter().filter(|id| tagged.contains(*id)).cloned().collect()
        };
        out.sort();
        out
    }

    pub(crate) fn all_ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.components.keys().cloned().collect();
        ids.sort();
        ids
    }
}

// ---------------------------------------------------------------------------
// EcsStorage
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    name: String,
    resolver: Arc<dyn TypeFamilyResolver>,
    gate: Gate,
    data: RwLock<Indices>,
    /// Records of the running write section, `Some` while one is open.
    pending: Mutex<Option<ChangeSet>>,
    listeners: RwLock<Vec<(ListenerId, Arc<dyn ChangeListener>)>>,
    next_listener: AtomicU64,
    buckets: Mutex<Vec<Weak<dyn BucketHook>>>,
}

/// In-memory entity-component store.
///
/// Cloning is cheap and yields another handle to the same store.
#[derive(Clone)]
pub struct EcsStorage {
    shared: Arc<Shared>,
}

impl EcsStorage {
    /// A storage with the default configuration.
    pub fn new() -> Self {
        Self::with_config(StorageConfig::default())
    }

    pub fn with_config(config: StorageConfig) -> Self {
        tracing::debug!(storage = %config.name, "storage created");
        Self {
            shared: Arc::new(Shared {
                name: config.name,
                resolver: config.family_resolver,
                gate: Gate::new(),
                data: RwLock::new(Indices::default()),
                pending: Mutex::new(None),
                listeners: RwLock::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                buckets: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn family_resolver(&self) -> &Arc<dyn TypeFamilyResolver> {
        &self.shared.resolver
    }

    /// Whether both handles refer to the same store.
    pub fn same_storage(&self, other: &EcsStorage) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    // -- listeners --

    pub fn subscribe(&self, listener: Arc<dyn ChangeListener>) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        self.shared.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener. Returns false if it was not subscribed.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.shared.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn emit(&self, changes: &ChangeSet) {
        let listeners: Vec<Arc<dyn ChangeListener>> = self
            .shared
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if !listeners.is_empty() {
            events::dispatch(&listeners, changes);
        }
    }

    // -- sections --

    pub(crate) fn read_section(&self) -> GateReadGuard<'_> {
        self.shared.gate.read()
    }

    /// Open (or join) a write section. Records are flushed when the
    /// outermost section is dropped.
    pub(crate) fn begin_write(&self) -> WriteScope<'_> {
        let guard = self.shared.gate.write();
        let owner = {
            let mut pending = self.shared.pending.lock();
            if pending.is_none() {
                *pending = Some(ChangeSet::new());
                true
            } else {
                false
            }
        };
        WriteScope {
            storage: self,
            guard: Some(guard),
            owner,
        }
    }

    /// Borrow the indices. The caller must be inside a section.
    pub(crate) fn snapshot<R>(&self, f: impl FnOnce(&Indices) -> R) -> R {
        let data = self.shared.data.read_recursive();
        f(&data)
    }

    /// Lock the indices for writing. The caller must hold the write section
    /// and must not run user code while the guard lives.
    pub(crate) fn data_write(&self) -> RwLockWriteGuard<'_, Indices> {
        debug_assert!(self.shared.gate.is_writer(), "index mutation outside a write section");
        self.shared.data.write()
    }

    /// Enter a read section and borrow the indices.
    pub(crate) fn read<R>(&self, f: impl FnOnce(&Indices) -> R) -> R {
        let _section = self.read_section();
        self.snapshot(f)
    }

    pub(crate) fn make_entity(&self, data: &Indices, id: &EntityId, cached: Vec<Component>) -> Entity {
        Entity::new(self.clone(), id.clone(), data.tags(id.as_str()), cached)
    }

    // -- buckets --

    pub(crate) fn register_bucket(&self, hook: Weak<dyn BucketHook>) {
        self.shared.buckets.lock().push(hook);
    }

    fn live_buckets(&self) -> Vec<Arc<dyn BucketHook>> {
        let mut buckets = self.shared.buckets.lock();
        buckets.retain(|b| b.strong_count() > 0);
        buckets.iter().filter_map(Weak::upgrade).collect()
    }

    // -- write path --

    /// Version-aware upsert of one component. The caller holds the write
    /// section and the data lock. Returns the stored component, or `None`
    /// when the entity is missing, the component is empty, or the write
    /// carried a stale version.
    pub(crate) fn write_component(
        &self,
        data: &mut Indices,
        id: &EntityId,
        component: Component,
        override_version: bool,
        changes: &mut ChangeSet,
    ) -> Option<Component> {
        let concrete = component.component_type()?;
        let previous = data
            .components
            .get(id)?
            .get(&concrete)
            .and_then(|members| members.get(&concrete))
            .cloned();

        let incoming = component.version();
        let version = match &previous {
            Some(stored) if incoming == UNSET_VERSION => next_version(stored.version()),
            Some(stored)
                if !override_version
                    && incoming < stored.version()
                    && stored.version() != TERMINAL_VERSION =>
            {
                tracing::warn!(
                    storage = %self.shared.name,
                    entity = %id,
                    component = %concrete,
                    stored = stored.version(),
                    incoming,
                    "stale component version rejected"
                );
                return None;
            }
            None if incoming == UNSET_VERSION => 1,
            _ => incoming,
        };
        let component = component.with_version(version);

        let mut families = self.shared.resolver.families(concrete);
        if !families.contains(&concrete) {
            families.insert(0, concrete);
        }
        let family_map = data.components.get_mut(id)?;
        for family in &families {
            family_map
                .entry(*family)
                .or_default()
                .insert(concrete, component.clone());
        }
        for family in families {
            data.by_type.entry(family).or_default().insert(id.clone());
        }

        tracing::trace!(entity = %id, component = %concrete, version, "component written");

        let entity = self.make_entity(data, id, vec![component.clone()]);
        if previous.is_none() {
            changes.push(ComponentChange {
                kind: ChangeKind::Created,
                entity: entity.clone(),
                component_type: concrete,
                component: component.clone(),
                previous: Component::EMPTY,
            });
        }
        changes.push(ComponentChange {
            kind: ChangeKind::Updated,
            entity,
            component_type: concrete,
            component: component.clone(),
            previous: previous.unwrap_or(Component::EMPTY),
        });
        Some(component)
    }

    /// Union `tags` into the entity's tag set and rewrite its tags component.
    pub(crate) fn add_tags_locked<S: AsRef<str>>(
        &self,
        data: &mut Indices,
        id: &EntityId,
        tags: &[S],
        changes: &mut ChangeSet,
    ) -> Option<BTreeSet<String>> {
        if tags.is_empty() || !data.exists(id.as_str()) {
            return None;
        }
        let own = data.tags_of.entry(id.clone()).or_default();
        for tag in tags {
            let tag = tag.as_ref();
            own.insert(tag.to_owned());
            data.by_tag.entry(tag.to_owned()).or_default().insert(id.clone());
        }
        let current = own.clone();
        self.write_component(
            data,
            id,
            Component::unversioned(EntityTags::from(current.clone())),
            false,
            changes,
        );
        Some(current)
    }

    /// Insert a new entity. The caller holds the write section and has
    /// checked that `id` is free.
    pub(crate) fn insert_entity<S: AsRef<str>>(
        &self,
        id: &EntityId,
        tags: &[S],
        components: Vec<Component>,
        changes: &mut ChangeSet,
    ) -> Entity {
        let mut local = ChangeSet::new();
        let entity = {
            let mut guard = self.data_write();
            let data = &mut *guard;
            data.components.insert(id.clone(), FamilyMap::new());
            self.add_tags_locked(data, id, tags, &mut local);
            let mut cached = Vec::with_capacity(components.len());
            for component in components {
                if let Some(stored) = self.write_component(data, id, component, false, &mut local) {
                    cached.push(stored);
                }
            }
            self.make_entity(data, id, cached)
        };

        for bucket in self.live_buckets() {
            bucket.entity_created(&entity);
        }

        tracing::debug!(storage = %self.shared.name, entity = %id, "entity created");
        changes.entities_created.push(EntityCreated {
            entity: entity.clone(),
            components: local.components_created.clone(),
        });
        changes.append(local);
        entity
    }

    /// Get-or-create by id. The caller holds the write section.
    pub(crate) fn create_or_get_locked<S: AsRef<str>>(
        &self,
        id: &EntityId,
        tags: &[S],
        changes: &mut ChangeSet,
    ) -> (Entity, bool) {
        let existing = self.snapshot(|data| data.exists(id.as_str()).then(|| data.tags(id.as_str())));
        match existing {
            Some(current) => {
                let missing: Vec<&str> = tags
                    .iter()
                    .map(|t| t.as_ref())
                    .filter(|t| !current.contains(*t))
                    .collect();
                if !missing.is_empty() {
                    let mut guard = self.data_write();
                    self.add_tags_locked(&mut guard, id, &missing, changes);
                }
                (self.snapshot(|data| self.make_entity(data, id, Vec::new())), false)
            }
            None => (self.insert_entity(id, tags, Vec::new(), changes), true),
        }
    }

    /// Remove an entity from every index. The caller holds the write section.
    pub(crate) fn delete_locked(&self, id: &EntityId, changes: &mut ChangeSet) -> bool {
        let Some(entity) = self.snapshot(|data| {
            data.exists(id.as_str())
                .then(|| self.make_entity(data, id, Vec::new()))
        }) else {
            return false;
        };

        for bucket in self.live_buckets() {
            bucket.entity_deleted(&entity);
        }

        let mut guard = self.data_write();
        let data = &mut *guard;
        let Some(families) = data.components.remove(id) else {
            return false;
        };
        let tags_type = EntityTags::component_type();
        let mut deleted: Vec<(ComponentType, Component)> = Vec::new();
        for (family, members) in &families {
            let now_empty = match data.by_type.get_mut(family) {
                Some(ids) => {
                    ids.remove(id);
                    ids.is_empty()
                }
                None => false,
            };
            if now_empty {
                data.by_type.remove(family);
            }
            if *family == tags_type {
                continue;
            }
            if let Some(component) = members.get(family) {
                deleted.push((*family, component.clone()));
            }
        }
        if let Some(tags) = data.tags_of.remove(id) {
            for tag in tags {
                let now_empty = match data.by_tag.get_mut(&tag) {
                    Some(ids) => {
                        ids.remove(id);
                        ids.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    data.by_tag.remove(&tag);
                }
            }
        }
        drop(guard);

        deleted.sort_by_key(|(ty, _)| *ty);
        for (component_type, component) in deleted {
            changes.push(ComponentChange {
                kind: ChangeKind::Deleted,
                entity: entity.clone(),
                component_type,
                component,
                previous: Component::EMPTY,
            });
        }
        tracing::debug!(storage = %self.shared.name, entity = %id, "entity deleted");
        true
    }

    fn fresh_id(&self) -> EntityId {
        loop {
            let id = EntityId::random();
            if !self.snapshot(|data| data.exists(id.as_str())) {
                return id;
            }
        }
    }

    /// Write one component through `entity`, refreshing its cache.
    fn write_through(&self, entity: &Entity, component: Component, override_version: bool) -> bool {
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let stored = {
            let mut guard = self.data_write();
            self.write_component(&mut guard, entity.id(), component, override_version, &mut changes)
        };
        scope.record(changes);
        match stored {
            Some(stored) => {
                entity.cache(&stored);
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Create an entity with a random id and no components.
    pub fn create_entity(&self) -> Entity {
        self.create_with(ComponentBundle::new())
    }

    /// Create an entity with a random id.
    pub fn create_with(&self, components: ComponentBundle) -> Entity {
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let id = self.fresh_id();
        let no_tags: [&str; 0] = [];
        let entity = self.insert_entity(&id, &no_tags, components.into_components(), &mut changes);
        scope.record(changes);
        entity
    }

    /// Create an entity.
    ///
    /// Fails with [`EcsError::DuplicateId`] when `id` is given and taken.
    pub fn create(
        &self,
        components: ComponentBundle,
        tags: &[&str],
        id: Option<&str>,
    ) -> Result<Entity, EcsError> {
        let scope = self.begin_write();
        let id = match id {
            Some(id) => {
                if self.snapshot(|data| data.exists(id)) {
                    return Err(EcsError::DuplicateId { id: id.to_owned() });
                }
                EntityId::from(id)
            }
            None => self.fresh_id(),
        };
        let mut changes = ChangeSet::new();
        let entity = self.insert_entity(&id, tags, components.into_components(), &mut changes);
        scope.record(changes);
        Ok(entity)
    }

    /// Idempotent creation by id. Returns the handle and whether it was created.
    pub fn create_or_get_with_id(&self, id: &str, tags: &[&str]) -> (Entity, bool) {
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let result = self.create_or_get_locked(&EntityId::from(id), tags, &mut changes);
        scope.record(changes);
        result
    }

    /// Return the unique entity whose `T` equals `value`, or create one.
    ///
    /// Non-empty `tags` narrow the search to entities carrying any of them
    /// and are given to a newly created entity. The existing entity wins: `value` is not written to it. Fails with
    /// [`EcsError::AmbiguousResult`] when several entities match.
    pub fn create_or_get_by_component<T>(&self, value: T, tags: &[&str]) -> Result<Entity, EcsError>
    where
        T: ComponentValue + PartialEq + Clone,
    {
        let probe = value.clone();
        self.create_or_get_by_component_matching(value, move |existing: &T| *existing == probe, tags)
    }

    /// Like [`create_or_get_by_component`](Self::create_or_get_by_component)
    /// with an explicit match predicate.
    pub fn create_or_get_by_component_matching<T>(
        &self,
        value: T,
        predicate: impl Fn(&T) -> bool,
        tags: &[&str],
    ) -> Result<Entity, EcsError>
    where
        T: ComponentValue,
    {
        let _scope = self.begin_write();
        match self.query::<T>().filter(predicate).tagged(tags).single()? {
            Some(existing) => Ok(existing),
            None => self.create(ComponentBundle::new().with(value), tags, None),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Unconditional upsert. No-op when the entity does not exist.
    pub fn set_component<T: ComponentValue>(&self, entity: &Entity, value: T) {
        self.write_through(entity, Component::unversioned(value), false);
    }

    /// Unconditional upsert of every value in `components`, in order.
    pub fn set_components(&self, entity: &Entity, components: ComponentBundle) {
        let _scope = self.begin_write();
        for component in components.into_components() {
            self.write_through(entity, component.with_version(UNSET_VERSION), false);
        }
    }

    /// Upsert with an explicit version, skipping the stale-version guard.
    /// `version == 0` auto-increments.
    pub fn set_with_version<T: ComponentValue>(&self, entity: &Entity, value: T, version: u64) {
        entity.uncache(ComponentType::of::<T>());
        self.write_through(entity, Component::new(version, value), true);
    }

    /// Write `value` if the entity has no `T` (and `set_when_not_exist`) or
    /// `condition(existing, value)` holds. Returns whether it was written.
    pub fn conditional_set<T: ComponentValue>(
        &self,
        entity: &Entity,
        value: T,
        condition: impl FnOnce(&T, &T) -> bool,
        set_when_not_exist: bool,
    ) -> bool {
        let _scope = self.begin_write();
        let Some(current) = self.current::<T>(entity) else {
            return false;
        };
        let allowed = match current.as_ref().and_then(|c| c.downcast_ref::<T>()) {
            Some(existing) => condition(existing, &value),
            None => set_when_not_exist,
        };
        allowed && self.write_through(entity, Component::unversioned(value), false)
    }

    /// Like [`conditional_set`](Self::conditional_set) with the value built
    /// from the existing one, only once the write is allowed.
    pub fn conditional_set_with<T: ComponentValue>(
        &self,
        entity: &Entity,
        condition: impl FnOnce(&T) -> bool,
        factory: impl FnOnce(Option<&T>) -> T,
        set_when_not_exist: bool,
    ) -> bool {
        let _scope = self.begin_write();
        let Some(current) = self.current::<T>(entity) else {
            return false;
        };
        let existing = current.as_ref().and_then(|c| c.downcast_ref::<T>());
        let allowed = match existing {
            Some(existing) => condition(existing),
            None => set_when_not_exist,
        };
        if !allowed {
            return false;
        }
        let value = factory(existing);
        self.write_through(entity, Component::unversioned(value), false)
    }

    /// Write `value` unless it equals the stored `T`.
    pub fn set_when_not_equal<T: ComponentValue + PartialEq>(
        &self,
        entity: &Entity,
        value: T,
        set_when_not_exist: bool,
    ) -> bool {
        self.set_when_not_equal_with(entity, move |_| Some(value), set_when_not_exist)
    }

    /// Build a value from the stored `T` and write it when it is `Some` and
    /// differs from the stored one.
    pub fn set_when_not_equal_with<T: ComponentValue + PartialEq>(
        &self,
        entity: &Entity,
        factory: impl FnOnce(Option<&T>) -> Option<T>,
        set_when_not_exist: bool,
    ) -> bool {
        let _scope = self.begin_write();
        let Some(current) = self.current::<T>(entity) else {
            return false;
        };
        let existing = current.as_ref().and_then(|c| c.downcast_ref::<T>());
        if existing.is_none() && !set_when_not_exist {
            return false;
        }
        match factory(existing) {
            Some(value) if existing != Some(&value) => {
                self.write_through(entity, Component::unversioned(value), false)
            }
            _ => false,
        }
    }

    /// Replace `T` with `factory(old)`, `old` defaulting when absent.
    pub fn update_component<T: ComponentValue + Clone + Default>(
        &self,
        entity: &Entity,
        factory: impl FnOnce(T) -> T,
        set_when_not_exist: bool,
    ) -> Entity {
        let scope = self.begin_write();
        if let Some(current) = self.current::<T>(entity) {
            let existing = current.as_ref().and_then(|c| c.value::<T>());
            if existing.is_some() || set_when_not_exist {
                let value = factory(existing.unwrap_or_default());
                self.write_through(entity, Component::unversioned(value), false);
            }
        }
        drop(scope);
        entity.clone()
    }

    /// `None` when the entity is gone, `Some(None)` when it lacks `T`.
    fn current<T: ComponentValue>(&self, entity: &Entity) -> Option<Option<Component>> {
        let ty = ComponentType::of::<T>();
        self.read(|data| {
            data.exists(entity.id().as_str())
                .then(|| data.concrete(entity.id().as_str(), ty).cloned())
        })
    }

    // -----------------------------------------------------------------------
    // Tags
    // -----------------------------------------------------------------------

    /// Add tags to an entity. Emits an update of its tags component.
    pub fn add_tag(&self, entity: &Entity, tags: &[&str]) {
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let updated = {
            let mut guard = self.data_write();
            self.add_tags_locked(&mut guard, entity.id(), tags, &mut changes)
        };
        scope.record(changes);
        if let Some(tags) = updated {
            entity.replace_tags(tags);
        }
    }

    /// True when the stored entity carries every tag in `tags`.
    pub fn has_tag(&self, entity: &Entity, tags: &[&str]) -> bool {
        let own = self.tags_of(entity.id().as_str());
        !tags.is_empty() && tags.iter().all(|t| own.contains(*t))
    }

    /// True when the stored entity carries any tag in `tags`.
    pub fn has_any_tag(&self, entity: &Entity, tags: &[&str]) -> bool {
        let own = self.tags_of(entity.id().as_str());
        tags.iter().any(|t| own.contains(*t))
    }

    pub fn tags_of(&self, id: &str) -> BTreeSet<String> {
        self.read(|data| data.tags(id))
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    /// Delete an entity. Returns false when it did not exist.
    pub fn delete_entity(&self, entity: &Entity) -> bool {
        self.delete_entity_by_id(entity.id().as_str())
    }

    pub fn delete_entity_by_id(&self, id: &str) -> bool {
        let scope = self.begin_write();
        let mut changes = ChangeSet::new();
        let deleted = self.delete_locked(&EntityId::from(id), &mut changes);
        scope.record(changes);
        deleted
    }

    /// Delete every entity whose `T` matches `predicate`, limited to
    /// entities carrying any of `tags` when non-empty. Returns the count.
    pub fn delete_entities_by_component<T: ComponentValue>(
        &self,
        predicate: impl Fn(&T) -> bool,
        tags: &[&str],
    ) -> usize {
        let scope = self.begin_write();
        let matches = self.query::<T>().filter(predicate).tagged(tags).entities();
        let mut changes = ChangeSet::new();
        let count = matches
            .iter()
            .filter(|e| self.delete_locked(e.id(), &mut changes))
            .count();
        scope.record(changes);
        count
    }

    /// Delete every entity carrying any of `tags`.
    pub fn delete_entities_with_tag(&self, tags: &[&str]) -> usize {
        let scope = self.begin_write();
        let mut ids: Vec<EntityId> = self
            .snapshot(|data| data.with_any_tag(tags))
            .into_iter()
            .collect();
        ids.sort();
        let mut changes = ChangeSet::new();
        let count = ids
            .iter()
            .filter(|id| self.delete_locked(id, &mut changes))
            .count();
        scope.record(changes);
        count
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn exists(&self, id: &str) -> bool {
        self.read(|data| data.exists(id))
    }

    pub fn entity_count(&self) -> usize {
        self.read(|data| data.components.len())
    }

    /// Value of the concrete component `T`, cached on `entity`.
    pub fn get_component<T: ComponentValue + Clone>(&self, entity: &Entity) -> Option<T> {
        let ty = ComponentType::of::<T>();
        let component = self.read(|data| data.concrete(entity.id().as_str(), ty).cloned())?;
        entity.cache(&component);
        component.value::<T>()
    }

    /// The single component under `ty`; [`Component::EMPTY`] when absent.
    pub fn get_component_of(&self, entity: &Entity, ty: ComponentType) -> Result<Component, EcsError> {
        let mut found = self.read(|data| data.under(entity.id().as_str(), ty));
        match found.len() {
            0 => Ok(Component::EMPTY),
            1 => {
                let component = found.remove(0);
                entity.cache_as(ty, &component);
                Ok(component)
            }
            matches => Err(EcsError::AmbiguousResult { matches }),
        }
    }

    /// Every component under `ty`, cached on `entity` by concrete type.
    pub fn get_components_of(&self, entity: &Entity, ty: ComponentType) -> Vec<Component> {
        let found = self.read(|data| data.under(entity.id().as_str(), ty));
        for component in &found {
            entity.cache(component);
        }
        found
    }

    /// Every component whose family is its own type, tags component included.
    pub fn get_all_components(&self, entity: &Entity) -> Vec<Component> {
        let found = self.read(|data| data.all_concrete(entity.id().as_str()));
        for component in &found {
            entity.cache(component);
        }
        found
    }

    /// Every type (concrete and family) the entity is indexed under.
    pub fn get_component_types(&self, entity: &Entity) -> Vec<ComponentType> {
        self.read(|data| data.family_types(entity.id().as_str()))
    }

    /// Version of the single component under `ty`, 0 when absent.
    pub fn get_component_version(&self, entity: &Entity, ty: ComponentType) -> Result<u64, EcsError> {
        Ok(self.get_component_of(entity, ty)?.version())
    }

    /// Versions of the concrete components in `types` the entity holds.
    pub fn get_components_version(&self, entity: &Entity, types: &[ComponentType]) -> Vec<TypeVersion> {
        self.read(|data| {
            types
                .iter()
                .filter_map(|ty| {
                    data.concrete(entity.id().as_str(), *ty).map(|c| TypeVersion {
                        component_type: *ty,
                        version: c.version(),
                    })
                })
                .collect()
        })
    }

    /// View `component` as a member of the family `F`.
    pub fn family_view<F: ?Sized + Send + Sync + 'static>(&self, component: &Component) -> Option<Arc<F>> {
        let boxed = self
            .shared
            .resolver
            .upcast(ComponentType::of::<F>(), component)?;
        boxed.downcast::<Arc<F>>().ok().map(|view| *view)
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Run `action` inside one write section and emit its records once at
    /// the end. Nested calls join the outer section.
    pub fn batch_update<R>(&self, action: impl FnOnce(&EcsStorage) -> R) -> R {
        let _scope = self.begin_write();
        action(self)
    }

    /// Run several reads inside one read section.
    pub fn batch_query<R>(&self, action: impl FnOnce(&EcsStorage) -> R) -> R {
        let _section = self.read_section();
        action(self)
    }
}

impl Default for EcsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EcsStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcsStorage")
            .field("name", &self.shared.name)
            .field("entities", &self.entity_count())
            .finish()
    }
}

fn next_version(stored: u64) -> u64 {
    if stored == TERMINAL_VERSION {
        1
    } else {
        stored + 1
    }
}

// ---------------------------------------------------------------------------
// WriteScope
// ---------------------------------------------------------------------------

/// An open write section. The outermost scope owns the pending records and
/// emits them after releasing the gate; on unwind they are discarded.
pub(crate) struct WriteScope<'a> {
    storage: &'a EcsStorage,
    guard: Option<GateWriteGuard<'a>>,
    owner: bool,
}

impl WriteScope<'_> {
    pub(crate) fn record(&self, changes: ChangeSet) {
        if changes.is_empty() {
            return;
        }
        if let Some(pending) = self.storage.shared.pending.lock().as_mut() {
            pending.append(changes);
        }
    }
}

impl Drop for WriteScope<'_> {
    fn drop(&mut self) {
        let pending = if self.owner {
            self.storage.shared.pending.lock().take()
        } else {
            None
        };
        drop(self.guard.take());
        if let Some(mut changes) = pending {
            if !std::thread::panicking() && !changes.is_empty() {
                changes.coalesce();
                self.storage.emit(&changes);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
