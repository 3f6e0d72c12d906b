//! Entity identifiers and entity handles.
//!
//! An [`EntityId`] is an opaque string, a random UUID unless the caller
//! supplies one. An [`Entity`] is a handle onto one entity of one storage:
//! the id, the tags known when the handle was made, and a private cache of
//! components the handle has already read. Several handles may point at the
//! same entity; each keeps its own cache.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::component::{Component, ComponentBundle, ComponentType, ComponentValue};
use crate::storage::{EcsStorage, TypeVersion};
use crate::EcsError;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// Opaque, immutable entity identifier.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh random (version 4) UUID id.
    pub fn random() -> Self {
        let uuid = uuid::Builder::from_random_bytes(rand::random()).into_uuid();
        Self(uuid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for EntityId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for EntityId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// Handle onto a stored entity.
///
/// Reads go through the handle's cache first; writes go to the storage and
/// refresh the cache with the stored (versioned) result. Equality and
/// hashing use the id only.
pub struct Entity {
    id: EntityId,
    storage: EcsStorage,
    tags: RwLock<BTreeSet<String>>,
    cache: Mutex<HashMap<ComponentType, Component>>,
}

impl Entity {
    pub(crate) fn new(
        storage: EcsStorage,
        id: EntityId,
        tags: BTreeSet<String>,
        cached: Vec<Component>,
    ) -> Self {
        let cache = cached
            .into_iter()
            .filter_map(|c| c.component_type().map(|ty| (ty, c)))
            .collect();
        Self {
            id,
            storage,
            tags: RwLock::new(tags),
            cache: Mutex::new(cache),
        }
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The storage this handle belongs to.
    pub fn storage(&self) -> &EcsStorage {
        &self.storage
    }

    /// Tags known to this handle, sorted.
    pub fn tags(&self) -> Vec<String> {
        self.tags.read().iter().cloned().collect()
    }

    /// True when the handle carries every tag in `tags` (false for none).
    pub fn has_tag(&self, tags: &[&str]) -> bool {
        let own = self.tags.read();
        !tags.is_empty() && tags.iter().all(|t| own.contains(*t))
    }

    /// True when the handle carries at least one tag in `tags`.
    pub fn has_any_tag(&self, tags: &[&str]) -> bool {
        let own = self.tags.read();
        tags.iter().any(|t| own.contains(*t))
    }

    /// Whether the entity still exists in its storage.
    pub fn exists(&self) -> bool {
        self.storage.exists(self.id.as_str())
    }

    // -- reads --

    /// Value of the concrete component `T`, from the cache when present.
    pub fn get_component<T: ComponentValue + Clone>(&self) -> Option<T> {
        let ty = ComponentType::of::<T>();
        if let Some(value) = self.cache.lock().get(&ty).and_then(|c| c.value::<T>()) {
            return Some(value);
        }
        self.storage.get_component::<T>(self)
    }

    /// The single component stored under `ty` (concrete or family).
    ///
    /// Returns [`Component::EMPTY`] when absent and fails when several
    /// concrete types share the family on this entity.
    pub fn get_component_of(&self, ty: ComponentType) -> Result<Component, EcsError> {
        if let Some(cached) = self.cache.lock().get(&ty) {
            return Ok(cached.clone());
        }
        self.storage.get_component_of(self, ty)
    }

    /// Every component stored under `ty`, freshly read.
    pub fn get_components_of(&self, ty: ComponentType) -> Vec<Component> {
        self.storage.get_components_of(self, ty)
    }

    /// Every component of the family `F`, viewed as `Arc<F>`.
    ///
    /// Needs a resolver that can upcast to `F` (see `DeclaredFamilies`).
    pub fn get_family<F: ?Sized + Send + Sync + 'static>(&self) -> Vec<Arc<F>> {
        self.get_components_of(ComponentType::of::<F>())
            .iter()
            .filter_map(|c| self.storage.family_view::<F>(c))
            .collect()
    }

    pub fn get_all_components(&self) -> Vec<Component> {
        self.storage.get_all_components(self)
    }

    pub fn component_types(&self) -> Vec<ComponentType> {
        self.storage.get_component_types(self)
    }

    pub fn version_of(&self, ty: ComponentType) -> Result<u64, EcsError> {
        self.storage.get_component_version(self, ty)
    }

    pub fn versions_of(&self, types: &[ComponentType]) -> Vec<TypeVersion> {
        self.storage.get_components_version(self, types)
    }

    /// Drop the cached `T` and read it again.
    pub fn refresh_component<T: ComponentValue + Clone>(&self) -> Option<T> {
        self.uncache(ComponentType::of::<T>());
        self.storage.get_component::<T>(self)
    }

    /// Drop the whole cache and reload the tags.
    pub fn refresh(&self) -> &Self {
        self.cache.lock().clear();
        *self.tags.write() = self.storage.tags_of(self.id.as_str());
        self
    }

    /// Components currently held in this handle's cache.
    pub fn cached_components(&self) -> Vec<Component> {
        let mut cached: Vec<Component> = self.cache.lock().values().cloned().collect();
        cached.sort_by_key(|c| c.component_type());
        cached
    }

    // -- writes --

    pub fn set_component<T: ComponentValue>(&self, value: T) -> &Self {
        self.storage.set_component(self, value);
        self
    }

    pub fn set_components(&self, components: ComponentBundle) -> &Self {
        self.storage.set_components(self, components);
        self
    }

    pub fn set_with_version<T: ComponentValue>(&self, value: T, version: u64) -> &Self {
        self.storage.set_with_version(self, value, version);
        self
    }

    pub fn conditional_set<T: ComponentValue>(
        &self,
        value: T,
        condition: impl FnOnce(&T, &T) -> bool,
        set_when_not_exist: bool,
    ) -> bool {
        self.storage
            .conditional_set(self, value, condition, set_when_not_exist)
    }

    pub fn conditional_set_with<T: ComponentValue>(
        &self,
        condition: impl FnOnce(&T) -> bool,
        factory: impl FnOnce(Option<&T>) -> T,
        set_when_not_exist: bool,
    ) -> bool {
        self.storage
            .conditional_set_with(self, condition, factory, set_when_not_exist)
    }

    pub fn set_when_not_equal<T: ComponentValue + PartialEq>(
        &self,
        value: T,
        set_when_not_exist: bool,
    ) -> bool {
        self.storage
            .set_when_not_equal(self, value, set_when_not_exist)
    }

    pub fn update_component<T: ComponentValue + Clone + Default>(
        &self,
        factory: impl FnOnce(T) -> T,
        set_when_not_exist: bool,
    ) -> &Self {
        self.storage
            .update_component(self, factory, set_when_not_exist);
        self
    }

    pub fn add_tag(&self, tags: &[&str]) -> &Self {
        self.storage.add_tag(self, tags);
        self
    }

    /// Delete the entity from its storage.
    pub fn delete(&self) -> bool {
        self.storage.delete_entity(self)
    }

    // -- cache plumbing --

    pub(crate) fn cache(&self, component: &Component) {
        if let Some(ty) = component.component_type() {
            self.cache.lock().insert(ty, component.clone());
        }
    }

    pub(crate) fn cache_as(&self, ty: ComponentType, component: &Component) {
        self.cache.lock().insert(ty, component.clone());
    }

    pub(crate) fn uncache(&self, ty: ComponentType) {
        self.cache.lock().remove(&ty);
    }

    pub(crate) fn replace_tags(&self, tags: BTreeSet<String>) {
        *self.tags.write() = tags;
    }
}

impl Clone for Entity {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            storage: self.storage.clone(),
            tags: RwLock::new(self.tags.read().clone()),
            cache: Mutex::new(self.cache.lock().clone()),
        }
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("tags", &*self.tags.read())
            .finish()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
