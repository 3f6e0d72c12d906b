//! Versioned component records and runtime component type identity.
//!
//! A [`Component`] pairs a version counter with a shared, type-erased payload.
//! [`ComponentType`] identifies payload types at runtime and is the key used
//! by every index in the storage (primary map, type index, package maps).

use std::any::{Any, TypeId};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Version carried by writes that want the storage to pick the next version.
/// Never persisted.
pub const UNSET_VERSION: u64 = 0;

/// Terminal "pinned" version. The next local write after it restarts at 1.
pub const TERMINAL_VERSION: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// ComponentType
// ---------------------------------------------------------------------------

/// Runtime identity of a component type or of a component family.
///
/// Families are usually trait objects (`ComponentType::of::<dyn Car>()`),
/// concrete types are plain structs. Equality and hashing use the Rust
/// `TypeId` only; the name is kept for logs and the package wire format.
#[derive(Clone, Copy)]
pub struct ComponentType {
    id: TypeId,
    name: &'static str,
}

impl ComponentType {
    /// The component type of `T`.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// The underlying Rust `TypeId`.
    pub fn type_id(&self) -> TypeId {
        self.id
    }

    /// Full type name, as produced by `std::any::type_name`.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether this is the component type of `T`.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for ComponentType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ComponentType {}

impl Hash for ComponentType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for ComponentType {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComponentType {
    fn cmp(&self, other: &Self) -> Ordering {
        self.name.cmp(other.name).then_with(|| self.id.cmp(&other.id))
    }
}

impl fmt::Debug for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentType({})", self.name)
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// ---------------------------------------------------------------------------
// ComponentValue
// ---------------------------------------------------------------------------

/// Anything that can be stored as component data.
///
/// Implemented for every `Send + Sync + Debug + 'static` type; there is
/// nothing to implement by hand.
pub trait ComponentValue: Any + Send + Sync + fmt::Debug {
    /// Borrow the payload as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Convert a shared payload into a shared `Any`.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    /// Concrete component type of the payload.
    fn component_type(&self) -> ComponentType;
}

impl<T: Any + Send + Sync + fmt::Debug> ComponentValue for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn component_type(&self) -> ComponentType {
        ComponentType::of::<T>()
    }
}

// ---------------------------------------------------------------------------
// Component
// ---------------------------------------------------------------------------

/// A versioned component record.
///
/// Payloads are shared (`Arc`) so the same stored value can sit under every
/// family alias of its concrete type and inside entity handle caches without
/// copying. [`Component::EMPTY`] (version 0, no data) stands for "absent".
#[derive(Clone)]
pub struct Component {
    version: u64,
    data: Option<Arc<dyn ComponentValue>>,
}

impl Component {
    /// The absent-component sentinel.
    pub const EMPTY: Component = Component {
        version: UNSET_VERSION,
        data: None,
    };

    /// A component carrying `value` at `version`.
    pub fn new<T: ComponentValue>(version: u64, value: T) -> Self {
        Self {
            version,
            data: Some(Arc::new(value)),
        }
    }

    /// A component that lets the storage choose the version on write.
    pub fn unversioned<T: ComponentValue>(value: T) -> Self {
        Self::new(UNSET_VERSION, value)
    }

    /// A component around an already shared payload.
    pub fn from_shared(version: u64, data: Arc<dyn ComponentValue>) -> Self {
        Self {
            version,
            data: Some(data),
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// True for [`Component::EMPTY`] and any record without a payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_none()
    }

    /// Concrete type of the payload, `None` when empty.
    pub fn component_type(&self) -> Option<ComponentType> {
        self.data.as_deref().map(|data| data.component_type())
    }

    /// Borrow the type-erased payload.
    pub fn data(&self) -> Option<&dyn ComponentValue> {
        self.data.as_deref()
    }

    /// The shared payload handle.
    pub fn shared(&self) -> Option<&Arc<dyn ComponentValue>> {
        self.data.as_ref()
    }

    /// Whether the payload is a `T`.
    pub fn is<T: 'static>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    /// Borrow the payload as a `T`.
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.data
            .as_deref()
            .and_then(|data| data.as_any().downcast_ref::<T>())
    }

    /// Clone the payload out as a `T`.
    pub fn value<T: Clone + 'static>(&self) -> Option<T> {
        self.downcast_ref::<T>().cloned()
    }

    /// Same payload, different version.
    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// The payload as a shared `Any`, for family upcasts.
    pub(crate) fn shared_any(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.data
            .as_ref()
            .map(|data| <dyn ComponentValue as ComponentValue>::into_any(Arc::clone(data)))
    }
}

impl Default for Component {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("version", &self.version)
            .field("data", &self.data)
            .finish()
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data {
            None => f.write_str("Empty"),
            Some(data) => write!(f, "Version: {}, Data: {:?}", self.version, data),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityTags
// ---------------------------------------------------------------------------

/// Synthetic component holding an entity's tag set.
///
/// Tag changes are written through the regular component path so they show
/// up as created/updated records. Packages never carry it as a component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTags(BTreeSet<String>);

impl EntityTags {
    pub fn new<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(tags.into_iter().map(Into::into).collect())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.0.contains(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }

    /// The reserved component type of the tags component.
    pub fn component_type() -> ComponentType {
        ComponentType::of::<EntityTags>()
    }
}

impl From<BTreeSet<String>> for EntityTags {
    fn from(tags: BTreeSet<String>) -> Self {
        Self(tags)
    }
}

// ---------------------------------------------------------------------------
// ComponentBundle
// ---------------------------------------------------------------------------

/// An ordered set of heterogeneous component values for a single write.
///
/// Used by entity creation and `set_components`; every value in the bundle
/// is written unversioned, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct ComponentBundle {
    components: Vec<Component>,
}

impl ComponentBundle {
    /// Create an empty bundle.
    pub fn new() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Add a value to the bundle.
    pub fn add<T: ComponentValue>(&mut self, value: T) -> &mut Self {
        self.components.push(Component::unversioned(value));
        self
    }

    /// Builder-style [`add`](Self::add).
    pub fn with<T: ComponentValue>(mut self, value: T) -> Self {
        self.add(value);
        self
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub(crate) fn into_components(self) -> Vec<Component> {
        self.components
    }
}

impl FromIterator<Component> for ComponentBundle {
    fn from_iter<I: IntoIterator<Item = Component>>(iter: I) -> Self {
        Self {
            components: iter.into_iter().collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
