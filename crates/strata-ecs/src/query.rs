//! Predicate queries over the type and tag indices.
//!
//! Every query follows the same steps: collect candidate ids from the type
//! index (kept only if they carry one of the requested tags, when tags are
//! given), snapshot their components, release the data lock, then run the
//! caller's predicates. Survivors come back as handles with the matched
//! components already cached.
//!
//! Queries over several types use union semantics: an entity matches when it
//! has at least one of the types. Use an entity predicate to require more.

use std::collections::{BTreeSet, HashSet};
use std::marker::PhantomData;

use crate::collection::EntityCollection;
use crate::component::{Component, ComponentType, ComponentValue};
use crate::entity::{Entity, EntityId};
use crate::storage::EcsStorage;
use crate::EcsError;

type KeepFn<'s> = Box<dyn Fn(&Component, &Entity) -> bool + 's>;
type EntityFn<'s> = Box<dyn Fn(&Entity) -> bool + 's>;

fn chain<'s>(existing: Option<KeepFn<'s>>, next: KeepFn<'s>) -> KeepFn<'s> {
    match existing {
        None => next,
        Some(first) => Box::new(move |c: &Component, e: &Entity| first(c, e) && next(c, e)),
    }
}

fn owned_tags(tags: &[&str]) -> Vec<String> {
    tags.iter().map(|t| (*t).to_owned()).collect()
}

// ---------------------------------------------------------------------------
// Query<T>
// ---------------------------------------------------------------------------

/// Query over one concrete component type.
#[must_use]
pub struct Query<'s, T> {
    storage: &'s EcsStorage,
    tags: Vec<String>,
    keep: Option<KeepFn<'s>>,
    _marker: PhantomData<fn() -> T>,
}

impl<'s, T: ComponentValue> Query<'s, T> {
    /// Keep entities whose `T` satisfies `predicate`. Filters accumulate.
    pub fn filter(mut self, predicate: impl Fn(&T) -> bool + 's) -> Self {
        let next: KeepFn<'s> = Box::new(move |c: &Component, _: &Entity| {
            c.downcast_ref::<T>().is_some_and(|value| predicate(value))
        });
        self.keep = Some(chain(self.keep.take(), next));
        self
    }

    /// Keep entities for which `predicate(value, entity)` holds.
    pub fn filter_entity(mut self, predicate: impl Fn(&T, &Entity) -> bool + 's) -> Self {
        let next: KeepFn<'s> = Box::new(move |c: &Component, e: &Entity| {
            c.downcast_ref::<T>().is_some_and(|value| predicate(value, e))
        });
        self.keep = Some(chain(self.keep.take(), next));
        self
    }

    /// Only consider entities carrying any of `tags`.
    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags.extend(owned_tags(tags));
        self
    }

    pub fn entities(self) -> EntityCollection {
        self.storage
            .select(ComponentType::of::<T>(), &self.tags, self.keep.as_deref())
    }

    /// At most one match; several is an [`EcsError::AmbiguousResult`].
    pub fn single(self) -> Result<Option<Entity>, EcsError> {
        self.entities().single()
    }

    pub fn count(self) -> usize {
        self.entities().len()
    }
}

// ---------------------------------------------------------------------------
// TypeQuery
// ---------------------------------------------------------------------------

/// Query over a runtime component type, concrete or family.
#[must_use]
pub struct TypeQuery<'s> {
    storage: &'s EcsStorage,
    component_type: ComponentType,
    tags: Vec<String>,
    keep: Option<KeepFn<'s>>,
}

impl<'s> TypeQuery<'s> {
    /// Keep components (and their entities) satisfying `predicate`.
    pub fn filter(mut self, predicate: impl Fn(&Component, &Entity) -> bool + 's) -> Self {
        self.keep = Some(chain(self.keep.take(), Box::new(predicate)));
        self
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags.extend(owned_tags(tags));
        self
    }

    pub fn entities(self) -> EntityCollection {
        self.storage
            .select(self.component_type, &self.tags, self.keep.as_deref())
    }

    pub fn single(self) -> Result<Option<Entity>, EcsError> {
        self.entities().single()
    }

    pub fn count(self) -> usize {
        self.entities().len()
    }
}

// ---------------------------------------------------------------------------
// FamilyQuery<F>
// ---------------------------------------------------------------------------

/// Query over a family type, with predicates on the family view `&F`.
///
/// Predicates need a resolver able to upcast to `F`; members without a view
/// never pass a predicate.
#[must_use]
pub struct FamilyQuery<'s, F: ?Sized> {
    inner: TypeQuery<'s>,
    _marker: PhantomData<fn(&F)>,
}

impl<'s, F: ?Sized + Send + Sync + 'static> FamilyQuery<'s, F> {
    pub fn filter(mut self, predicate: impl Fn(&F) -> bool + 's) -> Self {
        let storage = self.inner.storage;
        self.inner = self.inner.filter(move |c: &Component, _: &Entity| {
            storage
                .family_view::<F>(c)
                .is_some_and(|view| predicate(&*view))
        });
        self
    }

    pub fn filter_entity(mut self, predicate: impl Fn(&F, &Entity) -> bool + 's) -> Self {
        let storage = self.inner.storage;
        self.inner = self.inner.filter(move |c: &Component, e: &Entity| {
            storage
                .family_view::<F>(c)
                .is_some_and(|view| predicate(&*view, e))
        });
        self
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.inner = self.inner.tagged(tags);
        self
    }

    pub fn entities(self) -> EntityCollection {
        self.inner.entities()
    }

    pub fn single(self) -> Result<Option<Entity>, EcsError> {
        self.inner.single()
    }

    pub fn count(self) -> usize {
        self.inner.count()
    }
}

// ---------------------------------------------------------------------------
// MultiTypeQuery
// ---------------------------------------------------------------------------

/// Query over the union of several types, with whole-entity predicates.
#[must_use]
pub struct MultiTypeQuery<'s> {
    storage: &'s EcsStorage,
    types: Vec<ComponentType>,
    tags: Vec<String>,
    keep: Option<EntityFn<'s>>,
}

impl<'s> MultiTypeQuery<'s> {
    pub fn filter(mut self, predicate: impl Fn(&Entity) -> bool + 's) -> Self {
        let next: EntityFn<'s> = match self.keep.take() {
            None => Box::new(predicate),
            Some(first) => Box::new(move |e: &Entity| first(e) && predicate(e)),
        };
        self.keep = Some(next);
        self
    }

    pub fn tagged(mut self, tags: &[&str]) -> Self {
        self.tags.extend(owned_tags(tags));
        self
    }

    pub fn entities(self) -> EntityCollection {
        let _section = self.storage.read_section();
        let rows: Vec<(EntityId, BTreeSet<String>, Vec<Component>)> = self.storage.snapshot(|data| {
            let ids: BTreeSet<EntityId> = self
                .types
                .iter()
                .flat_map(|ty| data.candidates(*ty, &self.tags))
                .collect();
            ids.into_iter()
                .map(|id| {
                    let tags = data.tags(id.as_str());
                    let components = self
                        .types
                        .iter()
                        .flat_map(|ty| data.under(id.as_str(), *ty))
                        .collect();
                    (id, tags, components)
                })
                .collect()
        });

        rows.into_iter()
            .map(|(id, tags, components)| Entity::new(self.storage.clone(), id, tags, components))
            .filter(|entity| self.keep.as_ref().map_or(true, |keep| keep(entity)))
            .collect()
    }

    pub fn single(self) -> Result<Option<Entity>, EcsError> {
        self.entities().single()
    }

    pub fn count(self) -> usize {
        self.entities().len()
    }
}

// ---------------------------------------------------------------------------
// Storage entry points
// ---------------------------------------------------------------------------

impl EcsStorage {
    pub(crate) fn select(
        &self,
        family: ComponentType,
        tags: &[String],
        keep: Option<&dyn Fn(&Component, &Entity) -> bool>,
    ) -> EntityCollection {
        let _section = self.read_section();
        let rows: Vec<(EntityId, BTreeSet<String>, Vec<Component>)> = self.snapshot(|data| {
            data.candidates(family, tags)
                .into_iter()
                .map(|id| {
                    let tags = data.tags(id.as_str());
                    let components = data.under(id.as_str(), family);
                    (id, tags, components)
                })
                .collect()
        });

        rows.into_iter()
            .filter_map(|(id, tags, components)| {
                let entity = Entity::new(self.clone(), id, tags, Vec::new());
                let kept: Vec<Component> = match keep {
                    Some(keep) => components.into_iter().filter(|c| keep(c, &entity)).collect(),
                    None => components,
                };
                if kept.is_empty() {
                    return None;
                }
                for component in &kept {
                    entity.cache(component);
                }
                Some(entity)
            })
            .collect()
    }

    /// Query entities holding the concrete component `T`.
    pub fn query<T: ComponentValue>(&self) -> Query<'_, T> {
        Query {
            storage: self,
            tags: Vec::new(),
            keep: None,
            _marker: PhantomData,
        }
    }

    /// Query entities holding a component of `component_type`.
    pub fn query_type(&self, component_type: ComponentType) -> TypeQuery<'_> {
        TypeQuery {
            storage: self,
            component_type,
            tags: Vec::new(),
            keep: None,
        }
    }

    /// Query entities holding any member of the family `F`.
    pub fn query_family<F: ?Sized + Send + Sync + 'static>(&self) -> FamilyQuery<'_, F> {
        FamilyQuery {
            inner: self.query_type(ComponentType::of::<F>()),
            _marker: PhantomData,
        }
    }

    /// Query entities holding at least one of `types`.
    pub fn query_types(&self, types: &[ComponentType]) -> MultiTypeQuery<'_> {
        MultiTypeQuery {
            storage: self,
            types: types.to_vec(),
            tags: Vec::new(),
            keep: None,
        }
    }

    /// Existing entities among `ids`, in the given order, without duplicates.
    pub fn query_ids<S: AsRef<str>>(&self, ids: &[S]) -> EntityCollection {
        let mut seen = HashSet::new();
        self.read(|data| {
            ids.iter()
                .map(|id| id.as_ref())
                .filter(|id| data.exists(id) && seen.insert(*id))
                .map(|id| self.make_entity(data, &EntityId::from(id), Vec::new()))
                .collect()
        })
    }

    /// Fresh handles for the entities of `entities` that still exist.
    pub fn query_entities(&self, entities: &[Entity]) -> EntityCollection {
        let ids: Vec<&str> = entities.iter().map(|e| e.id().as_str()).collect();
        self.query_ids(&ids)
    }

    pub fn query_single_id(&self, id: &str) -> Option<Entity> {
        self.read(|data| {
            data.exists(id)
                .then(|| self.make_entity(data, &EntityId::from(id), Vec::new()))
        })
    }

    /// Every entity, ordered by id.
    pub fn query_all(&self) -> EntityCollection {
        self.read(|data| {
            data.all_ids()
                .iter()
                .map(|id| self.make_entity(data, id, Vec::new()))
                .collect()
        })
    }

    /// Entities carrying any of `tags`, with all their components cached.
    pub fn query_by_tags(&self, tags: &[&str]) -> EntityCollection {
        self.read(|data| {
            let mut ids: Vec<EntityId> = data.with_any_tag(tags).into_iter().collect();
            ids.sort();
            ids.iter()
                .map(|id| self.make_entity(data, id, data.all_concrete(id.as_str())))
                .collect()
        })
    }

    pub fn query_single_by_tags(&self, tags: &[&str]) -> Result<Option<Entity>, EcsError> {
        self.query_by_tags(tags).single()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
