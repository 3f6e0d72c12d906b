//! Ordered, clonable result sets of entity handles.

use std::ops::Index;

use crate::component::ComponentValue;
use crate::entity::{Entity, EntityId};
use crate::EcsError;

/// The result of a query: entity handles in a stable order, each with the
/// components the query matched already in its cache.
#[derive(Debug, Clone, Default)]
pub struct EntityCollection {
    entities: Vec<Entity>,
}

impl EntityCollection {
    pub fn new(entities: Vec<Entity>) -> Self {
        Self { entities }
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entity> {
        self.entities.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Entity> {
        self.entities.get(index)
    }

    pub fn first(&self) -> Option<&Entity> {
        self.entities.first()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.entities.iter().map(|e| e.id().clone()).collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entities.iter().any(|e| e.id().as_str() == id)
    }

    /// The only entity, `None` when empty, an error when there are several.
    pub fn single(mut self) -> Result<Option<Entity>, EcsError> {
        match self.entities.len() {
            0 => Ok(None),
            1 => Ok(self.entities.pop()),
            matches => Err(EcsError::AmbiguousResult { matches }),
        }
    }

    /// `T` of every entity that has one, in collection order.
    pub fn components<T: ComponentValue + Clone>(&self) -> Vec<T> {
        self.entities
            .iter()
            .filter_map(|e| e.get_component::<T>())
            .collect()
    }

    pub fn into_vec(self) -> Vec<Entity> {
        self.entities
    }
}

impl Index<usize> for EntityCollection {
    type Output = Entity;

    fn index(&self, index: usize) -> &Entity {
        &self.entities[index]
    }
}

impl IntoIterator for EntityCollection {
    type Item = Entity;
    type IntoIter = std::vec::IntoIter<Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.into_iter()
    }
}

impl<'a> IntoIterator for &'a EntityCollection {
    type Item = &'a Entity;
    type IntoIter = std::slice::Iter<'a, Entity>;

    fn into_iter(self) -> Self::IntoIter {
        self.entities.iter()
    }
}

impl FromIterator<Entity> for EntityCollection {
    fn from_iter<I: IntoIterator<Item = Entity>>(iter: I) -> Self {
        Self {
            entities: iter.into_iter().collect(),
        }
    }
}
