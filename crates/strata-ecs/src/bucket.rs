//! Lookup buckets: incrementally maintained `key -> entity` indices.
//!
//! A bucket is registered with its storage and updated inside the same write
//! section as every entity creation and deletion, package merges included.
//! The storage only keeps a weak reference; dropping the last
//! [`LookupBucket`] handle unregisters it.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::entity::{Entity, EntityId};
use crate::storage::EcsStorage;
use crate::EcsError;

/// Storage-side view of a bucket.
pub(crate) trait BucketHook: Send + Sync {
    fn entity_created(&self, entity: &Entity);
    fn entity_deleted(&self, entity: &Entity);
}

struct BucketInner<K> {
    storage: EcsStorage,
    matches: Box<dyn Fn(&Entity) -> bool + Send + Sync>,
    key_of: Box<dyn Fn(&Entity) -> K + Send + Sync>,
    keys: RwLock<HashMap<K, EntityId>>,
}

impl<K> BucketHook for BucketInner<K>
where
    K: Eq + Hash + Send + Sync,
{
    fn entity_created(&self, entity: &Entity) {
        if (self.matches)(entity) {
            let key = (self.key_of)(entity);
            self.keys.write().insert(key, entity.id().clone());
        }
    }

    fn entity_deleted(&self, entity: &Entity) {
        if (self.matches)(entity) {
            let key = (self.key_of)(entity);
            let mut keys = self.keys.write();
            if keys.get(&key) == Some(entity.id()) {
                keys.remove(&key);
            }
        }
    }
}

/// Secondary index from a derived key to an entity.
///
/// Cloning yields another handle to the same bucket.
pub struct LookupBucket<K> {
    inner: Arc<BucketInner<K>>,
}

impl<K> Clone for LookupBucket<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> LookupBucket<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    /// The entity registered under `key`.
    pub fn try_get_entity(&self, key: &K) -> Option<Entity> {
        let _section = self.inner.storage.read_section();
        let id = self.inner.keys.read().get(key).cloned()?;
        self.inner.storage.query_single_id(id.as_str())
    }

    pub fn contains(&self, key: &K) -> bool {
        let _section = self.inner.storage.read_section();
        self.inner.keys.read().contains_key(key)
    }

    /// Resolve `key`, or run `factory` to create the entity, atomically.
    ///
    /// The check and the factory share one write section, so concurrent
    /// callers never run the factory twice for the same key.
    pub fn get_or_create(
        &self,
        key: &K,
        factory: impl FnOnce(&EcsStorage) -> Result<Entity, EcsError>,
    ) -> Result<Entity, EcsError> {
        self.inner.storage.batch_update(|storage| {
            if let Some(existing) = self.try_get_entity(key) {
                return Ok(existing);
            }
            factory(storage)
        })
    }

    pub fn len(&self) -> usize {
        let _section = self.inner.storage.read_section();
        self.inner.keys.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every key currently indexed, in no particular order.
    pub fn keys(&self) -> Vec<K> {
        let _section = self.inner.storage.read_section();
        self.inner.keys.read().keys().cloned().collect()
    }
}

impl<K> fmt::Debug for LookupBucket<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupBucket")
            .field("storage", &self.inner.storage.name())
            .field("keys", &self.inner.keys.read().len())
            .finish()
    }
}

impl EcsStorage {
    /// Create a bucket indexing every entity accepted by `matches` under
    /// `key_of(entity)`. Existing entities are indexed immediately.
    pub fn create_lookup_bucket<K, M, F>(&self, matches: M, key_of: F) -> LookupBucket<K>
    where
        K: Eq + Hash + Clone + Send + Sync + 'static,
        M: Fn(&Entity) -> bool + Send + Sync + 'static,
        F: Fn(&Entity) -> K + Send + Sync + 'static,
    {
        let _scope = self.begin_write();
        let inner = Arc::new(BucketInner {
            storage: self.clone(),
            matches: Box::new(matches),
            key_of: Box::new(key_of),
            keys: RwLock::new(HashMap::new()),
        });
        for entity in self.query_all() {
            inner.entity_created(&entity);
        }
        let hook: Arc<dyn BucketHook> = inner.clone();
        self.register_bucket(Arc::downgrade(&hook));
        tracing::debug!(
            storage = %self.name(),
            keys = inner.keys.read().len(),
            "lookup bucket registered"
        );
        LookupBucket { inner }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
