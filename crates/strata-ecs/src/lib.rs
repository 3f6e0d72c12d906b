//! Strata ECS -- thread-safe entity-component store with versioned components.
//!
//! Entities are string-identified bags of components. Each stored component
//! carries a version used for optimistic concurrency and for merging
//! [packages](package::EcsPackage) replicated from another storage. Components
//! are indexed by concrete type and by every type family (usually a trait
//! object) the storage's [`TypeFamilyResolver`](family::TypeFamilyResolver)
//! assigns to them, so one query can match every component implementing a
//! trait.
//!
//! Writes are serialized; reads run concurrently and never observe a
//! half-applied write. A thread inside a write section may read and write
//! again freely, which is what [`EcsStorage::batch_update`] relies on.
//! Change records are delivered to [listeners](events::ChangeListener) once
//! the outermost write section ends.
//!
//! # Quick Start
//!
//! ```
//! use strata_ecs::prelude::*;
//!
//! #[derive(Debug, Clone, PartialEq)]
//! struct Position { x: f32, y: f32 }
//!
//! let storage = EcsStorage::new();
//! let entity = storage
//!     .create(ComponentBundle::new().with(Position { x: 0.0, y: 0.0 }), &["player"], Some("p1"))
//!     .unwrap();
//!
//! entity.set_component(Position { x: 1.0, y: 0.0 });
//! assert_eq!(entity.version_of(ComponentType::of::<Position>()).unwrap(), 2);
//!
//! let moved = storage.query::<Position>().filter(|p| p.x > 0.5).entities();
//! assert_eq!(moved.ids(), vec![EntityId::from("p1")]);
//! ```

#![deny(unsafe_code)]

pub mod bucket;
pub mod collection;
pub mod component;
pub mod entity;
pub mod events;
pub mod family;
mod gate;
pub mod package;
pub mod query;
pub mod registry;
pub mod storage;
pub mod wire;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by storage, query and package operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// An entity was created with an id that is already in use.
    #[error("entity '{id}' already exists")]
    DuplicateId { id: String },

    /// A single-result lookup matched more than one entity.
    #[error("expected at most one entity, found {matches}")]
    AmbiguousResult { matches: usize },

    /// A package named a component type with no registered codec.
    #[error("component type '{type_name}' is not registered")]
    TypeResolution { type_name: String },

    /// A component payload could not be converted to or from JSON.
    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerialization { component: String, details: String },

    /// A package document does not have the expected shape.
    #[error("malformed package: {details}")]
    MalformedPackage { details: String },
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::bucket::LookupBucket;
    pub use crate::collection::EntityCollection;
    pub use crate::component::{
        Component, ComponentBundle, ComponentType, ComponentValue, EntityTags, TERMINAL_VERSION,
        UNSET_VERSION,
    };
    pub use crate::entity::{Entity, EntityId};
    pub use crate::events::{ChangeKind, ChangeListener, ChangeSet, ComponentChange, EntityCreated, ListenerId};
    pub use crate::family::{DeclaredFamilies, ExplicitFamilies, TypeFamilyResolver};
    pub use crate::package::{EcsPackage, MergeReport, PackageContents};
    pub use crate::query::{FamilyQuery, MultiTypeQuery, Query, TypeQuery};
    pub use crate::registry::ComponentRegistry;
    pub use crate::storage::{EcsStorage, StorageConfig, TypeVersion};
    pub use crate::EcsError;
}

pub use storage::EcsStorage;

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------
