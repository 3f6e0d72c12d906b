//! Strata Changes - polling-friendly change collection for Strata ECS.
//!
//! The core storage pushes change records to listeners synchronously, once
//! per write section. Consumers that poll at their own pace (replicators,
//! UI refreshers) attach a collector instead and drain it when ready.
//!
//! # Modules
//!
//! - [`collector`]: per-type collector keeping the latest update of each
//!   watched component per entity, plus deletions.

#![deny(unsafe_code)]

pub mod collector;

pub use collector::{CollectorReport, ComponentChangesCollector, EntityDeleted, EntityUpdated};
