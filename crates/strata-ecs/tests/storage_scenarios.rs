//! End-to-end scenarios: replication between storages, type families,
//! buckets under contention, and listener delivery.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};

use parking_lot::Mutex;
use strata_ecs::prelude::*;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
struct Hp(u32);

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
struct Email(String);

/// Counts records per kind, optionally only for one component type.
#[derive(Default)]
struct Recorder {
    only: Option<ComponentType>,
    entities: Mutex<Vec<EntityId>>,
    created: Mutex<usize>,
    updated: Mutex<usize>,
    deleted: Mutex<usize>,
}

impl Recorder {
    fn for_type(ty: ComponentType) -> Self {
        Self {
            only: Some(ty),
            ..Self::default()
        }
    }

    fn count(&self, changes: &[ComponentChange]) -> usize {
        changes
            .iter()
            .filter(|c| self.only.map_or(true, |ty| c.component_type == ty))
            .count()
    }
}

impl ChangeListener for Recorder {
    fn on_entities_created(&self, created: &[EntityCreated]) {
        self.entities
            .lock()
            .extend(created.iter().map(|c| c.entity.id().clone()));
    }
    fn on_components_created(&self, changes: &[ComponentChange]) {
        *self.created.lock() += self.count(changes);
    }
    fn on_components_updated(&self, changes: &[ComponentChange]) {
        *self.updated.lock() += self.count(changes);
    }
    fn on_components_deleted(&self, changes: &[ComponentChange]) {
        *self.deleted.lock() += self.count(changes);
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

#[test]
fn stale_merge_is_rejected_without_records() {
    init_tracing();
    let target = EcsStorage::new();
    let local = target.create(ComponentBundle::new(), &[], Some("e")).unwrap();
    local.set_with_version(Hp(50), 5);

    let recorder = Arc::new(Recorder::for_type(ComponentType::of::<Hp>()));
    target.subscribe(recorder.clone());

    let package = EcsPackage::new();
    package.add_raw(EntityId::from("e"), &[], &[Component::new(3, Hp(1))]);
    let report = target.merge_package(&package);

    assert_eq!(report.components_rejected, 1);
    assert_eq!(*recorder.updated.lock(), 0);
    assert_eq!(target.get_component::<Hp>(&local), Some(Hp(50)));
    assert_eq!(local.version_of(ComponentType::of::<Hp>()).unwrap(), 5);
}

#[test]
fn terminal_version_accepts_any_incoming_version() {
    let target = EcsStorage::new();
    let local = target.create(ComponentBundle::new(), &[], Some("e")).unwrap();
    local.set_with_version(Hp(1), TERMINAL_VERSION);

    let package = EcsPackage::new();
    package.add_raw(EntityId::from("e"), &[], &[Component::new(2, Hp(2))]);
    let report = target.merge_package(&package);

    assert_eq!(report.components_written, 1);
    assert_eq!(local.refresh_component::<Hp>(), Some(Hp(2)));
    assert_eq!(local.version_of(ComponentType::of::<Hp>()).unwrap(), 2);
}

// ---------------------------------------------------------------------------
// Packages
// ---------------------------------------------------------------------------

#[test]
fn merging_twice_converges_and_repeats_updates() {
    init_tracing();
    let source = EcsStorage::new();
    let a = source
        .create(ComponentBundle::new().with(Hp(1)), &["unit"], Some("a"))
        .unwrap();
    a.set_component(Hp(2));
    let package = EcsPackage::new();
    package.add_all_components(&[a]);

    let target = EcsStorage::new();
    let recorder = Arc::new(Recorder::for_type(ComponentType::of::<Hp>()));
    target.subscribe(recorder.clone());

    let first = target.merge_package(&package);
    let after_first = target.query_single_id("a").unwrap().get_all_components();
    let second = target.merge_package(&package);
    let after_second = target.query_single_id("a").unwrap().get_all_components();

    assert_eq!(first.entities_created, 1);
    assert_eq!(second.entities_created, 0);
    assert_eq!(second.components_written, 1);
    assert_eq!(after_first.len(), after_second.len());
    assert_eq!(
        target.query_single_id("a").unwrap().get_component::<Hp>(),
        Some(Hp(2))
    );
    assert_eq!(*recorder.updated.lock(), 2);
    assert_eq!(recorder.entities.lock().len(), 1);
}

#[test]
fn delete_by_tag_cascades_on_merge() {
    let target = EcsStorage::new();
    for (id, tag) in [("t1", "temp"), ("t2", "temp"), ("k", "keep")] {
        target
            .create(ComponentBundle::new().with(Hp(1)), &[tag], Some(id))
            .unwrap();
    }
    let recorder = Arc::new(Recorder::for_type(ComponentType::of::<Hp>()));
    target.subscribe(recorder.clone());

    let package = EcsPackage::new();
    package.add_delete_by_tag(&["temp"]);
    let report = target.merge_package(&package);

    assert_eq!(report.entities_deleted, 2);
    assert_eq!(*recorder.deleted.lock(), 2);
    assert!(target.exists("k"));
    assert!(target.query_by_tags(&["temp"]).is_empty());
}

#[test]
fn json_replication_round_trip() {
    let mut registry = ComponentRegistry::new();
    registry.register_as::<Hp>("Hp");
    registry.register_as::<Email>("Email");

    let source = EcsStorage::new();
    let e = source
        .create(
            ComponentBundle::new().with(Hp(9)).with(Email("x@y".into())),
            &["user", "active"],
            Some("u1"),
        )
        .unwrap();
    let package = EcsPackage::new();
    package.add_all_components(&[e]);

    let json = registry.package_to_json(&package).unwrap();
    assert_eq!(json["updated"]["u1"]["Hp"]["data"], serde_json::json!(9));
    assert_eq!(json["entitytags"]["u1"], serde_json::json!(["active", "user"]));

    let target = EcsStorage::new();
    target.merge_package(&registry.package_from_json(&json).unwrap());
    let copy = target.query_single_id("u1").unwrap();
    assert_eq!(copy.get_component::<Email>(), Some(Email("x@y".into())));
    assert!(copy.has_tag(&["user", "active"]));
}

// ---------------------------------------------------------------------------
// Families
// ---------------------------------------------------------------------------

trait Car: Send + Sync {
    fn plate(&self) -> &str;
    fn wheels(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq)]
struct Sedan {
    plate: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
struct Suv {
    plate: &'static str,
    lifted: bool,
}

impl Car for Sedan {
    fn plate(&self) -> &str {
        self.plate
    }
    fn wheels(&self) -> u32 {
        4
    }
}

impl Car for Suv {
    fn plate(&self) -> &str {
        self.plate
    }
    fn wheels(&self) -> u32 {
        if self.lifted {
            6
        } else {
            4
        }
    }
}

fn garage() -> EcsStorage {
    let families = DeclaredFamilies::new();
    families
        .declare::<Sedan, dyn Car>(|s| s as Arc<dyn Car>)
        .declare::<Suv, dyn Car>(|s| s as Arc<dyn Car>);
    EcsStorage::with_config(StorageConfig {
        name: "garage".to_owned(),
        family_resolver: Arc::new(families),
    })
}

#[test]
fn family_queries_span_concrete_types() {
    let storage = garage();
    storage
        .create(ComponentBundle::new().with(Sedan { plate: "S-1" }), &[], Some("sedan"))
        .unwrap();
    storage
        .create(
            ComponentBundle::new().with(Suv { plate: "X-1", lifted: true }),
            &[],
            Some("suv"),
        )
        .unwrap();
    storage
        .create(ComponentBundle::new().with(Hp(1)), &[], Some("walker"))
        .unwrap();

    assert_eq!(storage.query_family::<dyn Car>().count(), 2);
    assert_eq!(storage.query::<Sedan>().count(), 1);

    let big = storage
        .query_family::<dyn Car>()
        .filter(|car| car.wheels() > 4)
        .entities();
    assert_eq!(big.ids(), vec![EntityId::from("suv")]);

    let suv = storage.query_single_id("suv").unwrap();
    let cars = suv.get_family::<dyn Car>();
    assert_eq!(cars.len(), 1);
    assert_eq!(cars[0].wheels(), 6);
    assert_eq!(cars[0].plate(), "X-1");

    let types = suv.component_types();
    assert_eq!(types.len(), 2);
    assert!(types.contains(&ComponentType::of::<Suv>()));
    assert!(types.contains(&ComponentType::of::<dyn Car>()));
}

#[test]
fn deleting_a_family_member_reports_concrete_records() {
    let storage = garage();
    let e = storage
        .create(ComponentBundle::new().with(Sedan { plate: "S-2" }), &[], Some("s"))
        .unwrap();
    let recorder = Arc::new(Recorder::default());
    storage.subscribe(recorder.clone());

    assert!(e.delete());
    assert_eq!(*recorder.deleted.lock(), 1);
    assert_eq!(storage.query_family::<dyn Car>().count(), 0);
}

// ---------------------------------------------------------------------------
// Creation idempotence
// ---------------------------------------------------------------------------

#[test]
fn create_or_get_with_id_reports_creation_once() {
    let storage = EcsStorage::new();
    let recorder = Arc::new(Recorder::default());
    storage.subscribe(recorder.clone());

    let (first, created) = storage.create_or_get_with_id("same", &[]);
    let (second, created_again) = storage.create_or_get_with_id("same", &[]);

    assert!(created);
    assert!(!created_again);
    assert_eq!(first, second);
    assert_eq!(*recorder.entities.lock(), vec![EntityId::from("same")]);
}

// ---------------------------------------------------------------------------
// Buckets
// ---------------------------------------------------------------------------

#[test]
fn concurrent_bucket_create_and_delete_leaves_nothing() {
    init_tracing();
    let storage = EcsStorage::new();
    let bucket = storage.create_lookup_bucket(
        |e: &Entity| e.get_component::<Email>().is_some(),
        |e: &Entity| e.get_component::<Email>().map(|m| m.0).unwrap_or_default(),
    );

    std::thread::scope(|scope| {
        for worker in 0..8 {
            let bucket = bucket.clone();
            scope.spawn(move || {
                for round in 0..50 {
                    let key = format!("user-{}", (worker + round) % 4);
                    let entity = bucket
                        .get_or_create(&key, |s| {
                            s.create(ComponentBundle::new().with(Email(key.clone())), &[], None)
                        })
                        .unwrap();
                    assert!(!entity.id().as_str().is_empty());
                    entity.delete();
                }
            });
        }
    });

    assert_eq!(storage.entity_count(), 0);
    assert!(bucket.is_empty());
}

#[test]
fn concurrent_get_or_create_runs_factory_once() {
    const WORKERS: usize = 8;
    let storage = EcsStorage::new();
    let bucket = storage.create_lookup_bucket(
        |e: &Entity| e.get_component::<Email>().is_some(),
        |e: &Entity| e.get_component::<Email>().map(|m| m.0).unwrap_or_default(),
    );
    let calls = AtomicUsize::new(0);
    let start = Barrier::new(WORKERS);
    let key = "shared@x".to_owned();

    let ids: Vec<EntityId> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let bucket = bucket.clone();
                let (calls, start, key) = (&calls, &start, &key);
                scope.spawn(move || {
                    start.wait();
                    bucket
                        .get_or_create(key, |s| {
                            calls.fetch_add(1, Ordering::SeqCst);
                            s.create(ComponentBundle::new().with(Email(key.clone())), &[], None)
                        })
                        .unwrap()
                        .id()
                        .clone()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(ids.iter().all(|id| *id == ids[0]));
    assert_eq!(storage.entity_count(), 1);
}

#[test]
fn bucket_follows_merges() {
    let storage = EcsStorage::new();
    let bucket = storage.create_lookup_bucket(
        |e: &Entity| e.get_component::<Email>().is_some(),
        |e: &Entity| e.get_component::<Email>().map(|m| m.0).unwrap_or_default(),
    );

    let package = EcsPackage::new();
    package.add_raw(EntityId::from("m"), &[], &[Component::new(1, Email("m@x".into()))]);
    storage.merge_package(&package);
    assert_eq!(
        bucket.try_get_entity(&"m@x".to_owned()).map(|e| e.id().clone()),
        Some(EntityId::from("m"))
    );

    let removal = EcsPackage::new();
    removal.add_deleted_ids(&[EntityId::from("m")]);
    storage.merge_package(&removal);
    assert!(bucket.is_empty());
}
