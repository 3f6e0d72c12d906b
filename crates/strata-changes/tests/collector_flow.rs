//! Collector behaviour against live storages: families, batches, merges and
//! random write sequences.

use std::sync::Arc;

use proptest::prelude::*;
use strata_changes::ComponentChangesCollector;
use strata_ecs::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Fuel(u32);

trait Vehicle: Send + Sync {
    fn seats(&self) -> u32;
}

#[derive(Debug, Clone, PartialEq)]
struct Bus(u32);

impl Vehicle for Bus {
    fn seats(&self) -> u32 {
        self.0
    }
}

#[test]
fn family_watch_matches_members() {
    let families = DeclaredFamilies::new();
    families.declare::<Bus, dyn Vehicle>(|b| b as Arc<dyn Vehicle>);
    let storage = EcsStorage::with_config(StorageConfig {
        name: "depot".to_owned(),
        family_resolver: Arc::new(families),
    });
    let collector = ComponentChangesCollector::attach(&storage, &[ComponentType::of::<dyn Vehicle>()]);

    let bus = storage.create_with(ComponentBundle::new().with(Bus(40)));
    bus.set_component(Fuel(10));

    let report = collector.pop();
    assert_eq!(report.updated.len(), 1);
    let only = &report.updated[0].components;
    assert_eq!(only.len(), 1);
    assert_eq!(only[0].component_type, ComponentType::of::<Bus>());
    let seats = storage
        .family_view::<dyn Vehicle>(&only[0].component)
        .map(|v| v.seats());
    assert_eq!(seats, Some(40));
}

#[test]
fn batch_and_merge_are_collected_once_settled() {
    let storage = EcsStorage::new();
    let collector = ComponentChangesCollector::attach(&storage, &[ComponentType::of::<Fuel>()]);

    storage.batch_update(|s| {
        let e = s.create(ComponentBundle::new(), &[], Some("truck")).unwrap();
        e.set_component(Fuel(1));
        e.set_component(Fuel(2));
        assert!(!collector.has_updates());
    });
    assert!(collector.has_updates());

    let package = EcsPackage::new();
    package.add_raw(EntityId::from("truck"), &[], &[Component::new(9, Fuel(99))]);
    storage.merge_package(&package);

    let report = collector.pop();
    assert_eq!(report.updated.len(), 1);
    let latest = &report.updated[0].components[0].component;
    assert_eq!(latest.value::<Fuel>(), Some(Fuel(99)));
    assert_eq!(latest.version(), 9);
}

#[test]
fn deleted_entities_are_reported_gone() {
    let storage = EcsStorage::new();
    let collector = ComponentChangesCollector::attach(&storage, &[ComponentType::of::<Fuel>()]);
    let e = storage.create_entity();
    e.set_component(Fuel(5));
    e.delete();
    let report = collector.pop();
    assert!(report.updated.is_empty());
    assert_eq!(report.deleted.len(), 1);
    assert!(!report.deleted[0].entity.exists());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// After any sequence of writes and deletes, the popped report matches
    /// the storage: every live entity with Fuel shows its current value and
    /// every reported deletion is gone.
    #[test]
    fn report_matches_final_state(ops in prop::collection::vec((0..5usize, prop::option::of(0..100u32)), 1..40)) {
        let storage = EcsStorage::new();
        let collector = ComponentChangesCollector::attach(&storage, &[ComponentType::of::<Fuel>()]);

        for (index, value) in ops {
            let id = format!("v{index}");
            match value {
                Some(v) => {
                    let (e, _) = storage.create_or_get_with_id(&id, &[]);
                    e.set_component(Fuel(v));
                }
                None => {
                    storage.delete_entity_by_id(&id);
                }
            }
        }

        let report = collector.pop();
        for updated in &report.updated {
            let current = storage.get_component::<Fuel>(&updated.entity);
            prop_assert_eq!(updated.components[0].component.value::<Fuel>(), current);
        }
        for deleted in &report.deleted {
            prop_assert!(!storage.exists(deleted.entity.id().as_str()));
        }
        prop_assert_eq!(report.updated.len(), storage.query::<Fuel>().count());
    }
}
