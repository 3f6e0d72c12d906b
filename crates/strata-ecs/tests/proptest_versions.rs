//! Property tests for component versions and package merges.

use strata_ecs::prelude::*;
use proptest::prelude::*;

#[derive(Debug, Clone, PartialEq)]
struct Counter(u64);

#[derive(Debug, Clone, PartialEq)]
struct Label(String);

fn start_version() -> impl Strategy<Value = u64> {
    prop_oneof![
        Just(0u64),
        1u64..1_000,
        (TERMINAL_VERSION - 8)..=TERMINAL_VERSION,
    ]
}

/// Writes performed against a source storage.
#[derive(Debug, Clone)]
enum WriteOp {
    SetCounter(usize, u64),
    SetLabel(usize, String),
    Delete(usize),
}

fn write_op() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        (0..6usize, any::<u64>()).prop_map(|(i, v)| WriteOp::SetCounter(i, v)),
        (0..6usize, "[a-z]{1,8}").prop_map(|(i, s)| WriteOp::SetLabel(i, s)),
        (0..6usize).prop_map(WriteOp::Delete),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Every unversioned write moves the version forward by one, wrapping
    /// from the terminal version back to one.
    #[test]
    fn versions_advance_and_wrap(start in start_version(), writes in 1usize..20) {
        let storage = EcsStorage::new();
        let entity = storage.create_entity();
        let ty = ComponentType::of::<Counter>();

        entity.set_with_version(Counter(0), start);
        let mut expected = if start == UNSET_VERSION { 1 } else { start };
        prop_assert_eq!(entity.version_of(ty).unwrap(), expected);

        for n in 0..writes {
            entity.set_component(Counter(n as u64));
            expected = if expected == TERMINAL_VERSION { 1 } else { expected + 1 };
            prop_assert_eq!(entity.version_of(ty).unwrap(), expected);
        }
    }

    /// Replaying the captured stream of a source into a fresh target, once
    /// or twice, reproduces the source state. Deleted ids are never reused
    /// since a package deletion outranks every update of the same id.
    #[test]
    fn merged_stream_reproduces_source(ops in prop::collection::vec(write_op(), 1..40)) {
        let source = EcsStorage::new();
        let package = std::sync::Arc::new(EcsPackage::new());
        source.subscribe(package.clone());

        let mut deleted = std::collections::HashSet::new();
        for op in ops {
            let index = match &op {
                WriteOp::SetCounter(i, _) | WriteOp::SetLabel(i, _) | WriteOp::Delete(i) => *i,
            };
            if deleted.contains(&index) {
                continue;
            }
            match op {
                WriteOp::SetCounter(i, v) => {
                    let (e, _) = source.create_or_get_with_id(&format!("e{i}"), &["prop"]);
                    e.set_component(Counter(v));
                }
                WriteOp::SetLabel(i, s) => {
                    let (e, _) = source.create_or_get_with_id(&format!("e{i}"), &["prop"]);
                    e.set_component(Label(s));
                }
                WriteOp::Delete(i) => {
                    source.delete_entity_by_id(&format!("e{i}"));
                    deleted.insert(i);
                }
            }
        }

        let target = EcsStorage::new();
        target.merge_package(&package);
        let once: Vec<_> = target.query_all().ids();
        target.merge_package(&package);
        prop_assert_eq!(target.query_all().ids(), once);

        for entity in source.query_all() {
            let copy = target.query_single_id(entity.id().as_str());
            prop_assert!(copy.is_some());
            let copy = copy.unwrap();
            prop_assert_eq!(copy.get_component::<Counter>(), entity.get_component::<Counter>());
            prop_assert_eq!(copy.get_component::<Label>(), entity.get_component::<Label>());
            prop_assert!(copy.has_tag(&["prop"]));
        }
        prop_assert_eq!(target.entity_count(), source.entity_count());
    }
}
