//! JSON wire format for [`EcsPackage`].
//!
//! ```json
//! {
//!   "updated":    { "<entity id>": { "<type name>": { "version": 3, "data": { } } } },
//!   "deleted":    ["<entity id>"],
//!   "deletedtags": ["<tag>"],
//!   "entitytags": { "<entity id>": ["<tag>"] }
//! }
//! ```
//!
//! Field names are matched case-insensitively on decode. A missing version
//! reads as 0, which merges as "next version". Entries with null or missing
//! data are skipped once their type name resolves. Entity tags are only kept
//! for entities that appear in `updated`.

use std::collections::HashMap;

use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::package::EcsPackage;
use crate::registry::ComponentRegistry;
use crate::EcsError;

const UPDATED: &str = "updated";
const DELETED: &str = "deleted";
const DELETED_TAGS: &str = "deletedtags";
const ENTITY_TAGS: &str = "entitytags";
const VERSION: &str = "version";
const DATA: &str = "data";

fn field<'v>(object: &'v Map<String, Value>, name: &str) -> Option<&'v Value> {
    object
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
        .filter(|value| !value.is_null())
}

fn malformed(details: impl Into<String>) -> EcsError {
    EcsError::MalformedPackage {
        details: details.into(),
    }
}

fn as_object<'v>(value: &'v Value, what: &str) -> Result<&'v Map<String, Value>, EcsError> {
    value
        .as_object()
        .ok_or_else(|| malformed(format!("{what} must be a JSON object")))
}

fn string_list(value: &Value, what: &str) -> Result<Vec<String>, EcsError> {
    let items = value
        .as_array()
        .ok_or_else(|| malformed(format!("{what} must be an array of strings")))?;
    items
        .iter()
        .map(|item| {
            item.as_str()
                .map(str::to_owned)
                .ok_or_else(|| malformed(format!("{what} must be an array of strings")))
        })
        .collect()
}

fn strings_to_json<'a>(items: impl IntoIterator<Item = &'a str>) -> Value {
    Value::Array(items.into_iter().map(|s| Value::String(s.to_owned())).collect())
}

impl ComponentRegistry {
    /// Encode `package` as a JSON value.
    ///
    /// Fails with [`EcsError::TypeResolution`] when a captured component type
    /// has no registered codec.
    pub fn package_to_json(&self, package: &EcsPackage) -> Result<Value, EcsError> {
        let contents = package.contents();

        let mut updated = Map::new();
        for (id, components) in &contents.updated {
            let mut entries = Map::new();
            for (type_name, component) in components {
                if component.is_empty() {
                    continue;
                }
                let (wire_name, data) = self.encode(type_name, component)?;
                let mut entry = Map::new();
                entry.insert(VERSION.to_owned(), Value::from(component.version()));
                entry.insert(DATA.to_owned(), data);
                entries.insert(wire_name, Value::Object(entry));
            }
            updated.insert(id.to_string(), Value::Object(entries));
        }

        let mut entity_tags = Map::new();
        for (id, tags) in &contents.entity_tags {
            if contents.updated.contains_key(id) {
                entity_tags.insert(id.to_string(), strings_to_json(tags.iter().map(String::as_str)));
            }
        }

        let mut root = Map::new();
        root.insert(UPDATED.to_owned(), Value::Object(updated));
        root.insert(
            DELETED.to_owned(),
            strings_to_json(contents.deleted.iter().map(EntityId::as_str)),
        );
        root.insert(
            DELETED_TAGS.to_owned(),
            strings_to_json(contents.deleted_tags.iter().map(String::as_str)),
        );
        root.insert(ENTITY_TAGS.to_owned(), Value::Object(entity_tags));
        Ok(Value::Object(root))
    }

    /// Encode `package` as a JSON string.
    pub fn package_to_string(&self, package: &EcsPackage) -> Result<String, EcsError> {
        let value = self.package_to_json(package)?;
        serde_json::to_string(&value).map_err(|e| malformed(e.to_string()))
    }

    /// Decode a package from a JSON value.
    pub fn package_from_json(&self, value: &Value) -> Result<EcsPackage, EcsError> {
        let root = as_object(value, "package")?;
        let package = EcsPackage::new();

        let mut tags_by_entity: HashMap<&str, Vec<String>> = HashMap::new();
        if let Some(value) = field(root, ENTITY_TAGS) {
            for (id, tags) in as_object(value, ENTITY_TAGS)? {
                tags_by_entity.insert(id.as_str(), string_list(tags, ENTITY_TAGS)?);
            }
        }

        if let Some(updated) = field(root, UPDATED) {
            for (id, entries) in as_object(updated, UPDATED)? {
                let mut components = Vec::new();
                for (type_name, entry) in as_object(entries, "component map")? {
                    let entry = as_object(entry, "component entry")?;
                    let version = match field(entry, VERSION) {
                        Some(v) => v
                            .as_u64()
                            .ok_or_else(|| malformed(format!("version of {type_name} must be an unsigned integer")))?,
                        None => 0,
                    };
                    // Unknown names fail even when there is no data to decode.
                    self.codec(type_name)?;
                    let Some(data) = field(entry, DATA) else {
                        tracing::trace!(entity = %id, component = %type_name, "skipping entry without data");
                        continue;
                    };
                    components.push(self.decode(type_name, version, data)?);
                }
                let tags = tags_by_entity
                    .get(id.as_str())
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                package.add_raw(EntityId::from(id.as_str()), tags, &components);
            }
        }

        if let Some(deleted) = field(root, DELETED) {
            let ids: Vec<EntityId> = string_list(deleted, DELETED)?
                .into_iter()
                .map(EntityId::from)
                .collect();
            package.add_deleted_ids(&ids);
        }

        if let Some(deleted_tags) = field(root, DELETED_TAGS) {
            let tags = string_list(deleted_tags, DELETED_TAGS)?;
            let tags: Vec<&str> = tags.iter().map(String::as_str).collect();
            package.add_delete_by_tag(&tags);
        }

        Ok(package)
    }

    /// Decode a package from a JSON string.
    pub fn package_from_str(&self, text: &str) -> Result<EcsPackage, EcsError> {
        let value: Value = serde_json::from_str(text).map_err(|e| malformed(e.to_string()))?;
        self.package_from_json(&value)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentBundle, ComponentType};
    use crate::storage::EcsStorage;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Health {
        current: u32,
        max: u32,
    }

    fn registry() -> ComponentRegistry {
        let mut reg = ComponentRegistry::new();
        reg.register_as::<Health>("Health");
        reg
    }

    #[test]
    fn round_trip_through_storage() {
        let source = EcsStorage::new();
        let e = source
            .create(
                ComponentBundle::new().with(Health { current: 5, max: 10 }),
                &["unit"],
                Some("e1"),
            )
            .unwrap();
        let package = EcsPackage::new();
        package.add_all_components(&[e]);
        package.add_deleted_ids(&[EntityId::from("old")]);
        package.add_delete_by_tag(&["stale"]);

        let reg = registry();
        let text = reg.package_to_string(&package).unwrap();
        let decoded = reg.package_from_str(&text).unwrap();
        let contents = decoded.contents();
        assert!(contents.deleted.contains(&EntityId::from("old")));
        assert!(contents.deleted_tags.contains("stale"));

        let target = EcsStorage::new();
        target.merge_package(&decoded);
        let merged = target.query_single_id("e1").unwrap();
        assert_eq!(merged.get_component::<Health>(), Some(Health { current: 5, max: 10 }));
        assert_eq!(merged.version_of(ComponentType::of::<Health>()).unwrap(), 1);
        assert!(merged.has_tag(&["unit"]));
    }

    #[test]
    fn field_names_are_case_insensitive() {
        let doc = json!({
            "Updated": { "a": { "Health": { "Version": 7, "DATA": { "current": 1, "max": 2 } } } },
            "DeletedTags": ["gone"],
            "EntityTags": { "a": ["x"], "unrelated": ["y"] }
        });
        let package = registry().package_from_json(&doc).unwrap();
        let contents = package.contents();
        let component = &contents.updated[&EntityId::from("a")][ComponentType::of::<Health>().name()];
        assert_eq!(component.version(), 7);
        assert_eq!(contents.entity_tags.len(), 1);
        assert!(contents.deleted_tags.contains("gone"));
    }

    #[test]
    fn missing_version_and_null_data() {
        let doc = json!({
            "updated": {
                "a": { "Health": { "data": { "current": 1, "max": 1 } } },
                "b": { "Health": { "version": 2, "data": null } }
            }
        });
        let contents = registry().package_from_json(&doc).unwrap().contents();
        let a = &contents.updated[&EntityId::from("a")];
        assert_eq!(a.values().next().map(Component::version), Some(0));
        assert!(contents.updated[&EntityId::from("b")].is_empty());
    }

    #[test]
    fn entity_without_components_keeps_its_tags() {
        let doc = json!({
            "updated": { "bare": {} },
            "entitytags": { "bare": ["lobby"] }
        });
        let package = registry().package_from_json(&doc).unwrap();
        let contents = package.contents();
        assert!(contents.updated[&EntityId::from("bare")].is_empty());

        let target = EcsStorage::new();
        let report = target.merge_package(&package);
        assert_eq!(report.entities_created, 1);
        assert!(target.query_single_id("bare").unwrap().has_tag(&["lobby"]));

        let again = registry().package_to_json(&package).unwrap();
        assert_eq!(again["entitytags"]["bare"], json!(["lobby"]));
    }

    #[test]
    fn max_version_survives() {
        let package = EcsPackage::new();
        package.add_raw(
            EntityId::from("m"),
            &[],
            &[Component::new(u64::MAX, Health { current: 0, max: 0 })],
        );
        let reg = registry();
        let value = reg.package_to_json(&package).unwrap();
        assert_eq!(value["updated"]["m"]["Health"]["version"], json!(u64::MAX));
        let back = reg.package_from_json(&value).unwrap().contents();
        assert_eq!(
            back.updated[&EntityId::from("m")].values().next().map(Component::version),
            Some(u64::MAX)
        );
    }

    #[test]
    fn unknown_type_is_reported() {
        let doc = json!({ "updated": { "a": { "Mystery": { "version": 1, "data": {} } } } });
        let err = registry().package_from_json(&doc).unwrap_err();
        assert!(matches!(err, EcsError::TypeResolution { ref type_name } if type_name == "Mystery"));

        let doc = json!({ "updated": { "a": { "Mystery": { "version": 1, "data": null } } } });
        let err = registry().package_from_json(&doc).unwrap_err();
        assert!(matches!(err, EcsError::TypeResolution { ref type_name } if type_name == "Mystery"));

        #[derive(Debug)]
        struct Unregistered;
        let package = EcsPackage::new();
        package.add_raw(EntityId::from("a"), &[], &[Component::new(1, Unregistered)]);
        let err = registry().package_to_json(&package).unwrap_err();
        assert!(matches!(err, EcsError::TypeResolution { .. }));
    }

    #[test]
    fn malformed_documents() {
        let reg = registry();
        assert!(matches!(
            reg.package_from_json(&json!([1, 2])),
            Err(EcsError::MalformedPackage { .. })
        ));
        assert!(matches!(
            reg.package_from_json(&json!({ "deleted": "a" })),
            Err(EcsError::MalformedPackage { .. })
        ));
        assert!(matches!(
            reg.package_from_json(&json!({ "updated": { "a": { "Health": { "version": -1, "data": {} } } } })),
            Err(EcsError::MalformedPackage { .. })
        ));
        assert!(matches!(reg.package_from_str("{not json"), Err(EcsError::MalformedPackage { .. })));
    }
}
