//! Component codec registry for the package wire format.
//!
//! Packages name component types by string. Every component type that
//! travels in a package must be registered here so its payload can be turned
//! into JSON and back. Registration uses the full Rust type name by default;
//! [`ComponentRegistry::register_as`] sets a different wire name (for peers
//! that spell type names their own way) while still accepting the Rust name.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::component::{Component, ComponentType, ComponentValue};
use crate::EcsError;

type SerializeFn = Box<dyn Fn(&dyn ComponentValue) -> Result<serde_json::Value, String> + Send + Sync>;

type DeserializeFn =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn ComponentValue>, String> + Send + Sync>;

pub(crate) struct Codec {
    component_type: ComponentType,
    wire_name: String,
    serialize: SerializeFn,
    deserialize: DeserializeFn,
}

/// Maps component types to wire names and serde codecs.
#[derive(Default)]
pub struct ComponentRegistry {
    codecs: Vec<Codec>,
    by_type: HashMap<ComponentType, usize>,
    /// Wire names and Rust type names -> codec index.
    by_name: HashMap<String, usize>,
}

impl ComponentRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its full Rust type name.
    pub fn register<T>(&mut self) -> ComponentType
    where
        T: ComponentValue + Serialize + DeserializeOwned,
    {
        self.register_as::<T>(std::any::type_name::<T>())
    }

    /// Register `T` with `wire_name` as the name written to packages.
    ///
    /// Registering a type twice keeps the first codec and adds `wire_name`
    /// as an accepted alias.
    ///
    /// # Panics
    ///
    /// Panics if `wire_name` already belongs to a different type.
    pub fn register_as<T>(&mut self, wire_name: &str) -> ComponentType
    where
        T: ComponentValue + Serialize + DeserializeOwned,
    {
        let component_type = ComponentType::of::<T>();
        if let Some(&owner) = self.by_name.get(wire_name) {
            if self.codecs[owner].component_type != component_type {
                panic!(
                    "component name '{}' is already registered for a different type",
                    wire_name
                );
            }
        }

        let index = match self.by_type.get(&component_type) {
            Some(&index) => index,
            None => {
                let index = self.codecs.len();
                self.codecs.push(Codec {
                    component_type,
                    wire_name: wire_name.to_owned(),
                    serialize: Box::new(|value: &dyn ComponentValue| {
                        let typed = value
                            .as_any()
                            .downcast_ref::<T>()
                            .ok_or_else(|| "payload does not match the registered type".to_owned())?;
                        serde_json::to_value(typed).map_err(|e| e.to_string())
                    }),
                    deserialize: Box::new(|value: &serde_json::Value| {
                        let typed: T = serde_json::from_value(value.clone()).map_err(|e| e.to_string())?;
                        Ok(Arc::new(typed) as Arc<dyn ComponentValue>)
                    }),
                });
                self.by_type.insert(component_type, index);
                self.by_name.insert(component_type.name().to_owned(), index);
                index
            }
        };
        self.by_name.insert(wire_name.to_owned(), index);
        component_type
    }

    /// Look up a component type by wire name or Rust type name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentType> {
        self.by_name
            .get(name)
            .map(|&index| self.codecs[index].component_type)
    }

    /// The name written to packages for `component_type`.
    pub fn wire_name(&self, component_type: ComponentType) -> Option<&str> {
        self.by_type
            .get(&component_type)
            .map(|&index| self.codecs[index].wire_name.as_str())
    }

    /// Total number of registered component types.
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }

    /// Every accepted name, sorted.
    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.by_name.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub(crate) fn codec(&self, name: &str) -> Result<&Codec, EcsError> {
        self.by_name
            .get(name)
            .map(|&index| &self.codecs[index])
            .ok_or_else(|| EcsError::TypeResolution {
                type_name: name.to_owned(),
            })
    }

    /// Encode the payload of `component`, known under `type_name`.
    /// Returns the wire name with the JSON payload.
    pub fn encode(&self, type_name: &str, component: &Component) -> Result<(String, serde_json::Value), EcsError> {
        let codec = self.codec(type_name)?;
        let data = component
            .data()
            .ok_or_else(|| EcsError::ComponentSerialization {
                component: type_name.to_owned(),
                details: "component has no data".to_owned(),
            })?;
        let value = (codec.serialize)(data).map_err(|details| EcsError::ComponentSerialization {
            component: type_name.to_owned(),
            details,
        })?;
        Ok((codec.wire_name.clone(), value))
    }

    /// Decode a payload for the type known under `type_name`.
    pub fn decode(&self, type_name: &str, version: u64, data: &serde_json::Value) -> Result<Component, EcsError> {
        let codec = self.codec(type_name)?;
        let payload = (codec.deserialize)(data).map_err(|details| EcsError::ComponentSerialization {
            component: type_name.to_owned(),
            details,
        })?;
        Ok(Component::from_shared(version, payload))
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field(
                "types",
                &self.codecs.iter().map(|c| c.wire_name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
