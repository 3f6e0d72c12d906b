//! Type families: the set of types a concrete component is indexed under.
//!
//! Rust has no runtime interface reflection, so families are declared up
//! front. [`DeclaredFamilies`] (the default) records `Concrete -> dyn Family`
//! pairs together with an upcast function, which lets callers read every
//! member of a family back as `Arc<dyn Family>`. [`ExplicitFamilies`] is a
//! plain type-to-types mapping without views.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::component::{Component, ComponentType, ComponentValue};

type FamilyCast =
    Arc<dyn Fn(Arc<dyn Any + Send + Sync>) -> Option<Box<dyn Any + Send + Sync>> + Send + Sync>;

// ---------------------------------------------------------------------------
// TypeFamilyResolver
// ---------------------------------------------------------------------------

/// Policy mapping a concrete component type to its family types.
pub trait TypeFamilyResolver: Send + Sync {
    /// Families of `concrete`. The first element is always `concrete`.
    fn families(&self, concrete: ComponentType) -> Vec<ComponentType>;

    /// View `component` as a member of `family`.
    ///
    /// On success the box holds an `Arc<F>` where `F` is the family type.
    fn upcast(
        &self,
        _family: ComponentType,
        _component: &Component,
    ) -> Option<Box<dyn Any + Send + Sync>> {
        None
    }
}

fn self_first(concrete: ComponentType, others: impl IntoIterator<Item = ComponentType>) -> Vec<ComponentType> {
    let mut families = vec![concrete];
    for family in others {
        if !families.contains(&family) {
            families.push(family);
        }
    }
    families
}

// ---------------------------------------------------------------------------
// DeclaredFamilies
// ---------------------------------------------------------------------------

/// Default resolver: families declared per concrete type with an upcast.
///
/// ```
/// use std::sync::Arc;
/// use strata_ecs::prelude::*;
///
/// trait Car: Send + Sync { fn plate(&self) -> &str; }
///
/// #[derive(Debug)]
/// struct Sedan(String);
/// impl Car for Sedan { fn plate(&self) -> &str { &self.0 } }
///
/// let families = DeclaredFamilies::new();
/// families.declare::<Sedan, dyn Car>(|s| s as Arc<dyn Car>);
///
/// let types = families.families(ComponentType::of::<Sedan>());
/// assert_eq!(types, vec![ComponentType::of::<Sedan>(), ComponentType::of::<dyn Car>()]);
/// ```
#[derive(Default)]
pub struct DeclaredFamilies {
    declared: RwLock<HashMap<ComponentType, Vec<(ComponentType, FamilyCast)>>>,
}

impl DeclaredFamilies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `T` belongs to family `F`, with `cast` producing the view.
    pub fn declare<T, F>(&self, cast: impl Fn(Arc<T>) -> Arc<F> + Send + Sync + 'static) -> &Self
    where
        T: ComponentValue,
        F: ?Sized + Send + Sync + 'static,
    {
        let concrete = ComponentType::of::<T>();
        let family = ComponentType::of::<F>();
        let to_family: FamilyCast = Arc::new(move |any: Arc<dyn Any + Send + Sync>| {
            let value = any.downcast::<T>().ok()?;
            let view: Arc<F> = cast(value);
            Some(Box::new(view) as Box<dyn Any + Send + Sync>)
        });
        let to_self: FamilyCast = Arc::new(|any: Arc<dyn Any + Send + Sync>| {
            let value = any.downcast::<T>().ok()?;
            Some(Box::new(value) as Box<dyn Any + Send + Sync>)
        });

        let mut declared = self.declared.write();
        let entries = declared.entry(concrete).or_default();
        if !entries.iter().any(|(ty, _)| *ty == concrete) {
            entries.push((concrete, to_self));
        }
        entries.retain(|(ty, _)| *ty != family || family == concrete);
        if family != concrete {
            entries.push((family, to_family));
        }
        tracing::trace!(concrete = %concrete, family = %family, "family declared");
        self
    }
}

impl TypeFamilyResolver for DeclaredFamilies {
    fn families(&self, concrete: ComponentType) -> Vec<ComponentType> {
        let declared = self.declared.read();
        match declared.get(&concrete) {
            Some(entries) => self_first(concrete, entries.iter().map(|(ty, _)| *ty)),
            None => vec![concrete],
        }
    }

    fn upcast(&self, family: ComponentType, component: &Component) -> Option<Box<dyn Any + Send + Sync>> {
        let concrete = component.component_type()?;
        let cast = {
            let declared = self.declared.read();
            let (_, cast) = declared.get(&concrete)?.iter().find(|(ty, _)| *ty == family)?;
            Arc::clone(cast)
        };
        cast(component.shared_any()?)
    }
}

// ---------------------------------------------------------------------------
// ExplicitFamilies
// ---------------------------------------------------------------------------

/// Resolver returning only the families registered for a type.
///
/// Unregistered types form a family of their own. The concrete type is
/// always part of its family since the authoritative copy lives there.
#[derive(Debug, Default)]
pub struct ExplicitFamilies {
    mapping: RwLock<HashMap<ComponentType, Vec<ComponentType>>>,
}

impl ExplicitFamilies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `families` for `concrete`, replacing earlier registrations.
    pub fn add(&self, concrete: ComponentType, families: &[ComponentType]) -> &Self {
        self.mapping
            .write()
            .insert(concrete, self_first(concrete, families.iter().copied()));
        self
    }

    /// Typed [`add`](Self::add).
    pub fn add_for<T: ?Sized + 'static>(&self, families: &[ComponentType]) -> &Self {
        self.add(ComponentType::of::<T>(), families)
    }
}

impl TypeFamilyResolver for ExplicitFamilies {
    fn families(&self, concrete: ComponentType) -> Vec<ComponentType> {
        self.mapping
            .read()
            .get(&concrete)
            .cloned()
            .unwrap_or_else(|| vec![concrete])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    trait Car: Send + Sync {
        fn plate(&self) -> String;
    }

    #[derive(Debug)]
    struct Sedan(&'static str);

    impl Car for Sedan {
        fn plate(&self) -> String {
            self.0.to_owned()
        }
    }

    #[derive(Debug)]
    struct Wheel;

    // -- declared --

    #[test]
    fn undeclared_type_is_its_own_family() {
        let families = DeclaredFamilies::new();
        assert_eq!(
            families.families(ComponentType::of::<Wheel>()),
            vec![ComponentType::of::<Wheel>()]
        );
    }

    #[test]
    fn declared_family_follows_concrete() {
        let families = DeclaredFamilies::new();
        families.declare::<Sedan, dyn Car>(|s| s as Arc<dyn Car>);
        families.declare::<Sedan, dyn Car>(|s| s as Arc<dyn Car>);
        assert_eq!(
            families.families(ComponentType::of::<Sedan>()),
            vec![ComponentType::of::<Sedan>(), ComponentType::of::<dyn Car>()]
        );
    }

    #[test]
    fn upcast_yields_family_view() {
        let families = DeclaredFamilies::new();
        families.declare::<Sedan, dyn Car>(|s| s as Arc<dyn Car>);
        let component = Component::new(1, Sedan("A"));

        let boxed = families
            .upcast(ComponentType::of::<dyn Car>(), &component)
            .unwrap();
        let car = boxed.downcast::<Arc<dyn Car>>().unwrap();
        assert_eq!(car.plate(), "A");

        let boxed = families
            .upcast(ComponentType::of::<Sedan>(), &component)
            .unwrap();
        assert!(boxed.downcast::<Arc<Sedan>>().is_ok());

        assert!(families
            .upcast(ComponentType::of::<Wheel>(), &component)
            .is_none());
    }

    // -- explicit --

    #[test]
    fn explicit_mapping_keeps_concrete_first() {
        let families = ExplicitFamilies::new();
        families.add_for::<Sedan>(&[ComponentType::of::<dyn Car>()]);
        assert_eq!(
            families.families(ComponentType::of::<Sedan>()),
            vec![ComponentType::of::<Sedan>(), ComponentType::of::<dyn Car>()]
        );
        assert_eq!(
            families.families(ComponentType::of::<Wheel>()),
            vec![ComponentType::of::<Wheel>()]
        );
    }
}
