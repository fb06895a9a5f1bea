//! Component types, the type registry, and touch tracking.
//!
//! Every component type must be registered in a [`ComponentRegistry`] before
//! an [`EntityManager`](crate::manager::EntityManager) is built from it.
//! Registration fixes the type's [`ComponentTypeId`] and its persisted
//! `TYPE_NAME`, and records how to build the storage that will own its
//! instances. Save/load and scripted creation go through the registry by name.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::storage::{ComponentStorage, ErasedStorage};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Component trait
// ---------------------------------------------------------------------------

/// A typed, serializable record attached to at most one entity at a time.
///
/// `TYPE_NAME` is the key used in the persisted layout and by
/// [`EntityManager::add_component_by_name`](crate::manager::EntityManager::add_component_by_name).
/// It must be unique within a registry.
pub trait Component: Serialize + DeserializeOwned + 'static {
    const TYPE_NAME: &'static str;
}

// ---------------------------------------------------------------------------
// ComponentTypeId
// ---------------------------------------------------------------------------

/// Small, stable identifier of a registered component type.
///
/// Ids are dense and handed out in registration order, so two registries
/// built by the same code agree on every id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ComponentTypeId(pub(crate) u32);

impl ComponentTypeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ComponentTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComponentTypeId({})", self.0)
    }
}

// ---------------------------------------------------------------------------
// ComponentInfo
// ---------------------------------------------------------------------------

/// Metadata about one registered component type.
#[derive(Debug, Clone)]
pub struct ComponentInfo {
    pub id: ComponentTypeId,
    /// The type's `TYPE_NAME`.
    pub name: &'static str,
    /// Rust `TypeId`, for typed lookups.
    pub type_id: TypeId,
    pub(crate) new_storage: fn() -> Box<dyn ErasedStorage>,
}

fn new_storage<T: Component>() -> Box<dyn ErasedStorage> {
    Box::new(ComponentStorage::<T>::new())
}

// ---------------------------------------------------------------------------
// ComponentRegistry
// ---------------------------------------------------------------------------

/// Maps component types and names to [`ComponentTypeId`]s and storage
/// factories.
///
/// A registry is filled once at startup and then frozen behind an `Arc` that
/// every entity manager of the program shares.
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    by_type: HashMap<TypeId, ComponentTypeId>,
    by_name: HashMap<&'static str, ComponentTypeId>,
    infos: Vec<ComponentInfo>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` and return its new [`ComponentTypeId`].
    ///
    /// # Panics
    ///
    /// Registering the same Rust type twice, or two types that share a
    /// `TYPE_NAME`, is a configuration error and panics.
    pub fn register<T: Component>(&mut self) -> ComponentTypeId {
        let rust_type = TypeId::of::<T>();
        if self.by_type.contains_key(&rust_type) {
            panic!("component type '{}' is already registered", T::TYPE_NAME);
        }
        if self.by_name.contains_key(T::TYPE_NAME) {
            panic!(
                "component name '{}' is already registered for a different type",
                T::TYPE_NAME
            );
        }

        let id = ComponentTypeId(self.infos.len() as u32);
        self.infos.push(ComponentInfo {
            id,
            name: T::TYPE_NAME,
            type_id: rust_type,
            new_storage: new_storage::<T>,
        });
        self.by_type.insert(rust_type, id);
        self.by_name.insert(T::TYPE_NAME, id);
        id
    }

    pub fn lookup<T: Component>(&self) -> Option<ComponentTypeId> {
        self.by_type.get(&TypeId::of::<T>()).copied()
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn get_info(&self, id: ComponentTypeId) -> Option<&ComponentInfo> {
        self.infos.get(id.index())
    }

    pub fn contains<T: Component>(&self) -> bool {
        self.by_type.contains_key(&TypeId::of::<T>())
    }

    /// Names of all registered types, in registration order.
    pub fn registered_names(&self) -> Vec<&'static str> {
        self.infos.iter().map(|info| info.name).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ComponentInfo> {
        self.infos.iter()
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Resolve `T`, or build the error that names every registered type.
    pub(crate) fn require<T: Component>(&self) -> Result<ComponentTypeId, EcsError> {
        self.lookup::<T>().ok_or_else(|| self.unknown(T::TYPE_NAME))
    }

    pub(crate) fn unknown(&self, name: &str) -> EcsError {
        EcsError::UnknownComponent {
            name: name.to_owned(),
            registered: self.registered_names().join(", "),
        }
    }
}

// ---------------------------------------------------------------------------
// Tracked
// ---------------------------------------------------------------------------

/// A field wrapper that remembers whether it was written since the last
/// [`untouch`](Tracked::untouch).
///
/// Systems that push component state to an external collaborator (a text
/// overlay, a sound emitter) poll [`has_changes`](Tracked::has_changes) and
/// only resend what changed. A new or freshly loaded value starts touched.
/// Serializes exactly like `T`.
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked<T> {
    value: T,
    touched: bool,
}

impl<T> Tracked<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            touched: true,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Mutable access. Marks the value touched whether or not it is written.
    pub fn get_mut(&mut self) -> &mut T {
        self.touched = true;
        &mut self.value
    }

    pub fn set(&mut self, value: T) {
        self.value = value;
        self.touched = true;
    }

    pub fn has_changes(&self) -> bool {
        self.touched
    }

    pub fn untouch(&mut self) {
        self.touched = false;
    }
}

impl<T: Default> Default for Tracked<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: Serialize> Serialize for Tracked<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.value.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Tracked<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        T::deserialize(deserializer).map(Tracked::new)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
