//! Per-type component storage.
//!
//! Each registered component type gets one [`ComponentStorage<T>`]: a dense
//! `Vec<T>` of instances, a parallel vector of owning entities, and a sparse
//! map from entity to slot. Removal swaps the last instance into the hole, so
//! the dense arrays stay packed. A component instance lives in exactly one
//! slot and is never shared between entities.
//!
//! The entity manager holds storages behind the [`ErasedStorage`] trait so it
//! can flush removals, clear, and (de)serialize without knowing `T`.

use std::any::Any;
use std::collections::HashMap;

use serde_json::Value;

use crate::component::Component;
use crate::entity::EntityId;
use crate::EcsError;

// ---------------------------------------------------------------------------
// ComponentStorage
// ---------------------------------------------------------------------------

/// Dense storage of every `T` instance, keyed by owning entity.
#[derive(Debug)]
pub struct ComponentStorage<T> {
    values: Vec<T>,
    owners: Vec<EntityId>,
    slots: HashMap<EntityId, usize>,
}

impl<T> ComponentStorage<T> {
    pub fn new() -> Self {
        Self {
            values: Vec::new(),
            owners: Vec::new(),
            slots: HashMap::new(),
        }
    }

    /// Insert `value` for `entity`, returning the instance it replaced.
    pub fn insert(&mut self, entity: EntityId, value: T) -> Option<T> {
        if let Some(&slot) = self.slots.get(&entity) {
            return Some(std::mem::replace(&mut self.values[slot], value));
        }
        self.slots.insert(entity, self.values.len());
        self.values.push(value);
        self.owners.push(entity);
        None
    }

    pub fn get(&self, entity: EntityId) -> Option<&T> {
        self.slots.get(&entity).map(|&slot| &self.values[slot])
    }

    pub fn get_mut(&mut self, entity: EntityId) -> Option<&mut T> {
        self.slots.get(&entity).map(|&slot| &mut self.values[slot])
    }

    pub fn contains(&self, entity: EntityId) -> bool {
        self.slots.contains_key(&entity)
    }

    /// Remove and return the instance owned by `entity`.
    pub fn remove(&mut self, entity: EntityId) -> Option<T> {
        let slot = self.slots.remove(&entity)?;
        let value = self.values.swap_remove(slot);
        self.owners.swap_remove(slot);
        if let Some(&moved) = self.owners.get(slot) {
            self.slots.insert(moved, slot);
        }
        Some(value)
    }

    /// Iterate `(owner, instance)` in dense (unspecified) order.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &T)> {
        self.owners.iter().copied().zip(self.values.iter())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
        self.owners.clear();
        self.slots.clear();
    }
}

impl<T> Default for ComponentStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Type-erased access
// ---------------------------------------------------------------------------

/// Operations the entity manager needs on a storage whose `T` it does not
/// know statically.
pub(crate) trait ErasedStorage: Any {
    fn type_name(&self) -> &'static str;
    fn contains(&self, entity: EntityId) -> bool;
    /// Drop the instance owned by `entity`. Returns `false` if there was none.
    fn erase(&mut self, entity: EntityId) -> bool;
    fn get_any(&self, entity: EntityId) -> Option<&dyn Any>;
    /// Serialize the instance owned by `entity`, if any.
    fn to_json(&self, entity: EntityId) -> Option<Result<Value, EcsError>>;
    /// Deserialize `value` and attach it to `entity`, replacing any instance.
    fn insert_json(&mut self, entity: EntityId, value: &Value) -> Result<(), EcsError>;
    fn clear(&mut self);
    fn len(&self) -> usize;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Component> ErasedStorage for ComponentStorage<T> {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn contains(&self, entity: EntityId) -> bool {
        ComponentStorage::contains(self, entity)
    }

    fn erase(&mut self, entity: EntityId) -> bool {
        self.remove(entity).is_some()
    }

    fn get_any(&self, entity: EntityId) -> Option<&dyn Any> {
        self.get(entity).map(|v| v as &dyn Any)
    }

    fn to_json(&self, entity: EntityId) -> Option<Result<Value, EcsError>> {
        self.get(entity).map(|v| {
            serde_json::to_value(v).map_err(|e| EcsError::ComponentSerializationError {
                component: T::TYPE_NAME.to_owned(),
                details: e.to_string(),
            })
        })
    }

    fn insert_json(&mut self, entity: EntityId, value: &Value) -> Result<(), EcsError> {
        let parsed = T::deserialize(value).map_err(|e| EcsError::ComponentDeserializationError {
            component: T::TYPE_NAME.to_owned(),
            details: e.to_string(),
        })?;
        self.insert(entity, parsed);
        Ok(())
    }

    fn clear(&mut self) {
        ComponentStorage::clear(self)
    }

    fn len(&self) -> usize {
        ComponentStorage::len(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
