//! The entity manager: entity lifetimes, component storages, deferred removal.
//!
//! The [`EntityManager`] exclusively owns one storage per registered component
//! type. Additions take effect immediately. Component removals and entity
//! destruction are queued and only applied by
//! [`process_removals`](EntityManager::process_removals), which the game state
//! calls once per frame after every system has run. A system can therefore
//! destroy the entity it is currently looking at without any other system
//! observing a half-removed entity during the same frame.
//!
//! Bound [`EntityFilter`](crate::filter::EntityFilter)s keep their match sets
//! in slots owned by the manager, and every structural change updates those
//! slots in place.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::{EntityAllocator, EntityId, RestoreIdsError};
use crate::filter::{FilterId, FilterSlot};
use crate::storage::{ComponentStorage, ErasedStorage};
use crate::EcsError;

/// Process-unique identity of an entity manager, used to catch filters being
/// read against a manager they were not bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ManagerId(u64);

impl ManagerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// EntityManager
// ---------------------------------------------------------------------------

/// Owns every entity and component of one game state.
pub struct EntityManager {
    id: ManagerId,
    registry: Arc<ComponentRegistry>,
    allocator: EntityAllocator,
    /// Indexed by `ComponentTypeId`.
    storages: Vec<Box<dyn ErasedStorage>>,
    pending_components: Vec<(EntityId, ComponentTypeId)>,
    pending_entities: Vec<EntityId>,
    filters: BTreeMap<FilterId, FilterSlot>,
    next_filter: u64,
}

impl EntityManager {
    /// Create an empty manager with one storage per type in `registry`.
    pub fn new(registry: Arc<ComponentRegistry>) -> Self {
        let storages = registry.iter().map(|info| (info.new_storage)()).collect();
        Self {
            id: ManagerId::next(),
            registry,
            allocator: EntityAllocator::new(),
            storages,
            pending_components: Vec::new(),
            pending_entities: Vec::new(),
            filters: BTreeMap::new(),
            next_filter: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub(crate) fn manager_id(&self) -> ManagerId {
        self.id
    }

    // -- entities -----------------------------------------------------------

    /// Allocate a fresh entity with no components.
    ///
    /// # Panics
    ///
    /// Panics if the entity id space is exhausted.
    pub fn create_entity(&mut self) -> EntityId {
        let entity = self.allocator.allocate();
        self.refresh_filters(entity, None);
        entity
    }

    pub fn is_alive(&self, entity: EntityId) -> bool {
        self.allocator.is_alive(entity)
    }

    /// Number of live entities, including those queued for destruction.
    pub fn entity_count(&self) -> usize {
        self.allocator.alive_count()
    }

    /// All live entities in ascending id order.
    pub fn entities(&self) -> Vec<EntityId> {
        self.allocator.alive_ids().collect()
    }

    /// Queue `entity` for destruction at the next
    /// [`process_removals`](Self::process_removals).
    ///
    /// Until then the entity and its components stay fully visible.
    pub fn destroy_entity(&mut self, entity: EntityId) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        self.pending_entities.push(entity);
        Ok(())
    }

    pub fn is_pending_destruction(&self, entity: EntityId) -> bool {
        self.pending_entities.contains(&entity)
    }

    /// Number of queued component removals and entity destructions.
    pub fn pending_removal_count(&self) -> usize {
        self.pending_components.len() + self.pending_entities.len()
    }

    // -- components ---------------------------------------------------------

    /// Attach `component` to `entity`.
    ///
    /// Fails if the entity is stale or `T` is not registered.
    ///
    /// # Panics
    ///
    /// Panics if the entity already holds a `T`.
    pub fn add_component<T: Component>(
        &mut self,
        entity: EntityId,
        component: T,
    ) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        let type_id = self.registry.require::<T>()?;
        self.assert_absent(entity, type_id);
        self.typed_mut::<T>(type_id).insert(entity, component);
        self.refresh_filters(entity, Some(type_id));
        Ok(())
    }

    /// Attach a component given its `TYPE_NAME` and serialized fields.
    ///
    /// This is the entry point for scripted and data-driven creation.
    ///
    /// # Panics
    ///
    /// Panics if the entity already holds a component of that type.
    pub fn add_component_by_name(
        &mut self,
        entity: EntityId,
        type_name: &str,
        fields: &Value,
    ) -> Result<ComponentTypeId, EcsError> {
        self.ensure_alive(entity)?;
        let type_id = self
            .registry
            .lookup_by_name(type_name)
            .ok_or_else(|| self.registry.unknown(type_name))?;
        self.assert_absent(entity, type_id);
        self.storages[type_id.index()].insert_json(entity, fields)?;
        self.refresh_filters(entity, Some(type_id));
        Ok(type_id)
    }

    /// The `T` attached to `entity`, or `None` if there is none.
    pub fn get_component<T: Component>(&self, entity: EntityId) -> Option<&T> {
        self.component_storage::<T>()?.get(entity)
    }

    pub fn get_component_mut<T: Component>(&mut self, entity: EntityId) -> Option<&mut T> {
        let type_id = self.registry.lookup::<T>()?;
        self.storages[type_id.index()]
            .as_any_mut()
            .downcast_mut::<ComponentStorage<T>>()?
            .get_mut(entity)
    }

    /// Untyped lookup, for callers that only hold a [`ComponentTypeId`].
    pub fn get_component_by_id(
        &self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Option<&dyn std::any::Any> {
        self.storages.get(type_id.index())?.get_any(entity)
    }

    pub fn has_component<T: Component>(&self, entity: EntityId) -> bool {
        self.get_component::<T>(entity).is_some()
    }

    /// Types currently attached to `entity`, in id order.
    pub fn component_type_ids(&self, entity: EntityId) -> Vec<ComponentTypeId> {
        self.registry
            .iter()
            .filter(|info| self.storages[info.id.index()].contains(entity))
            .map(|info| info.id)
            .collect()
    }

    /// Direct read access to every `T` instance.
    pub fn component_storage<T: Component>(&self) -> Option<&ComponentStorage<T>> {
        let type_id = self.registry.lookup::<T>()?;
        self.storages[type_id.index()].as_any().downcast_ref()
    }

    /// Queue removal of the `T` attached to `entity`.
    pub fn remove_component<T: Component>(&mut self, entity: EntityId) -> Result<(), EcsError> {
        let type_id = self.registry.require::<T>()?;
        self.remove_component_by_id(entity, type_id)
    }

    /// Queue removal of the component of type `type_id` attached to `entity`.
    ///
    /// Queuing a removal for a component the entity does not hold is allowed;
    /// the flush simply finds nothing to erase.
    pub fn remove_component_by_id(
        &mut self,
        entity: EntityId,
        type_id: ComponentTypeId,
    ) -> Result<(), EcsError> {
        self.ensure_alive(entity)?;
        if type_id.index() >= self.storages.len() {
            return Err(self.registry.unknown(&format!("{type_id:?}")));
        }
        self.pending_components.push((entity, type_id));
        Ok(())
    }

    // -- flush --------------------------------------------------------------

    /// Apply every queued removal and notify bound filters.
    ///
    /// Component removals are applied before entity destruction. Duplicate
    /// requests collapse.
    pub fn process_removals(&mut self) {
        self.filters.retain(|_, slot| slot.is_owned());

        let components = std::mem::take(&mut self.pending_components);
        let mut erased = 0usize;
        for (entity, type_id) in components {
            if !self.allocator.is_alive(entity) {
                continue;
            }
            if self.storages[type_id.index()].erase(entity) {
                erased += 1;
                self.refresh_filters(entity, Some(type_id));
            }
        }

        let entities = std::mem::take(&mut self.pending_entities);
        let mut destroyed = 0usize;
        for entity in entities {
            if self.despawn(entity) {
                destroyed += 1;
            }
        }

        if erased > 0 || destroyed > 0 {
            tracing::debug!(
                components = erased,
                entities = destroyed,
                remaining = self.allocator.alive_count(),
                "processed removals"
            );
        }
    }

    /// Destroy every entity immediately and drop all queued removals.
    ///
    /// Meant for load time, outside any frame. Bound filters receive a
    /// removal for every entity they matched.
    pub fn clear(&mut self) {
        self.pending_components.clear();
        self.pending_entities.clear();
        let live: Vec<EntityId> = self.allocator.alive_ids().collect();
        for entity in live {
            self.despawn(entity);
        }
    }

    fn despawn(&mut self, entity: EntityId) -> bool {
        if !self.allocator.is_alive(entity) {
            return false;
        }
        for storage in &mut self.storages {
            storage.erase(entity);
        }
        self.allocator.deallocate(entity);
        self.refresh_filters(entity, None);
        true
    }

    // -- internals ----------------------------------------------------------

    fn ensure_alive(&self, entity: EntityId) -> Result<(), EcsError> {
        if self.allocator.is_alive(entity) {
            Ok(())
        } else {
            Err(EcsError::StaleEntity { entity })
        }
    }

    fn assert_absent(&self, entity: EntityId, type_id: ComponentTypeId) {
        let storage = &self.storages[type_id.index()];
        assert!(
            !storage.contains(entity),
            "entity {} already has component '{}'",
            entity,
            storage.type_name()
        );
    }

    fn typed_mut<T: Component>(&mut self, type_id: ComponentTypeId) -> &mut ComponentStorage<T> {
        match self.storages[type_id.index()]
            .as_any_mut()
            .downcast_mut::<ComponentStorage<T>>()
        {
            Some(storage) => storage,
            None => unreachable!("storage for '{}' has the wrong type", T::TYPE_NAME),
        }
    }

    pub(crate) fn storages_mut(&mut self) -> &mut [Box<dyn ErasedStorage>] {
        &mut self.storages
    }

    pub(crate) fn storages(&self) -> &[Box<dyn ErasedStorage>] {
        &self.storages
    }

    /// Make exactly `ids` live, keeping the generations of every other slot.
    pub(crate) fn restore_allocator(&mut self, ids: &[EntityId]) -> Result<(), RestoreIdsError> {
        self.allocator = self.allocator.rebuilt_with_live(ids)?;
        Ok(())
    }

    /// Re-evaluate `entity` against bound filters.
    ///
    /// With `changed` set, only filters requiring that type can change their
    /// verdict; otherwise every filter is checked.
    pub(crate) fn refresh_filters(&mut self, entity: EntityId, changed: Option<ComponentTypeId>) {
        let alive = self.allocator.is_alive(entity);
        let storages = &self.storages;
        for slot in self.filters.values_mut() {
            if let Some(type_id) = changed {
                if !slot.signature.required.contains(&type_id) {
                    continue;
                }
            }
            let matches = alive
                && slot
                    .signature
                    .required
                    .iter()
                    .all(|t| storages[t.index()].contains(entity));
            slot.set_membership(entity, matches);
        }
    }

    // -- filter slots -------------------------------------------------------

    pub(crate) fn attach_filter(&mut self, mut slot: FilterSlot) -> FilterId {
        for entity in self.allocator.alive_ids() {
            let matches = slot
                .signature
                .required
                .iter()
                .all(|t| self.storages[t.index()].contains(entity));
            slot.set_membership(entity, matches);
        }
        let id = FilterId(self.next_filter);
        self.next_filter += 1;
        self.filters.insert(id, slot);
        id
    }

    pub(crate) fn detach_filter(&mut self, id: FilterId) -> Option<FilterSlot> {
        self.filters.remove(&id)
    }

    pub(crate) fn filter_slot(&self, id: FilterId) -> Option<&FilterSlot> {
        self.filters.get(&id)
    }

    pub(crate) fn filter_slot_mut(&mut self, id: FilterId) -> Option<&mut FilterSlot> {
        self.filters.get_mut(&id)
    }

    /// Number of filters currently bound to this manager.
    pub fn filter_count(&self) -> usize {
        self.filters.values().filter(|slot| slot.is_owned()).count()
    }
}

impl std::fmt::Debug for EntityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityManager")
            .field("entities", &self.allocator.alive_count())
            .field("component_types", &self.storages.len())
            .field("pending_removals", &self.pending_removal_count())
            .field("filters", &self.filters.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
