//! Entity filters: live, incrementally maintained queries.
//!
//! An [`EntityFilter`] declares a signature as a tuple type. Each element is
//! either a component type `T` (required) or [`Optional<T>`] (probed, never
//! affects membership):
//!
//! ```
//! use std::sync::Arc;
//! use microcosm_ecs::prelude::*;
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Position { x: f32, y: f32 }
//! impl Component for Position { const TYPE_NAME: &'static str = "Position"; }
//!
//! #[derive(serde::Serialize, serde::Deserialize)]
//! struct Velocity { dx: f32, dy: f32 }
//! impl Component for Velocity { const TYPE_NAME: &'static str = "Velocity"; }
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register::<Position>();
//! registry.register::<Velocity>();
//! let mut entities = EntityManager::new(Arc::new(registry));
//!
//! let e = entities.create_entity();
//! entities.add_component(e, Position { x: 0.0, y: 0.0 }).unwrap();
//!
//! let mut moving = EntityFilter::<(Position, Optional<Velocity>)>::new(true);
//! moving.bind(&mut entities).unwrap();
//! for (entity, (pos, vel)) in moving.iter(&entities) {
//!     assert_eq!(entity, e);
//!     assert_eq!(pos.x, 0.0);
//!     assert!(vel.is_none());
//! }
//! assert_eq!(moving.added_entities(&entities), vec![e]);
//! ```
//!
//! The match set and change sets live in a slot owned by the
//! [`EntityManager`]. Every add, flush, or clear on the manager updates the slot,
//! so binding costs one scan and later upkeep is per change. Iteration walks
//! the match set in ascending id order.
//!
//! Change tracking is opt-in. A tracking filter accumulates entities that
//! started or stopped matching until [`clear_changes`](EntityFilter::clear_changes)
//! is called. Callers that enable tracking must drain it, or the sets grow
//! without bound. An entity can appear in both sets when it stopped and
//! started matching again in one cycle; consumers should process removals
//! before additions.

use std::collections::{btree_set, BTreeSet};
use std::marker::PhantomData;
use std::sync::{Arc, Weak};

use crate::component::{Component, ComponentRegistry, ComponentTypeId};
use crate::entity::EntityId;
use crate::manager::{EntityManager, ManagerId};
use crate::EcsError;

// ---------------------------------------------------------------------------
// Signature
// ---------------------------------------------------------------------------

/// Resolved component types of a filter, in declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signature {
    pub required: Vec<ComponentTypeId>,
    pub optional: Vec<ComponentTypeId>,
}

/// Marks an optional slot in a filter signature.
pub struct Optional<T>(PhantomData<T>);

/// One element of a filter signature.
pub trait FilterItem {
    type Item<'a>;

    fn describe(registry: &ComponentRegistry, signature: &mut Signature) -> Result<(), EcsError>;

    /// `None` means the entity does not satisfy this element.
    fn fetch(manager: &EntityManager, entity: EntityId) -> Option<Self::Item<'_>>;
}

impl<T: Component> FilterItem for T {
    type Item<'a> = &'a T;

    fn describe(registry: &ComponentRegistry, signature: &mut Signature) -> Result<(), EcsError> {
        signature.required.push(registry.require::<T>()?);
        Ok(())
    }

    fn fetch(manager: &EntityManager, entity: EntityId) -> Option<&T> {
        manager.get_component::<T>(entity)
    }
}

impl<T: Component> FilterItem for Optional<T> {
    type Item<'a> = Option<&'a T>;

    fn describe(registry: &ComponentRegistry, signature: &mut Signature) -> Result<(), EcsError> {
        signature.optional.push(registry.require::<T>()?);
        Ok(())
    }

    fn fetch(manager: &EntityManager, entity: EntityId) -> Option<Option<&T>> {
        Some(manager.get_component::<T>(entity))
    }
}

/// A full filter signature: a tuple of [`FilterItem`]s.
///
/// `()` is the empty signature and matches every live entity.
pub trait FilterQuery {
    type Item<'a>;

    fn signature(registry: &ComponentRegistry) -> Result<Signature, EcsError>;

    fn fetch(manager: &EntityManager, entity: EntityId) -> Option<Self::Item<'_>>;
}

impl FilterQuery for () {
    type Item<'a> = ();

    fn signature(_registry: &ComponentRegistry) -> Result<Signature, EcsError> {
        Ok(Signature::default())
    }

    fn fetch(_manager: &EntityManager, _entity: EntityId) -> Option<()> {
        Some(())
    }
}

macro_rules! impl_filter_query {
    ($($item:ident),+) => {
        impl<$($item: FilterItem),+> FilterQuery for ($($item,)+) {
            type Item<'a> = ($(<$item as FilterItem>::Item<'a>,)+);

            fn signature(registry: &ComponentRegistry) -> Result<Signature, EcsError> {
                let mut signature = Signature::default();
                $( $item::describe(registry, &mut signature)?; )+
                Ok(signature)
            }

            fn fetch(manager: &EntityManager, entity: EntityId) -> Option<Self::Item<'_>> {
                Some(($( $item::fetch(manager, entity)?, )+))
            }
        }
    };
}

impl_filter_query!(A);
impl_filter_query!(A, B);
impl_filter_query!(A, B, C);
impl_filter_query!(A, B, C, D);

// ---------------------------------------------------------------------------
// FilterSlot (manager side)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FilterId(pub(crate) u64);

/// Per-filter state stored inside the entity manager.
#[derive(Debug)]
pub(crate) struct FilterSlot {
    pub(crate) signature: Signature,
    track_changes: bool,
    owner: Weak<()>,
    pub(crate) matched: BTreeSet<EntityId>,
    added: BTreeSet<EntityId>,
    removed: BTreeSet<EntityId>,
}

impl FilterSlot {
    /// Whether the owning [`EntityFilter`] still exists.
    pub(crate) fn is_owned(&self) -> bool {
        self.owner.strong_count() > 0
    }

    pub(crate) fn set_membership(&mut self, entity: EntityId, matches: bool) {
        if matches {
            if self.matched.insert(entity) && self.track_changes {
                self.added.insert(entity);
            }
        } else if self.matched.remove(&entity) && self.track_changes {
            self.added.remove(&entity);
            self.removed.insert(entity);
        }
    }
}

// ---------------------------------------------------------------------------
// EntityFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Binding {
    manager: ManagerId,
    slot: FilterId,
}

/// A reusable query over one [`EntityManager`].
///
/// Dropping a bound filter is allowed; the manager discards the orphaned slot
/// at its next flush.
pub struct EntityFilter<Q: FilterQuery> {
    track_changes: bool,
    binding: Option<Binding>,
    token: Arc<()>,
    /// Change sets carried over from a previous binding.
    carried_added: BTreeSet<EntityId>,
    carried_removed: BTreeSet<EntityId>,
    _query: PhantomData<fn() -> Q>,
}

impl<Q: FilterQuery> EntityFilter<Q> {
    /// Create an unbound filter. `track_changes` enables the added/removed sets.
    pub fn new(track_changes: bool) -> Self {
        Self {
            track_changes,
            binding: None,
            token: Arc::new(()),
            carried_added: BTreeSet::new(),
            carried_removed: BTreeSet::new(),
            _query: PhantomData,
        }
    }

    /// Bind to `manager` and build the match set from its current entities.
    ///
    /// With change tracking, every initially matching entity is reported as
    /// added. Rebinding to the same manager rebuilds from scratch. Fails if a
    /// signature type is unregistered or the filter is bound to another
    /// manager.
    pub fn bind(&mut self, manager: &mut EntityManager) -> Result<(), EcsError> {
        if let Some(binding) = self.binding {
            if binding.manager != manager.manager_id() {
                return Err(EcsError::FilterBoundElsewhere);
            }
            self.unbind(manager);
        }
        let signature = Q::signature(manager.registry())?;
        let slot = FilterSlot {
            signature,
            track_changes: self.track_changes,
            owner: Arc::downgrade(&self.token),
            matched: BTreeSet::new(),
            added: BTreeSet::new(),
            removed: BTreeSet::new(),
        };
        let id = manager.attach_filter(slot);
        self.binding = Some(Binding {
            manager: manager.manager_id(),
            slot: id,
        });
        Ok(())
    }

    /// Detach from `manager`. The match set is dropped; pending change sets
    /// are kept on the filter until the next [`clear_changes`](Self::clear_changes).
    pub fn unbind(&mut self, manager: &mut EntityManager) {
        let Some(binding) = self.binding.take() else {
            return;
        };
        assert_eq!(
            binding.manager,
            manager.manager_id(),
            "filter is bound to a different entity manager"
        );
        if let Some(slot) = manager.detach_filter(binding.slot) {
            self.carried_added.extend(slot.added);
            self.carried_removed.extend(slot.removed);
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn tracks_changes(&self) -> bool {
        self.track_changes
    }

    /// Lazily iterate `(entity, items)` over the current match set.
    ///
    /// An unbound filter yields nothing.
    ///
    /// # Panics
    ///
    /// Panics if the filter is bound to a different manager.
    pub fn iter<'m>(&self, manager: &'m EntityManager) -> FilterIter<'m, Q> {
        FilterIter {
            manager,
            entities: self.slot(manager).map(|slot| slot.matched.iter()),
            _query: PhantomData,
        }
    }

    /// The items of one matched entity, or `None` if it does not match.
    pub fn get<'m>(&self, manager: &'m EntityManager, entity: EntityId) -> Option<Q::Item<'m>> {
        if !self.contains(manager, entity) {
            return None;
        }
        Q::fetch(manager, entity)
    }

    /// Snapshot of the matched entities, for loops that mutate the manager.
    pub fn entities(&self, manager: &EntityManager) -> Vec<EntityId> {
        self.slot(manager)
            .map(|slot| slot.matched.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, manager: &EntityManager, entity: EntityId) -> bool {
        self.slot(manager)
            .is_some_and(|slot| slot.matched.contains(&entity))
    }

    pub fn len(&self, manager: &EntityManager) -> usize {
        self.slot(manager).map_or(0, |slot| slot.matched.len())
    }

    pub fn is_empty(&self, manager: &EntityManager) -> bool {
        self.len(manager) == 0
    }

    /// Entities that started matching since the last `clear_changes`.
    pub fn added_entities(&self, manager: &EntityManager) -> Vec<EntityId> {
        let mut out = self.carried_added.clone();
        if let Some(slot) = self.slot(manager) {
            out.extend(slot.added.iter().copied());
        }
        out.into_iter().collect()
    }

    /// Entities that stopped matching since the last `clear_changes`.
    pub fn removed_entities(&self, manager: &EntityManager) -> Vec<EntityId> {
        let mut out = self.carried_removed.clone();
        if let Some(slot) = self.slot(manager) {
            out.extend(slot.removed.iter().copied());
        }
        out.into_iter().collect()
    }

    pub fn clear_changes(&mut self, manager: &mut EntityManager) {
        self.carried_added.clear();
        self.carried_removed.clear();
        if let Some(binding) = self.checked_binding(manager.manager_id()) {
            if let Some(slot) = manager.filter_slot_mut(binding.slot) {
                slot.added.clear();
                slot.removed.clear();
            }
        }
    }

    fn slot<'m>(&self, manager: &'m EntityManager) -> Option<&'m FilterSlot> {
        let binding = self.checked_binding(manager.manager_id())?;
        manager.filter_slot(binding.slot)
    }

    fn checked_binding(&self, manager: ManagerId) -> Option<Binding> {
        let binding = self.binding?;
        assert_eq!(
            binding.manager, manager,
            "filter is bound to a different entity manager"
        );
        Some(binding)
    }
}

impl<Q: FilterQuery> std::fmt::Debug for EntityFilter<Q> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityFilter")
            .field("query", &std::any::type_name::<Q>())
            .field("track_changes", &self.track_changes)
            .field("bound", &self.binding.is_some())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// FilterIter
// ---------------------------------------------------------------------------

/// Iterator returned by [`EntityFilter::iter`].
pub struct FilterIter<'m, Q: FilterQuery> {
    manager: &'m EntityManager,
    entities: Option<btree_set::Iter<'m, EntityId>>,
    _query: PhantomData<fn() -> Q>,
}

impl<'m, Q: FilterQuery> Iterator for FilterIter<'m, Q> {
    type Item = (EntityId, Q::Item<'m>);

    fn next(&mut self) -> Option<Self::Item> {
        let entities = self.entities.as_mut()?;
        for &entity in entities.by_ref() {
            if let Some(items) = Q::fetch(self.manager, entity) {
                return Some((entity, items));
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
