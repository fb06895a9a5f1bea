//! Group-based collision routing.
//!
//! Entities opt into gameplay collisions with a [`CollisionHandlerComponent`]
//! listing the collision groups they belong to. Systems that care about a pair
//! of groups own a [`CollisionFilter`] for that signature and register it with
//! their game state's [`CollisionRouter`]. Each frame the [`CollisionSystem`]
//! walks the physics contacts, resolves both bodies to entities, and hands the
//! entity pair to every filter whose signature matches a pair of their groups.
//!
//! A filter keeps accumulating pairs until its owner clears it.
//!
//! Entities can also name a callback key on their handler component. The
//! callback registered under that key on the router is invoked directly,
//! once as `(a, b)` and once as `(b, a)`, whichever side carries the key.

use std::cell::{Ref, RefCell};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use microcosm_ecs::prelude::*;

use crate::contact::ContactSource;
use crate::system::{System, SystemContext};

/// Name of the [`CollisionSystem`].
pub const COLLISION_SYSTEM_NAME: &str = "collision";

/// A routed pair of colliding entities.
pub type Collision = (EntityId, EntityId);

/// A direct collision callback: `(entities, self, opponent)`.
pub type CollisionCallback = Box<dyn FnMut(&mut EntityManager, EntityId, EntityId)>;

type CollisionSet = RefCell<BTreeSet<Collision>>;

/// Errors produced by collision routing.
#[derive(Debug, thiserror::Error)]
pub enum CollisionError {
    #[error("a collision callback is already registered under key '{key}'")]
    DuplicateCallbackKey { key: String },
}

// ---------------------------------------------------------------------------
// CollisionHandlerComponent
// ---------------------------------------------------------------------------

/// Declares which collision groups an entity belongs to.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct CollisionHandlerComponent {
    #[serde(rename = "collisionGroups", default)]
    collision_groups: Vec<String>,
    /// Key of a direct callback on the router. Empty means none.
    #[serde(rename = "collisionCallbackKey", default)]
    collision_callback_key: String,
}

impl Component for CollisionHandlerComponent {
    const TYPE_NAME: &'static str = "CollisionHandlerComponent";
}

impl CollisionHandlerComponent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`add_collision_group`](Self::add_collision_group).
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.add_collision_group(group);
        self
    }

    pub fn add_collision_group(&mut self, group: impl Into<String>) {
        self.collision_groups.push(group.into());
    }

    pub fn collision_groups(&self) -> &[String] {
        &self.collision_groups
    }

    pub fn set_collision_callback_key(&mut self, key: impl Into<String>) {
        self.collision_callback_key = key.into();
    }

    pub fn collision_callback_key(&self) -> &str {
        &self.collision_callback_key
    }
}

// ---------------------------------------------------------------------------
// CollisionFilter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RouterId(u64);

impl RouterId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Accumulates the entity pairs routed under one `(group1, group2)`
/// signature.
///
/// Construction does not register the filter; call
/// [`CollisionRouter::register_filter`] (or use [`CollisionFilter::registered`]).
/// Routed pairs are oriented to the signature: the first entity belongs to
/// `group1`, the second to `group2`. When both groups are the same the pair
/// is stored lowest id first.
#[derive(Debug)]
pub struct CollisionFilter {
    signature: (String, String),
    collisions: Rc<CollisionSet>,
    router: Option<RouterId>,
}

impl CollisionFilter {
    pub fn new(group1: impl Into<String>, group2: impl Into<String>) -> Self {
        Self {
            signature: (group1.into(), group2.into()),
            collisions: Rc::new(RefCell::new(BTreeSet::new())),
            router: None,
        }
    }

    /// Construct and register in one call.
    pub fn registered(
        group1: impl Into<String>,
        group2: impl Into<String>,
        router: &mut CollisionRouter,
    ) -> Self {
        let mut filter = Self::new(group1, group2);
        router.register_filter(&mut filter);
        filter
    }

    /// Record a collision. Inserting a pair that is already present is a
    /// no-op.
    pub fn add_collision(&self, collision: Collision) {
        self.collisions.borrow_mut().insert(collision);
    }

    /// The pairs recorded since the last clear, in ascending order.
    pub fn collisions(&self) -> Ref<'_, BTreeSet<Collision>> {
        self.collisions.borrow()
    }

    /// Remove and return every recorded pair.
    pub fn take_collisions(&self) -> BTreeSet<Collision> {
        std::mem::take(&mut *self.collisions.borrow_mut())
    }

    pub fn contains(&self, collision: Collision) -> bool {
        self.collisions.borrow().contains(&collision)
    }

    pub fn len(&self) -> usize {
        self.collisions.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collisions.borrow().is_empty()
    }

    pub fn clear_collisions(&self) {
        self.collisions.borrow_mut().clear();
    }

    /// Move this filter to `router`.
    ///
    /// Accumulated collisions are discarded and the filter stops receiving
    /// pairs from the router it was registered with before.
    pub fn set_collision_system(&mut self, router: &mut CollisionRouter) {
        self.collisions = Rc::new(RefCell::new(BTreeSet::new()));
        self.router = None;
        router.register_filter(self);
    }

    /// The `(group1, group2)` key this filter is routed under.
    pub fn collision_signature(&self) -> (&str, &str) {
        (&self.signature.0, &self.signature.1)
    }

    pub fn is_registered(&self) -> bool {
        self.router.is_some()
    }
}

// ---------------------------------------------------------------------------
// CollisionRouter
// ---------------------------------------------------------------------------

/// The routing table shared by the systems of one game state.
pub struct CollisionRouter {
    id: RouterId,
    /// group1 -> group2 -> sinks of registered filters.
    routes: HashMap<String, HashMap<String, Vec<Weak<CollisionSet>>>>,
    callbacks: HashMap<String, CollisionCallback>,
}

impl CollisionRouter {
    pub fn new() -> Self {
        Self {
            id: RouterId::next(),
            routes: HashMap::new(),
            callbacks: HashMap::new(),
        }
    }

    /// Index `filter` under its signature.
    ///
    /// A filter registered with another router is moved here: its
    /// accumulated collisions are discarded and the old router stops
    /// delivering to it.
    ///
    /// # Panics
    ///
    /// Panics if the filter is already registered with this router.
    pub fn register_filter(&mut self, filter: &mut CollisionFilter) {
        assert!(
            filter.router != Some(self.id),
            "collision filter ({:?}, {:?}) is already registered with this router",
            filter.signature.0,
            filter.signature.1
        );
        if filter.router.is_some() {
            filter.collisions = Rc::new(RefCell::new(BTreeSet::new()));
        }
        let (g1, g2) = &filter.signature;
        self.routes
            .entry(g1.clone())
            .or_default()
            .entry(g2.clone())
            .or_default()
            .push(Rc::downgrade(&filter.collisions));
        filter.router = Some(self.id);
        tracing::trace!(group1 = %g1, group2 = %g2, "registered collision filter");
    }

    /// Number of registered filters that are still alive.
    pub fn filter_count(&self) -> usize {
        self.routes
            .values()
            .flat_map(HashMap::values)
            .flatten()
            .filter(|sink| sink.strong_count() > 0)
            .count()
    }

    /// Route one contact between `a` and `b` to every matching filter.
    ///
    /// Every `(ga, gb)` in `groups_a × groups_b` delivers `(a, b)`; then every
    /// `(gb, ga)` in `groups_b × groups_a` not already matched delivers
    /// `(b, a)`. A filter therefore sees the pair no matter which body the
    /// physics engine listed first. Returns the number of deliveries.
    pub fn route(
        &mut self,
        a: EntityId,
        groups_a: &[String],
        b: EntityId,
        groups_b: &[String],
    ) -> usize {
        let mut matched: HashSet<(&str, &str)> = HashSet::new();
        let mut delivered = 0;
        for (first, first_groups, second, second_groups) in
            [(a, groups_a, b, groups_b), (b, groups_b, a, groups_a)]
        {
            for g1 in first_groups {
                for g2 in second_groups {
                    if !matched.insert((g1.as_str(), g2.as_str())) {
                        continue;
                    }
                    let pair = if g1 == g2 {
                        (first.min(second), first.max(second))
                    } else {
                        (first, second)
                    };
                    delivered += self.deliver(g1, g2, pair);
                }
            }
        }
        delivered
    }

    fn deliver(&mut self, g1: &str, g2: &str, pair: Collision) -> usize {
        let Some(sinks) = self.routes.get_mut(g1).and_then(|by_g2| by_g2.get_mut(g2)) else {
            return 0;
        };
        sinks.retain(|sink| sink.strong_count() > 0);
        let mut delivered = 0;
        for sink in sinks.iter().filter_map(Weak::upgrade) {
            sink.borrow_mut().insert(pair);
            delivered += 1;
        }
        delivered
    }

    // -- callbacks ----------------------------------------------------------

    /// Register `callback` under `key`, replacing and returning any earlier
    /// callback with the same key.
    pub fn register_collision_callback<F>(
        &mut self,
        key: impl Into<String>,
        callback: F,
    ) -> Option<CollisionCallback>
    where
        F: FnMut(&mut EntityManager, EntityId, EntityId) + 'static,
    {
        let key = key.into();
        let previous = self.callbacks.insert(key.clone(), Box::new(callback));
        if previous.is_some() {
            tracing::warn!(key = %key, "collision callback replaced an earlier registration");
        }
        previous
    }

    /// Register `callback` under `key` unless the key is taken.
    pub fn try_register_collision_callback<F>(
        &mut self,
        key: impl Into<String>,
        callback: F,
    ) -> Result<(), CollisionError>
    where
        F: FnMut(&mut EntityManager, EntityId, EntityId) + 'static,
    {
        let key = key.into();
        if self.callbacks.contains_key(&key) {
            return Err(CollisionError::DuplicateCallbackKey { key });
        }
        self.callbacks.insert(key, Box::new(callback));
        Ok(())
    }

    pub fn remove_collision_callback(&mut self, key: &str) -> Option<CollisionCallback> {
        self.callbacks.remove(key)
    }

    pub fn has_collision_callback(&self, key: &str) -> bool {
        self.callbacks.contains_key(key)
    }

    /// Invoke the callback under `key` with `(this, opponent)`. Returns
    /// `false` when no callback is registered under `key`.
    pub fn invoke_callback(
        &mut self,
        key: &str,
        entities: &mut EntityManager,
        this: EntityId,
        opponent: EntityId,
    ) -> bool {
        match self.callbacks.get_mut(key) {
            Some(callback) => {
                callback(entities, this, opponent);
                true
            }
            None => false,
        }
    }
}

impl Default for CollisionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollisionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut keys: Vec<&String> = self.callbacks.keys().collect();
        keys.sort();
        f.debug_struct("CollisionRouter")
            .field("filters", &self.filter_count())
            .field("callbacks", &keys)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// CollisionSystem
// ---------------------------------------------------------------------------

/// Summary of one routing pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoutingReport {
    /// Manifolds resolved to two handler-carrying entities.
    pub routed: usize,
    /// Manifolds skipped (consumed, untagged, or without handlers).
    pub skipped: usize,
    /// Filter deliveries made.
    pub deliveries: usize,
    /// Direct callbacks invoked.
    pub callbacks: usize,
}

/// Walk `source`'s manifolds and route every contact between two
/// handler-carrying entities.
///
/// Every manifold is cleared afterwards. Each distinct callback key carried
/// by either handler is invoked for both orderings of the pair, so a key
/// carried by both sides still fires exactly twice. Callbacks run once the
/// walk is done, with mutable access to `entities`; entities they destroy are
/// removed at the next flush.
pub fn route_contacts(
    source: &mut dyn ContactSource,
    entities: &mut EntityManager,
    router: &mut CollisionRouter,
) -> RoutingReport {
    let mut report = RoutingReport::default();
    let mut pending_callbacks: Vec<(String, EntityId, EntityId)> = Vec::new();

    for manifold in source.manifolds_mut() {
        if manifold.is_empty() {
            report.skipped += 1;
            continue;
        }
        let resolved = manifold.body_a.entity().zip(manifold.body_b.entity());
        manifold.clear();

        let Some((a, b)) = resolved else {
            tracing::trace!("skipping manifold with an untagged body");
            report.skipped += 1;
            continue;
        };
        let handlers = entities
            .get_component::<CollisionHandlerComponent>(a)
            .zip(entities.get_component::<CollisionHandlerComponent>(b));
        let Some((handler_a, handler_b)) = handlers else {
            tracing::trace!(entity_a = %a, entity_b = %b, "skipping contact without handlers");
            report.skipped += 1;
            continue;
        };

        report.routed += 1;
        report.deliveries += router.route(
            a,
            handler_a.collision_groups(),
            b,
            handler_b.collision_groups(),
        );
        let key_a = handler_a.collision_callback_key();
        let key_b = handler_b.collision_callback_key();
        let keys = if key_a == key_b { [key_a, ""] } else { [key_a, key_b] };
        for key in keys {
            if key.is_empty() || !router.has_collision_callback(key) {
                continue;
            }
            pending_callbacks.push((key.to_owned(), a, b));
            pending_callbacks.push((key.to_owned(), b, a));
        }
    }

    for (key, this, opponent) in pending_callbacks {
        if router.invoke_callback(&key, entities, this, opponent) {
            report.callbacks += 1;
        }
    }
    report
}

/// Routes the physics world's contacts once per frame.
#[derive(Debug, Default)]
pub struct CollisionSystem {
    last_report: RoutingReport,
}

impl CollisionSystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// What the most recent update routed.
    pub fn last_report(&self) -> RoutingReport {
        self.last_report
    }
}

impl System for CollisionSystem {
    fn name(&self) -> &str {
        COLLISION_SYSTEM_NAME
    }

    fn update(&mut self, ctx: &mut SystemContext<'_>, _dt: f64) -> anyhow::Result<()> {
        self.last_report = route_contacts(ctx.physics, ctx.entities, ctx.collisions);
        if self.last_report.routed > 0 {
            tracing::trace!(
                routed = self.last_report.routed,
                deliveries = self.last_report.deliveries,
                callbacks = self.last_report.callbacks,
                "routed collisions"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
