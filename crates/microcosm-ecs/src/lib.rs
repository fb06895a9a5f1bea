//! Microcosm ECS -- entity/component storage with deferred removal and live filters.
//!
//! This crate is the data half of the Microcosm runtime. An
//! [`EntityManager`](manager::EntityManager) owns generation-tagged entity ids
//! and one dense storage per registered component type. Systems query it
//! through [`EntityFilter`](filter::EntityFilter)s, which the manager keeps up
//! to date incrementally and which can report which entities started or
//! stopped matching. Destruction is two-phase: requests are queued during a
//! frame and applied by a single flush at the end of it.
//!
//! # Quick Start
//!
//! ```
//! use std::sync::Arc;
//! use microcosm_ecs::prelude::*;
//!
//! #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
//! struct Health(u32);
//! impl Component for Health { const TYPE_NAME: &'static str = "Health"; }
//!
//! let mut registry = ComponentRegistry::new();
//! registry.register::<Health>();
//! let mut entities = EntityManager::new(Arc::new(registry));
//!
//! let e = entities.create_entity();
//! entities.add_component(e, Health(3)).unwrap();
//! entities.destroy_entity(e).unwrap();
//! assert_eq!(entities.get_component::<Health>(e), Some(&Health(3)));
//!
//! entities.process_removals();
//! assert!(entities.get_component::<Health>(e).is_none());
//! ```

#![deny(unsafe_code)]

pub mod component;
pub mod entity;
pub mod filter;
pub mod manager;
mod persist;
pub mod storage;

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors produced by ECS operations.
#[derive(Debug, thiserror::Error)]
pub enum EcsError {
    /// The entity does not exist (stale generation or never allocated).
    #[error("entity {entity:?} does not exist (stale or never allocated)")]
    StaleEntity { entity: entity::EntityId },

    /// A component type was referenced that has not been registered.
    #[error("component type '{name}' not registered. Registered components: [{registered}]")]
    UnknownComponent { name: String, registered: String },

    /// Deserialization of a component value failed.
    #[error("failed to deserialize component '{component}': {details}")]
    ComponentDeserializationError { component: String, details: String },

    /// Serialization of a component value failed.
    #[error("failed to serialize component '{component}': {details}")]
    ComponentSerializationError { component: String, details: String },

    /// A storage blob does not have the expected shape.
    #[error("malformed entity storage: {details}")]
    MalformedStorage { details: String },

    /// The filter is already bound to a different entity manager.
    #[error("entity filter is already bound to a different entity manager")]
    FilterBoundElsewhere,
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common usage.
pub mod prelude {
    pub use crate::component::{Component, ComponentInfo, ComponentRegistry, ComponentTypeId, Tracked};
    pub use crate::entity::EntityId;
    pub use crate::filter::{EntityFilter, FilterIter, FilterQuery, Optional, Signature};
    pub use crate::manager::EntityManager;
    pub use crate::storage::ComponentStorage;
    pub use crate::EcsError;
}

// ---------------------------------------------------------------------------
// Integration Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::prelude::*;

    // -- test component types -----------------------------------------------

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {
        const TYPE_NAME: &'static str = "Position";
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Velocity {
        dx: f32,
        dy: f32,
    }
    impl Component for Velocity {
        const TYPE_NAME: &'static str = "Velocity";
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Label {
        text: Tracked<String>,
    }
    impl Component for Label {
        const TYPE_NAME: &'static str = "Label";
    }

    fn setup_manager() -> EntityManager {
        let mut registry = ComponentRegistry::new();
        registry.register::<Position>();
        registry.register::<Velocity>();
        registry.register::<Label>();
        EntityManager::new(Arc::new(registry))
    }

    // -- frame-shaped usage -------------------------------------------------

    #[test]
    fn movement_pass_over_filter_snapshot() {
        let mut m = setup_manager();
        let mut movers = EntityFilter::<(Position, Velocity)>::new(false);
        movers.bind(&mut m).unwrap();

        for i in 0..4 {
            let e = m.create_entity();
            m.add_component(e, Position { x: i as f32, y: 0.0 }).unwrap();
            if i % 2 == 0 {
                m.add_component(e, Velocity { dx: 1.0, dy: 0.5 }).unwrap();
            }
        }

        for e in movers.entities(&m) {
            let vel = m.get_component::<Velocity>(e).unwrap().clone();
            let pos = m.get_component_mut::<Position>(e).unwrap();
            pos.x += vel.dx;
            pos.y += vel.dy;
        }

        let xs: Vec<f32> = movers.iter(&m).map(|(_, (p, _))| p.x).collect();
        assert_eq!(xs, vec![1.0, 3.0]);
    }

    #[test]
    fn destroy_during_iteration_is_deferred() {
        let mut m = setup_manager();
        let mut f = EntityFilter::<(Position,)>::new(true);
        f.bind(&mut m).unwrap();
        let ids: Vec<EntityId> = (0..3)
            .map(|i| {
                let e = m.create_entity();
                m.add_component(e, Position { x: i as f32, y: 0.0 }).unwrap();
                e
            })
            .collect();
        f.clear_changes(&mut m);

        for e in f.entities(&m) {
            m.destroy_entity(e).unwrap();
            assert_eq!(f.len(&m), 3, "no filter may observe a half-removed entity");
        }
        m.process_removals();
        assert!(f.is_empty(&m));
        assert_eq!(f.removed_entities(&m), ids);
    }

    #[test]
    fn tracked_fields_survive_roundtrip() {
        let mut m = setup_manager();
        let e = m.create_entity();
        m.add_component(
            e,
            Label {
                text: Tracked::new("score: 0".to_owned()),
            },
        )
        .unwrap();
        m.get_component_mut::<Label>(e).unwrap().text.untouch();
        assert!(!m.get_component::<Label>(e).unwrap().text.has_changes());

        let blob = m.storage().unwrap();
        assert_eq!(blob[e.to_string()]["Label"]["text"], "score: 0");

        let mut loaded = setup_manager();
        loaded.restore(&blob).unwrap();
        let label = loaded.get_component::<Label>(e).unwrap();
        assert_eq!(label.text.get(), "score: 0");
        assert!(label.text.has_changes(), "loaded values must be pushed again");
    }
}
