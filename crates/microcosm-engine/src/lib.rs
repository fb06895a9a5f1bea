//! Microcosm Engine -- game states, systems, and group-based collision routing.
//!
//! This crate builds on [`microcosm_ecs`] to provide the runtime around it:
//! [`GameState`](game_state::GameState)s that each own an entity manager, an
//! ordered list of [`System`](system::System)s, a rapier2d
//! [`PhysicsWorld`](physics::PhysicsWorld), and a
//! [`CollisionRouter`](collision::CollisionRouter); and an
//! [`Engine`](engine::Engine) that switches between named states and saves
//! them all into one savegame.
//!
//! # Quick Start
//!
//! ```
//! use microcosm_engine::prelude::*;
//!
//! let mut engine = Engine::new(EngineConfig::default(), ComponentRegistry::new());
//! let state = engine.add_game_state("level", vec![Box::new(CollisionSystem::new())]);
//!
//! let mut hits = CollisionFilter::registered("Player", "Enemy", state.collisions_mut());
//!
//! let entities = state.entities_mut();
//! let player = entities.create_entity();
//! entities
//!     .add_component(player, CollisionHandlerComponent::new().with_group("Player"))
//!     .unwrap();
//! let enemy = entities.create_entity();
//! entities
//!     .add_component(enemy, CollisionHandlerComponent::new().with_group("Enemy"))
//!     .unwrap();
//!
//! engine.set_current_game_state("level");
//! engine.init().unwrap();
//!
//! // Contacts normally come from the physics step.
//! let state = engine.current_game_state_mut().unwrap();
//! state
//!     .physics_mut()
//!     .unwrap()
//!     .report_manifold(ContactManifold::between(enemy, player));
//! engine.update(1.0 / 60.0).unwrap();
//!
//! assert!(hits.contains((player, enemy)));
//! hits.clear_collisions();
//! ```

#![deny(unsafe_code)]

pub mod collision;
pub mod config;
pub mod contact;
pub mod engine;
pub mod game_state;
pub mod physics;
pub mod rng;
pub mod system;

// ---------------------------------------------------------------------------
// Re-exports
// ---------------------------------------------------------------------------

/// Re-export the ECS crate for convenience.
pub use microcosm_ecs;

/// Install a `tracing` subscriber that prints to stderr.
///
/// The filter comes from `RUST_LOG` when set, else `default_filter`
/// (e.g. `"info"` or `"microcosm_engine=debug"`). Calling this again after a
/// subscriber is installed does nothing.
pub fn init_tracing(default_filter: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

// ---------------------------------------------------------------------------
// Prelude
// ---------------------------------------------------------------------------

/// Convenience re-exports for common engine usage.
pub mod prelude {
    // Re-export everything from the ECS prelude.
    pub use microcosm_ecs::prelude::*;

    pub use crate::config::{EngineConfig, GameStateConfig};
    pub use crate::engine::{Engine, EngineError};
    pub use crate::game_state::{GameState, GameStateError, Scene};
    pub use crate::rng::RngManager;
    pub use crate::system::{System, SystemContext};

    // Collision routing.
    pub use crate::collision::{
        route_contacts, Collision, CollisionCallback, CollisionError, CollisionFilter,
        CollisionHandlerComponent, CollisionRouter, CollisionSystem, RoutingReport,
        COLLISION_SYSTEM_NAME,
    };
    pub use crate::contact::{BodyTag, ContactBuffer, ContactManifold, ContactPoint, ContactSource};

    // Physics types.
    pub use crate::physics::{
        ColliderShape, PhysicsBody, PhysicsBodyType, PhysicsStepSystem, PhysicsWorld, Position,
        Velocity, PHYSICS_SYSTEM_NAME,
    };
}
