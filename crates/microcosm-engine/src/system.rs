//! The unit of per-frame behavior.
//!
//! A [`System`] is owned by exactly one game state and runs in the position it
//! was given when the state was built. Each lifecycle hook receives a
//! [`SystemContext`] with mutable access to the state's entities, physics
//! world, scene, and collision router.

use microcosm_ecs::manager::EntityManager;

use crate::collision::CollisionRouter;
use crate::game_state::Scene;
use crate::physics::PhysicsWorld;

/// Everything a system may touch while its game state is running.
pub struct SystemContext<'a> {
    /// Name of the owning game state.
    pub state_name: &'a str,
    pub entities: &'a mut EntityManager,
    pub physics: &'a mut PhysicsWorld,
    pub scene: &'a mut Scene,
    pub collisions: &'a mut CollisionRouter,
    pub(crate) active: &'a mut bool,
}

impl SystemContext<'_> {
    /// Enable or disable the running system. An inactive system is skipped by
    /// `update` but keeps its state and filter bindings.
    pub fn set_active(&mut self, active: bool) {
        *self.active = active;
    }

    pub fn is_active(&self) -> bool {
        *self.active
    }
}

/// A polymorphic unit of behavior with an init/update/shutdown lifecycle.
///
/// Only [`name`](System::name) and [`update`](System::update) are required.
/// Errors returned from `init` or `update` propagate out of the game state
/// unchanged apart from added context.
pub trait System {
    /// Name used in logs, error context, and
    /// [`GameState::set_system_active`](crate::game_state::GameState::set_system_active).
    fn name(&self) -> &str;

    /// Called once after the state has built its physics world and scene.
    fn init(&mut self, _ctx: &mut SystemContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn update(&mut self, ctx: &mut SystemContext<'_>, dt: f64) -> anyhow::Result<()>;

    fn shutdown(&mut self, _ctx: &mut SystemContext<'_>) {}

    /// The owning state became the current one.
    fn activate(&mut self, _scene: &mut Scene) {}

    /// The owning state stopped being the current one.
    fn deactivate(&mut self, _scene: &mut Scene) {}
}

impl std::fmt::Debug for dyn System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "System({})", self.name())
    }
}
