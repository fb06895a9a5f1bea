//! Game states: isolated bundles of entities, systems, physics, and scene.
//!
//! A [`GameState`] exclusively owns one entity manager, one collision router,
//! and an ordered list of systems fixed at construction. The physics world
//! and scene handle are created by [`init`](GameState::init). A frame is one
//! pass over the active systems in order, followed by exactly one
//! [`process_removals`](EntityManager::process_removals) flush.

use std::sync::Arc;

use anyhow::{bail, Context};
use microcosm_ecs::prelude::*;
use serde_json::{json, Value};

use crate::collision::CollisionRouter;
use crate::config::GameStateConfig;
use crate::physics::PhysicsWorld;
use crate::system::{System, SystemContext};

/// Errors raised while saving or loading a game state.
#[derive(Debug, thiserror::Error)]
pub enum GameStateError {
    #[error("failed to load game state '{state}'")]
    Load { state: String, source: EcsError },

    #[error("failed to save game state '{state}'")]
    Save { state: String, source: EcsError },
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

/// Handle to a game state's render scene.
///
/// Rendering is out of scope here; the handle only carries what the state
/// itself manages.
#[derive(Debug, Clone, PartialEq)]
pub struct Scene {
    name: String,
    pub ambient_light: [f32; 3],
    viewports_enabled: bool,
}

impl Scene {
    pub fn new(name: impl Into<String>, ambient_light: [f32; 3]) -> Self {
        Self {
            name: name.into(),
            ambient_light,
            viewports_enabled: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the state's viewports are currently shown.
    pub fn viewports_enabled(&self) -> bool {
        self.viewports_enabled
    }
}

// ---------------------------------------------------------------------------
// GameState
// ---------------------------------------------------------------------------

struct SystemEntry {
    system: Box<dyn System>,
    active: bool,
}

/// One switchable simulation: entities, systems, physics, and scene.
pub struct GameState {
    name: String,
    config: GameStateConfig,
    entities: EntityManager,
    collisions: CollisionRouter,
    physics: Option<PhysicsWorld>,
    scene: Option<Scene>,
    systems: Vec<SystemEntry>,
}

impl GameState {
    pub fn new(
        name: impl Into<String>,
        registry: Arc<ComponentRegistry>,
        config: GameStateConfig,
        systems: Vec<Box<dyn System>>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            entities: EntityManager::new(registry),
            collisions: CollisionRouter::new(),
            physics: None,
            scene: None,
            systems: systems
                .into_iter()
                .map(|system| SystemEntry {
                    system,
                    active: true,
                })
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_initialized(&self) -> bool {
        self.physics.is_some()
    }

    // -- lifecycle ----------------------------------------------------------

    /// Build the physics world and scene, then initialize every system in
    /// list order.
    pub fn init(&mut self) -> anyhow::Result<()> {
        if self.is_initialized() {
            bail!("game state '{}' is already initialized", self.name);
        }
        let [gx, gy] = self.config.gravity;
        self.physics = Some(PhysicsWorld::new(gx, gy));
        self.scene = Some(Scene::new(&self.name, self.config.ambient_light));

        self.run_systems(false, |system, ctx| system.init(ctx), "init")?;
        tracing::info!(
            state = %self.name,
            systems = self.systems.len(),
            "game state initialized"
        );
        Ok(())
    }

    /// Run one frame: every active system in order, then the removal flush.
    ///
    /// A failing system aborts the frame. Removals queued so far stay pending
    /// and are applied by the next frame that completes.
    pub fn update(&mut self, dt: f64) -> anyhow::Result<()> {
        if !self.is_initialized() {
            bail!("game state '{}' updated before init", self.name);
        }
        self.run_systems(true, |system, ctx| system.update(ctx, dt), "update")?;
        self.entities.process_removals();
        Ok(())
    }

    /// Shut every system down and drop the physics world and scene.
    pub fn shutdown(&mut self) {
        if !self.is_initialized() {
            return;
        }
        let _ = self.run_systems(
            false,
            |system, ctx| {
                system.shutdown(ctx);
                Ok(())
            },
            "shutdown",
        );
        self.physics = None;
        self.scene = None;
        tracing::info!(state = %self.name, "game state shut down");
    }

    /// Resume viewport-like side effects when this state becomes current.
    pub fn activate(&mut self) {
        let Some(scene) = self.scene.as_mut() else {
            tracing::warn!(state = %self.name, "activate called before init");
            return;
        };
        scene.viewports_enabled = true;
        for entry in &mut self.systems {
            entry.system.activate(scene);
        }
        tracing::debug!(state = %self.name, "game state activated");
    }

    /// Suspend viewport-like side effects. Systems keep all their state.
    pub fn deactivate(&mut self) {
        let Some(scene) = self.scene.as_mut() else {
            return;
        };
        scene.viewports_enabled = false;
        for entry in &mut self.systems {
            entry.system.deactivate(scene);
        }
        tracing::debug!(state = %self.name, "game state deactivated");
    }

    fn run_systems(
        &mut self,
        only_active: bool,
        mut hook: impl FnMut(&mut dyn System, &mut SystemContext<'_>) -> anyhow::Result<()>,
        stage: &str,
    ) -> anyhow::Result<()> {
        let (Some(physics), Some(scene)) = (self.physics.as_mut(), self.scene.as_mut()) else {
            bail!("game state '{}' has no physics world or scene", self.name);
        };
        for entry in &mut self.systems {
            if only_active && !entry.active {
                continue;
            }
            let mut ctx = SystemContext {
                state_name: &self.name,
                entities: &mut self.entities,
                physics: &mut *physics,
                scene: &mut *scene,
                collisions: &mut self.collisions,
                active: &mut entry.active,
            };
            hook(entry.system.as_mut(), &mut ctx).with_context(|| {
                format!(
                    "system '{}' failed in game state '{}' during {}",
                    entry.system.name(),
                    self.name,
                    stage
                )
            })?;
        }
        Ok(())
    }

    // -- systems ------------------------------------------------------------

    /// Names of the systems, in update order.
    pub fn system_names(&self) -> Vec<&str> {
        self.systems.iter().map(|e| e.system.name()).collect()
    }

    /// Enable or disable the system called `name`. Returns `false` if there
    /// is no such system.
    pub fn set_system_active(&mut self, name: &str, active: bool) -> bool {
        match self.systems.iter_mut().find(|e| e.system.name() == name) {
            Some(entry) => {
                entry.active = active;
                true
            }
            None => false,
        }
    }

    pub fn is_system_active(&self, name: &str) -> Option<bool> {
        self.systems
            .iter()
            .find(|e| e.system.name() == name)
            .map(|e| e.active)
    }

    // -- accessors ----------------------------------------------------------

    pub fn entities(&self) -> &EntityManager {
        &self.entities
    }

    pub fn entities_mut(&mut self) -> &mut EntityManager {
        &mut self.entities
    }

    pub fn collisions(&self) -> &CollisionRouter {
        &self.collisions
    }

    pub fn collisions_mut(&mut self) -> &mut CollisionRouter {
        &mut self.collisions
    }

    /// The physics world, once initialized.
    pub fn physics(&self) -> Option<&PhysicsWorld> {
        self.physics.as_ref()
    }

    pub fn physics_mut(&mut self) -> Option<&mut PhysicsWorld> {
        self.physics.as_mut()
    }

    /// The scene handle, once initialized.
    pub fn scene(&self) -> Option<&Scene> {
        self.scene.as_ref()
    }

    // -- persistence --------------------------------------------------------

    /// `{"entities": <entity storage>}`.
    pub fn storage(&self) -> Result<Value, GameStateError> {
        let entities = self.entities.storage().map_err(|source| {
            tracing::error!(state = %self.name, error = %source, "failed to save game state");
            GameStateError::Save {
                state: self.name.clone(),
                source,
            }
        })?;
        Ok(json!({ "entities": entities }))
    }

    /// Replace this state's entities with those in `blob`.
    ///
    /// A missing `"entities"` key loads an empty state. On failure the
    /// entity manager is left empty and the error is logged and returned.
    pub fn load(&mut self, blob: &Value) -> Result<(), GameStateError> {
        let result = match blob {
            Value::Object(map) => match map.get("entities") {
                Some(entities) => self.entities.restore(entities),
                None => {
                    self.entities.clear();
                    Ok(())
                }
            },
            other => {
                self.entities.clear();
                Err(EcsError::MalformedStorage {
                    details: format!("game state storage must be an object, found {other}"),
                })
            }
        };
        result.map_err(|source| {
            tracing::error!(state = %self.name, error = %source, "failed to load game state");
            GameStateError::Load {
                state: self.name.clone(),
                source,
            }
        })
    }

    /// Hex blake3 digest of this state's storage.
    pub fn state_hash(&self) -> Result<String, GameStateError> {
        Ok(hash_value(&self.storage()?))
    }
}

/// Hex blake3 digest of `value`'s compact JSON encoding.
pub(crate) fn hash_value(value: &Value) -> String {
    blake3::hash(value.to_string().as_bytes()).to_hex().to_string()
}

impl std::fmt::Debug for GameState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GameState")
            .field("name", &self.name)
            .field("systems", &self.system_names())
            .field("entities", &self.entities)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
