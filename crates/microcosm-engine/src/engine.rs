//! The engine: a set of named game states, one of which is current.
//!
//! The [`Engine`] owns the frozen component registry shared by all of its
//! states, the seeded [`RngManager`], and the savegame container. Only the
//! current state is updated; switching deactivates the previous state and
//! activates the new one without touching either state's data.
//!
//! # Example
//!
//! ```
//! use microcosm_engine::prelude::*;
//!
//! let config = EngineConfig { rng_seed: Some(7), ..Default::default() };
//! let mut engine = Engine::new(config, ComponentRegistry::new());
//! engine.add_game_state("level", vec![
//!     Box::new(PhysicsStepSystem::new()),
//!     Box::new(CollisionSystem::new()),
//! ]);
//! engine.set_current_game_state("level");
//! engine.init().unwrap();
//!
//! for _ in 0..3 {
//!     engine.update(1.0 / 60.0).unwrap();
//! }
//! assert_eq!(engine.frame_count(), 3);
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use microcosm_ecs::prelude::*;
use serde_json::{Map, Value};

use crate::collision::CollisionHandlerComponent;
use crate::config::EngineConfig;
use crate::game_state::{hash_value, GameState, GameStateError};
use crate::physics::{PhysicsBody, Position, Velocity};
use crate::rng::RngManager;
use crate::system::System;

/// Key of the game-state map inside a savegame.
const GAME_STATES_KEY: &str = "gameStates";

/// Errors raised by engine-level persistence.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("malformed savegame: {details}")]
    MalformedSavegame { details: String },

    #[error(transparent)]
    GameState(#[from] GameStateError),
}

/// Named game states plus the resources they share.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<ComponentRegistry>,
    states: BTreeMap<String, GameState>,
    current: Option<String>,
    rng: RngManager,
    frame_count: u64,
}

impl Engine {
    /// Freeze `registry` and build an engine with no game states.
    ///
    /// The engine's own components are registered if the caller has not
    /// already done so.
    pub fn new(config: EngineConfig, mut registry: ComponentRegistry) -> Self {
        register_builtin::<CollisionHandlerComponent>(&mut registry);
        register_builtin::<Position>(&mut registry);
        register_builtin::<Velocity>(&mut registry);
        register_builtin::<PhysicsBody>(&mut registry);

        let rng = match config.rng_seed {
            Some(seed) => RngManager::new(seed),
            None => RngManager::from_entropy(),
        };
        tracing::debug!(
            components = registry.len(),
            seed = rng.seed(),
            "engine created"
        );

        Self {
            config,
            registry: Arc::new(registry),
            states: BTreeMap::new(),
            current: None,
            rng,
            frame_count: 0,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn rng(&mut self) -> &mut RngManager {
        &mut self.rng
    }

    /// Number of frames the current state has completed.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    // -- game states --------------------------------------------------------

    /// Create a game state with the given systems, in update order.
    ///
    /// # Panics
    ///
    /// Panics if a state called `name` already exists.
    pub fn add_game_state(
        &mut self,
        name: impl Into<String>,
        systems: Vec<Box<dyn System>>,
    ) -> &mut GameState {
        let name = name.into();
        if self.states.contains_key(&name) {
            panic!("game state '{name}' already exists");
        }
        let state = GameState::new(
            name.clone(),
            Arc::clone(&self.registry),
            self.config.state.clone(),
            systems,
        );
        self.states.entry(name).or_insert(state)
    }

    pub fn game_state(&self, name: &str) -> Option<&GameState> {
        self.states.get(name)
    }

    pub fn game_state_mut(&mut self, name: &str) -> Option<&mut GameState> {
        self.states.get_mut(name)
    }

    /// State names in sorted order.
    pub fn game_state_names(&self) -> Vec<&str> {
        self.states.keys().map(String::as_str).collect()
    }

    /// Make `name` the state that [`update`](Self::update) drives.
    ///
    /// # Panics
    ///
    /// Panics if there is no state called `name`.
    pub fn set_current_game_state(&mut self, name: &str) {
        if !self.states.contains_key(name) {
            panic!("unknown game state '{name}'");
        }
        if self.current.as_deref() == Some(name) {
            return;
        }
        if let Some(previous) = self.current.take() {
            if let Some(state) = self.states.get_mut(&previous) {
                state.deactivate();
            }
        }
        if let Some(state) = self.states.get_mut(name) {
            if state.is_initialized() {
                state.activate();
            }
        }
        tracing::info!(state = name, "switched game state");
        self.current = Some(name.to_owned());
    }

    pub fn current_game_state_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn current_game_state(&self) -> Option<&GameState> {
        self.current.as_deref().and_then(|name| self.states.get(name))
    }

    pub fn current_game_state_mut(&mut self) -> Option<&mut GameState> {
        match self.current.as_deref() {
            Some(name) => self.states.get_mut(name),
            None => None,
        }
    }

    // -- lifecycle ----------------------------------------------------------

    /// Initialize every state not yet initialized, then activate the
    /// current one.
    pub fn init(&mut self) -> anyhow::Result<()> {
        for state in self.states.values_mut() {
            if !state.is_initialized() {
                state.init()?;
            }
        }
        if let Some(state) = self.current_game_state_mut() {
            state.activate();
        }
        Ok(())
    }

    /// Run one frame of the current state.
    pub fn update(&mut self, dt: f64) -> anyhow::Result<()> {
        let frame = self.frame_count;
        let Some(state) = self.current_game_state_mut() else {
            bail!("no current game state to update");
        };
        state
            .update(dt)
            .with_context(|| format!("frame {frame} failed"))?;
        self.frame_count += 1;
        Ok(())
    }

    /// Deactivate the current state and shut every state down.
    pub fn shutdown(&mut self) {
        if let Some(state) = self.current_game_state_mut() {
            state.deactivate();
        }
        for state in self.states.values_mut() {
            state.shutdown();
        }
    }

    // -- persistence --------------------------------------------------------

    /// `{"gameStates": {<name>: <state storage>, ...}}`.
    pub fn save_game(&self) -> Result<Value, EngineError> {
        let mut states = Map::new();
        for (name, state) in &self.states {
            states.insert(name.clone(), state.storage()?);
        }
        let mut root = Map::new();
        root.insert(GAME_STATES_KEY.to_owned(), Value::Object(states));
        Ok(Value::Object(root))
    }

    /// Load every state named in `savegame` and empty every state that is
    /// not. Names without a matching state are ignored.
    ///
    /// States are applied one at a time in name order, so a failed load is
    /// not atomic across states: the failing state is left empty, states
    /// before it already hold the saved contents, and states after it are
    /// untouched.
    pub fn load_game(&mut self, savegame: &Value) -> Result<(), EngineError> {
        let Value::Object(root) = savegame else {
            return Err(EngineError::MalformedSavegame {
                details: format!("expected an object, found {savegame}"),
            });
        };
        let empty = Map::new();
        let saved = match root.get(GAME_STATES_KEY) {
            None => &empty,
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(EngineError::MalformedSavegame {
                    details: format!("'{GAME_STATES_KEY}' must be an object, found {other}"),
                })
            }
        };

        for name in saved.keys() {
            if !self.states.contains_key(name) {
                tracing::warn!(state = %name, "savegame names an unknown game state");
            }
        }
        for (name, state) in &mut self.states {
            match saved.get(name) {
                Some(blob) => state.load(blob)?,
                None => state.entities_mut().clear(),
            }
        }
        tracing::info!(states = saved.len(), "savegame loaded");
        Ok(())
    }

    /// Hex blake3 digest of [`save_game`](Self::save_game).
    pub fn state_hash(&self) -> Result<String, EngineError> {
        Ok(hash_value(&self.save_game()?))
    }
}

fn register_builtin<T: Component>(registry: &mut ComponentRegistry) {
    if !registry.contains::<T>() {
        registry.register::<T>();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("states", &self.game_state_names())
            .field("current", &self.current)
            .field("frame_count", &self.frame_count)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::system::SystemContext;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Score(i64);
    impl Component for Score {
        const TYPE_NAME: &'static str = "Score";
    }

    struct Counter;

    impl System for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn update(&mut self, ctx: &mut SystemContext<'_>, _dt: f64) -> anyhow::Result<()> {
            for e in ctx.entities.entities() {
                if let Some(score) = ctx.entities.get_component_mut::<Score>(e) {
                    score.0 += 1;
                }
            }
            Ok(())
        }
    }

    fn engine() -> Engine {
        let mut registry = ComponentRegistry::new();
        registry.register::<Score>();
        let config = EngineConfig {
            rng_seed: Some(1),
            ..Default::default()
        };
        Engine::new(config, registry)
    }

    #[test]
    fn builtin_components_are_registered_once() {
        let mut registry = ComponentRegistry::new();
        registry.register::<Position>();
        let engine = Engine::new(EngineConfig::default(), registry);
        let names = engine.registry().registered_names();
        for name in ["Position", "Velocity", "PhysicsBody", "CollisionHandlerComponent"] {
            assert_eq!(names.iter().filter(|&&n| n == name).count(), 1, "{name}");
        }
    }

    #[test]
    #[should_panic(expected = "game state 'menu' already exists")]
    fn duplicate_state_name_panics() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![]);
        engine.add_game_state("menu", vec![]);
    }

    #[test]
    #[should_panic(expected = "unknown game state 'nowhere'")]
    fn unknown_current_state_panics() {
        engine().set_current_game_state("nowhere");
    }

    #[test]
    fn update_requires_a_current_state() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![]);
        engine.init().unwrap();
        assert!(engine.update(0.1).is_err());
        assert_eq!(engine.frame_count(), 0);
    }

    #[test]
    fn only_the_current_state_updates() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![Box::new(Counter)]);
        engine.add_game_state("level", vec![Box::new(Counter)]);
        let in_menu = {
            let menu = engine.game_state_mut("menu").unwrap();
            let e = menu.entities_mut().create_entity();
            menu.entities_mut().add_component(e, Score(0)).unwrap();
            e
        };
        let in_level = {
            let level = engine.game_state_mut("level").unwrap();
            let e = level.entities_mut().create_entity();
            level.entities_mut().add_component(e, Score(0)).unwrap();
            e
        };
        engine.set_current_game_state("level");
        engine.init().unwrap();
        engine.update(0.1).unwrap();
        engine.update(0.1).unwrap();

        let score = |engine: &Engine, state: &str, e| {
            engine
                .game_state(state)
                .unwrap()
                .entities()
                .get_component::<Score>(e)
                .cloned()
        };
        assert_eq!(score(&engine, "level", in_level), Some(Score(2)));
        assert_eq!(score(&engine, "menu", in_menu), Some(Score(0)));
        assert_eq!(engine.frame_count(), 2);
    }

    #[test]
    fn switching_states_toggles_scenes() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![]);
        engine.add_game_state("level", vec![]);
        engine.set_current_game_state("menu");
        engine.init().unwrap();

        let viewports = |engine: &Engine, name: &str| {
            engine
                .game_state(name)
                .and_then(GameState::scene)
                .map(|scene| scene.viewports_enabled())
        };
        assert_eq!(viewports(&engine, "menu"), Some(true));
        assert_eq!(viewports(&engine, "level"), Some(false));

        engine.set_current_game_state("level");
        assert_eq!(engine.current_game_state_name(), Some("level"));
        assert_eq!(viewports(&engine, "menu"), Some(false));
        assert_eq!(viewports(&engine, "level"), Some(true));

        engine.shutdown();
        assert!(engine.game_state("level").unwrap().scene().is_none());
    }

    #[test]
    fn save_and_load_round_trip() {
        let mut engine = engine();
        engine.add_game_state("level", vec![]);
        let level = engine.game_state_mut("level").unwrap();
        let e = level.entities_mut().create_entity();
        level.entities_mut().add_component(e, Score(9)).unwrap();
        level
            .entities_mut()
            .add_component(e, CollisionHandlerComponent::new().with_group("Player"))
            .unwrap();

        let save = engine.save_game().unwrap();
        assert_eq!(
            save,
            json!({ "gameStates": { "level": { "entities": { "0v0": {
                "Score": 9,
                "CollisionHandlerComponent": {
                    "collisionGroups": ["Player"],
                    "collisionCallbackKey": ""
                }
            } } } } })
        );
        let before = engine.state_hash().unwrap();

        engine.game_state_mut("level").unwrap().entities_mut().clear();
        assert_ne!(engine.state_hash().unwrap(), before);

        engine.load_game(&save).unwrap();
        assert_eq!(engine.state_hash().unwrap(), before);
        let level = engine.game_state("level").unwrap();
        assert_eq!(level.entities().get_component::<Score>(e), Some(&Score(9)));
    }

    #[test]
    fn load_empties_states_missing_from_the_savegame() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![]);
        engine.add_game_state("level", vec![]);
        for name in ["menu", "level"] {
            engine
                .game_state_mut(name)
                .unwrap()
                .entities_mut()
                .create_entity();
        }

        engine
            .load_game(&json!({ "gameStates": { "menu": { "entities": { "3v1": {} } } } }))
            .unwrap();
        let menu = engine.game_state("menu").unwrap();
        assert_eq!(menu.entities().entities(), vec![EntityId::new(3, 1)]);
        assert_eq!(engine.game_state("level").unwrap().entities().entity_count(), 0);

        engine.load_game(&json!({})).unwrap();
        assert_eq!(engine.game_state("menu").unwrap().entities().entity_count(), 0);
    }

    #[test]
    fn malformed_savegames_are_rejected() {
        let mut engine = engine();
        engine.add_game_state("menu", vec![]);
        assert!(matches!(
            engine.load_game(&json!([1, 2])),
            Err(EngineError::MalformedSavegame { .. })
        ));
        assert!(matches!(
            engine.load_game(&json!({ "gameStates": 3 })),
            Err(EngineError::MalformedSavegame { .. })
        ));
        assert!(matches!(
            engine.load_game(&json!({ "gameStates": { "menu": { "entities": { "x": {} } } } })),
            Err(EngineError::GameState(GameStateError::Load { .. }))
        ));
    }

    #[test]
    fn failed_load_stops_at_the_failing_state() {
        let mut engine = engine();
        let mut before = Vec::new();
        for name in ["a", "b", "c"] {
            engine.add_game_state(name, vec![]);
            let entities = engine.game_state_mut(name).unwrap().entities_mut();
            let e = entities.create_entity();
            entities.add_component(e, Score(1)).unwrap();
            before.push(e);
        }

        let err = engine
            .load_game(&json!({ "gameStates": {
                "a": { "entities": { "5v0": { "Score": 50 } } },
                "b": { "entities": { "0v0": { "Score": "oops" } } },
                "c": { "entities": {} }
            } }))
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::GameState(GameStateError::Load { ref state, .. }) if state == "b"
        ));

        let entities = |name: &str| engine.game_state(name).unwrap().entities();
        assert_eq!(entities("a").entities(), vec![EntityId::new(5, 0)]);
        assert_eq!(entities("b").entity_count(), 0);
        assert_eq!(entities("c").entities(), vec![before[2]]);
        assert_eq!(entities("c").get_component::<Score>(before[2]), Some(&Score(1)));
    }

    #[test]
    fn seeded_rng_is_reproducible() {
        let mut a = engine();
        let mut b = engine();
        assert_eq!(a.rng().seed(), 1);
        let xs: Vec<i64> = (0..8).map(|_| a.rng().rand_int(0, 100)).collect();
        let ys: Vec<i64> = (0..8).map(|_| b.rng().rand_int(0, 100)).collect();
        assert_eq!(xs, ys);
    }
}
