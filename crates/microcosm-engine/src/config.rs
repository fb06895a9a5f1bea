//! Engine and game-state configuration.
//!
//! Both structs deserialize from partial documents: every missing field takes
//! its default.

/// Settings applied when a game state builds its physics world and scene.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct GameStateConfig {
    /// Gravity vector of the physics world. Zero by default.
    pub gravity: [f64; 2],
    /// Ambient light of the scene, RGB in `[0, 1]`.
    pub ambient_light: [f32; 3],
}

impl Default for GameStateConfig {
    fn default() -> Self {
        Self {
            gravity: [0.0, 0.0],
            ambient_light: [0.5, 0.5, 0.5],
        }
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Seed of the engine RNG. `None` draws one from entropy.
    pub rng_seed: Option<u64>,
    /// Configuration shared by every game state the engine creates.
    pub state: GameStateConfig,
}
