//! Seeded random numbers for gameplay code.
//!
//! Gameplay randomness goes through one [`RngManager`] per engine so that a
//! run can be replayed from its seed. The generator is PCG-64 (`rand_pcg`),
//! which yields the same sequence on every platform.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

/// A reseedable PCG-64 generator that remembers its seed.
#[derive(Debug, Clone)]
pub struct RngManager {
    seed: u64,
    rng: Pcg64,
}

impl RngManager {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: Pcg64::seed_from_u64(seed),
        }
    }

    /// Seed from operating-system entropy.
    pub fn from_entropy() -> Self {
        Self::new(rand::random())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Restart the sequence from `seed`.
    pub fn set_seed(&mut self, seed: u64) {
        *self = Self::new(seed);
    }

    /// Draw a fresh seed from entropy, reseed with it, and return it.
    pub fn generate_random_seed(&mut self) -> u64 {
        let seed = rand::random();
        self.set_seed(seed);
        seed
    }

    /// Uniform `f64` in `[0, 1)`.
    pub fn rand(&mut self) -> f64 {
        self.rng.gen()
    }

    /// Uniform `f64` between `min` and `max`. Returns `min` when the range is
    /// empty.
    pub fn rand_between(&mut self, min: f64, max: f64) -> f64 {
        if max <= min {
            return min;
        }
        self.rng.gen_range(min..max)
    }

    /// Uniform integer in `[min, max]`.
    ///
    /// # Panics
    ///
    /// Panics if `min > max`.
    pub fn rand_int(&mut self, min: i64, max: i64) -> i64 {
        assert!(min <= max, "empty integer range [{min}, {max}]");
        self.rng.gen_range(min..=max)
    }

    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        items.shuffle(&mut self.rng);
    }
}
