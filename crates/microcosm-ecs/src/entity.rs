//! Entity handles and id recycling.
//!
//! An [`EntityId`] packs a *generation* in the high 32 bits and a slot *index*
//! in the low 32 bits. Destroying an entity bumps the generation of its slot,
//! so a handle kept in a filter's change set or a collision pair can never be
//! mistaken for the entity that later reuses the slot.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// EntityId
// ---------------------------------------------------------------------------

/// A generation-tagged entity handle.
///
/// Layout: `[generation: u32 | index: u32]`. Handles order by index first and
/// generation second, which keeps iteration over live entities in slot order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityId(u64);

impl EntityId {
    /// Build a handle from a slot index and a generation.
    #[inline]
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    /// Slot index (low 32 bits).
    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }

    /// Generation (high 32 bits).
    #[inline]
    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[inline]
    pub fn to_raw(self) -> u64 {
        self.0
    }

    #[inline]
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Encode this handle as a physics body user tag.
    ///
    /// Tags are offset by one so that `0`, the default user data of a body
    /// nobody tagged, never decodes to an entity.
    #[inline]
    pub fn to_user_data(self) -> u128 {
        self.0 as u128 + 1
    }

    /// Decode a physics body user tag written by [`EntityId::to_user_data`].
    pub fn from_user_data(tag: u128) -> Option<Self> {
        if tag == 0 {
            return None;
        }
        u64::try_from(tag - 1).ok().map(Self)
    }
}

impl Ord for EntityId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.index(), self.generation()).cmp(&(other.index(), other.generation()))
    }
}

impl PartialOrd for EntityId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({}v{})", self.index(), self.generation())
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index(), self.generation())
    }
}

/// Error returned when a string is not a valid [`EntityId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid entity id '{0}': expected '<index>v<generation>' or '<index>'")]
pub struct ParseEntityIdError(String);

impl FromStr for EntityId {
    type Err = ParseEntityIdError;

    /// Parses the [`Display`](fmt::Display) form `"12v3"`. A bare index such
    /// as `"12"` is accepted as generation 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseEntityIdError(s.to_owned());
        match s.split_once('v') {
            Some((index, generation)) => {
                let index = index.parse::<u32>().map_err(|_| err())?;
                let generation = generation.parse::<u32>().map_err(|_| err())?;
                Ok(EntityId::new(index, generation))
            }
            None => s.parse::<u32>().map(|i| EntityId::new(i, 0)).map_err(|_| err()),
        }
    }
}

// ---------------------------------------------------------------------------
// EntityAllocator
// ---------------------------------------------------------------------------

/// Hands out [`EntityId`]s and recycles the slots of destroyed entities.
///
/// Freed slots go to the back of a FIFO queue so a single hot slot does not
/// burn through its generations.
#[derive(Debug, Default)]
pub struct EntityAllocator {
    generations: Vec<u32>,
    alive: Vec<bool>,
    free: VecDeque<u32>,
    live: usize,
}

impl EntityAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a handle, reusing the oldest free slot if there is one.
    ///
    /// # Panics
    ///
    /// Panics when all `u32::MAX` slots are in use.
    pub fn allocate(&mut self) -> EntityId {
        self.live += 1;
        if let Some(index) = self.free.pop_front() {
            self.alive[index as usize] = true;
            return EntityId::new(index, self.generations[index as usize]);
        }
        assert!(
            self.generations.len() < u32::MAX as usize,
            "entity id space exhausted"
        );
        let index = self.generations.len() as u32;
        self.generations.push(0);
        self.alive.push(true);
        EntityId::new(index, 0)
    }

    /// Release a live handle. The slot's generation is bumped so the handle
    /// goes stale immediately.
    ///
    /// Returns `false` if the handle was already stale.
    pub fn deallocate(&mut self, id: EntityId) -> bool {
        if !self.is_alive(id) {
            return false;
        }
        let idx = id.index() as usize;
        self.alive[idx] = false;
        self.generations[idx] = self.generations[idx].wrapping_add(1);
        self.free.push_back(id.index());
        self.live -= 1;
        true
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        let idx = id.index() as usize;
        idx < self.generations.len() && self.alive[idx] && self.generations[idx] == id.generation()
    }

    pub fn alive_count(&self) -> usize {
        self.live
    }

    /// All live handles in slot order.
    pub fn alive_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.alive
            .iter()
            .enumerate()
            .filter(|(_, alive)| **alive)
            .map(|(idx, _)| EntityId::new(idx as u32, self.generations[idx]))
    }

    /// Build the allocator that replaces this one after a restore, with
    /// exactly `ids` live.
    ///
    /// Restored handles keep their saved generation. Every other slot stays
    /// free at the generation this allocator already reached, so a handle
    /// this allocator released is never handed out again.
    ///
    /// A restored index may lie at most [`MAX_RESTORE_SLOT_GAP`] slots past
    /// both the restored entity count and this allocator's slot count.
    pub fn rebuilt_with_live(&self, ids: &[EntityId]) -> Result<Self, RestoreIdsError> {
        let limit = ids.len().max(self.generations.len()) + MAX_RESTORE_SLOT_GAP;
        if let Some(&entity) = ids.iter().find(|id| id.index() as usize >= limit) {
            return Err(RestoreIdsError::SlotOutOfRange { entity, limit });
        }

        let restored = ids.iter().map(|id| id.index() as usize + 1).max().unwrap_or(0);
        let slots = restored.max(self.generations.len());
        let mut generations = self.generations.clone();
        generations.resize(slots, 0);
        let mut alive = vec![false; slots];
        for &id in ids {
            let idx = id.index() as usize;
            if alive[idx] {
                return Err(RestoreIdsError::SharedSlot(id));
            }
            alive[idx] = true;
            generations[idx] = id.generation();
        }
        let free = (0..slots as u32).filter(|&i| !alive[i as usize]).collect();
        Ok(Self {
            generations,
            alive,
            free,
            live: ids.len(),
        })
    }
}

/// How far past the existing slots a restored entity index may reach.
pub const MAX_RESTORE_SLOT_GAP: usize = 1 << 20;

/// Why a set of saved handles cannot be made live.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RestoreIdsError {
    #[error("entity slot {} appears more than once", .0.index())]
    SharedSlot(EntityId),

    #[error("entity {entity} lies beyond the restorable slot range (limit {limit})")]
    SlotOutOfRange { entity: EntityId, limit: usize },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
