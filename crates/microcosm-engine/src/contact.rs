//! The contact-stream contract between a physics backend and collision routing.
//!
//! A physics backend exposes the contacts it found this frame as a mutable
//! slice of [`ContactManifold`]s through [`ContactSource`]. Each manifold
//! names its two bodies by an opaque [`BodyTag`], the per-body user data the
//! physics bridge wrote when it created the body. The collision system reads
//! the tags back into entity ids and clears each manifold once routed, so a
//! contact is only routed again if the backend reports it again.

use microcosm_ecs::entity::EntityId;

/// Opaque per-body user tag. `0` means the body was never tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BodyTag(pub u128);

impl BodyTag {
    pub const UNTAGGED: BodyTag = BodyTag(0);

    pub fn for_entity(entity: EntityId) -> Self {
        Self(entity.to_user_data())
    }

    /// The entity this tag was written for, if any.
    pub fn entity(self) -> Option<EntityId> {
        EntityId::from_user_data(self.0)
    }
}

/// One contact point, in each body's local frame.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ContactPoint {
    pub local_a: [f64; 2],
    pub local_b: [f64; 2],
    /// Signed separation; negative means penetration.
    pub distance: f64,
}

/// A persistent contact record between two bodies.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactManifold {
    pub body_a: BodyTag,
    pub body_b: BodyTag,
    pub points: Vec<ContactPoint>,
}

impl ContactManifold {
    pub fn new(body_a: BodyTag, body_b: BodyTag) -> Self {
        Self {
            body_a,
            body_b,
            points: Vec::new(),
        }
    }

    /// A manifold between two entities carrying a single touching point.
    pub fn between(a: EntityId, b: EntityId) -> Self {
        Self {
            body_a: BodyTag::for_entity(a),
            body_b: BodyTag::for_entity(b),
            points: vec![ContactPoint::default()],
        }
    }

    pub fn with_point(mut self, point: ContactPoint) -> Self {
        self.points.push(point);
        self
    }

    /// Consume the manifold's contacts.
    pub fn clear(&mut self) {
        self.points.clear();
    }

    /// An empty manifold has been consumed (or never touched) and is not
    /// routed.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Anything that can hand the collision system this frame's manifolds.
pub trait ContactSource {
    fn manifolds_mut(&mut self) -> &mut [ContactManifold];
}

/// An in-memory contact source, filled by hand or by an external feed.
#[derive(Debug, Clone, Default)]
pub struct ContactBuffer {
    manifolds: Vec<ContactManifold>,
}

impl ContactBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, manifold: ContactManifold) {
        self.manifolds.push(manifold);
    }

    pub fn manifolds(&self) -> &[ContactManifold] {
        &self.manifolds
    }

    /// Drop every manifold, consumed or not.
    pub fn reset(&mut self) {
        self.manifolds.clear();
    }

    pub fn len(&self) -> usize {
        self.manifolds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.manifolds.is_empty()
    }
}

impl ContactSource for ContactBuffer {
    fn manifolds_mut(&mut self) -> &mut [ContactManifold] {
        &mut self.manifolds
    }
}
