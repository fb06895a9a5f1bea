//! rapier2d physics integration.
//!
//! [`PhysicsWorld`] owns a rapier2d simulation and maps entities to rigid
//! bodies. Every collider it creates carries the owning entity's
//! [`BodyTag`] as rapier user data, so the contacts it reports can be routed
//! back to entities. After each [`step`](PhysicsWorld::step) the world exposes
//! that step's contacts as [`ContactManifold`]s through [`ContactSource`].
//!
//! [`PhysicsStepSystem`] is the bridge between the entity manager and the
//! world. It registers and unregisters bodies as entities gain and lose
//! physics components, steps the simulation, and writes dynamic bodies back.
//!
//! # Determinism
//!
//! rapier2d is compiled with `enhanced-determinism`. Manifolds and read-back
//! results are sorted by entity, so a fixed timestep gives the same contact
//! stream on every run.

use std::collections::HashMap;

use microcosm_ecs::prelude::*;
use rapier2d::prelude::*;

use crate::contact::{BodyTag, ContactManifold, ContactPoint, ContactSource};
use crate::system::{System, SystemContext};

/// Name of the [`PhysicsStepSystem`].
pub const PHYSICS_SYSTEM_NAME: &str = "physics";

// ---------------------------------------------------------------------------
// Physics component types
// ---------------------------------------------------------------------------

/// 2D position. Synced to and from the rigid body translation.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Component for Position {
    const TYPE_NAME: &'static str = "Position";
}

/// 2D linear velocity. Synced to and from the rigid body.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct Velocity {
    pub dx: f64,
    pub dy: f64,
}

impl Component for Velocity {
    const TYPE_NAME: &'static str = "Velocity";
}

/// How rapier treats a body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum PhysicsBodyType {
    /// Fully simulated.
    Dynamic,
    /// Moved by game logic through its velocity.
    Kinematic,
    /// Never moves.
    Static,
}

/// Collider shape.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ColliderShape {
    /// Axis-aligned box given by half-extents.
    Box { half_width: f64, half_height: f64 },
    Circle { radius: f64 },
}

/// Attach to an entity (together with a [`Position`]) to give it a body.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PhysicsBody {
    pub body_type: PhysicsBodyType,
    pub collider: ColliderShape,
    /// Coefficient of restitution. 0.0 = no bounce, 1.0 = perfect bounce.
    #[serde(default)]
    pub restitution: f64,
    /// Sensors report overlaps but never push other bodies.
    #[serde(default)]
    pub is_sensor: bool,
}

impl Component for PhysicsBody {
    const TYPE_NAME: &'static str = "PhysicsBody";
}

// ---------------------------------------------------------------------------
// PhysicsWorld
// ---------------------------------------------------------------------------

/// A rapier2d simulation plus the entity mapping of its bodies.
pub struct PhysicsWorld {
    pipeline: PhysicsPipeline,
    gravity: Vector<Real>,
    integration_params: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: DefaultBroadPhase,
    narrow_phase: NarrowPhase,
    rigid_body_set: RigidBodySet,
    collider_set: ColliderSet,
    impulse_joint_set: ImpulseJointSet,
    multibody_joint_set: MultibodyJointSet,
    ccd_solver: CCDSolver,
    entity_to_body: HashMap<EntityId, RigidBodyHandle>,
    /// Manifolds reported by the last step, plus any injected since.
    contacts: Vec<ContactManifold>,
}

impl PhysicsWorld {
    pub fn new(gravity_x: f64, gravity_y: f64) -> Self {
        Self {
            pipeline: PhysicsPipeline::new(),
            gravity: vector![gravity_x as Real, gravity_y as Real],
            integration_params: IntegrationParameters::default(),
            island_manager: IslandManager::new(),
            broad_phase: DefaultBroadPhase::new(),
            narrow_phase: NarrowPhase::new(),
            rigid_body_set: RigidBodySet::new(),
            collider_set: ColliderSet::new(),
            impulse_joint_set: ImpulseJointSet::new(),
            multibody_joint_set: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            entity_to_body: HashMap::new(),
            contacts: Vec::new(),
        }
    }

    pub fn new_zero_gravity() -> Self {
        Self::new(0.0, 0.0)
    }

    /// Create a rigid body and collider for `entity`.
    ///
    /// The collider is tagged with the entity so contacts can be routed back.
    /// Registering an entity twice is a no-op.
    pub fn register_entity(
        &mut self,
        entity: EntityId,
        position: &Position,
        velocity: &Velocity,
        body: &PhysicsBody,
    ) {
        if self.entity_to_body.contains_key(&entity) {
            return;
        }

        let translation = vector![position.x as Real, position.y as Real];
        let linvel = vector![velocity.dx as Real, velocity.dy as Real];
        let rb = match body.body_type {
            PhysicsBodyType::Dynamic => RigidBodyBuilder::dynamic().linvel(linvel),
            PhysicsBodyType::Kinematic => RigidBodyBuilder::kinematic_velocity_based().linvel(linvel),
            PhysicsBodyType::Static => RigidBodyBuilder::fixed(),
        }
        .translation(translation)
        .user_data(BodyTag::for_entity(entity).0)
        .build();
        let body_handle = self.rigid_body_set.insert(rb);
        self.entity_to_body.insert(entity, body_handle);

        let shape = match &body.collider {
            ColliderShape::Box {
                half_width,
                half_height,
            } => SharedShape::cuboid(*half_width as Real, *half_height as Real),
            ColliderShape::Circle { radius } => SharedShape::ball(*radius as Real),
        };
        let collider = ColliderBuilder::new(shape)
            .restitution(body.restitution as Real)
            .sensor(body.is_sensor)
            .user_data(BodyTag::for_entity(entity).0)
            .build();
        self.collider_set
            .insert_with_parent(collider, body_handle, &mut self.rigid_body_set);
    }

    /// Remove `entity`'s body and colliders. Unknown entities are ignored.
    pub fn unregister_entity(&mut self, entity: EntityId) {
        if let Some(body_handle) = self.entity_to_body.remove(&entity) {
            self.rigid_body_set.remove(
                body_handle,
                &mut self.island_manager,
                &mut self.collider_set,
                &mut self.impulse_joint_set,
                &mut self.multibody_joint_set,
                true,
            );
        }
    }

    /// Overwrite a registered body's translation and velocity from the ECS.
    pub fn sync_to_rapier(&mut self, entity: EntityId, position: &Position, velocity: &Velocity) {
        let Some(&body_handle) = self.entity_to_body.get(&entity) else {
            return;
        };
        if let Some(rb) = self.rigid_body_set.get_mut(body_handle) {
            rb.set_translation(vector![position.x as Real, position.y as Real], true);
            rb.set_linvel(vector![velocity.dx as Real, velocity.dy as Real], true);
        }
    }

    /// Advance the simulation by `dt` seconds.
    ///
    /// Replaces the contact list with one manifold per touching collider
    /// pair (and per overlapping sensor pair) found by this step.
    pub fn step(&mut self, dt: f64) {
        self.integration_params.dt = dt as Real;
        self.pipeline.step(
            &self.gravity,
            &self.integration_params,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.rigid_body_set,
            &mut self.collider_set,
            &mut self.impulse_joint_set,
            &mut self.multibody_joint_set,
            &mut self.ccd_solver,
            None,
            &(),
            &(),
        );
        self.collect_contacts();
    }

    fn collect_contacts(&mut self) {
        let tag = |handle: ColliderHandle| {
            self.collider_set
                .get(handle)
                .map_or(BodyTag::UNTAGGED, |c| BodyTag(c.user_data))
        };

        let mut contacts = Vec::new();
        for pair in self.narrow_phase.contact_pairs() {
            if !pair.has_any_active_contact {
                continue;
            }
            let mut manifold = ContactManifold::new(tag(pair.collider1), tag(pair.collider2));
            for m in &pair.manifolds {
                manifold.points.extend(m.points.iter().map(|p| ContactPoint {
                    local_a: [p.local_p1.x as f64, p.local_p1.y as f64],
                    local_b: [p.local_p2.x as f64, p.local_p2.y as f64],
                    distance: p.dist as f64,
                }));
            }
            if !manifold.is_empty() {
                contacts.push(manifold);
            }
        }
        for (h1, h2, intersecting) in self.narrow_phase.intersection_pairs() {
            if intersecting {
                contacts.push(
                    ContactManifold::new(tag(h1), tag(h2)).with_point(ContactPoint::default()),
                );
            }
        }

        contacts.sort_by_key(|m| {
            let (a, b) = (m.body_a.0, m.body_b.0);
            (a.min(b), a.max(b))
        });
        self.contacts = contacts;
    }

    /// Add a manifold computed outside rapier to the current contact list.
    ///
    /// Injected manifolds are routed by the next collision pass and
    /// discarded by the next [`step`](Self::step).
    pub fn report_manifold(&mut self, manifold: ContactManifold) {
        self.contacts.push(manifold);
    }

    /// Manifolds of the last step, including consumed (empty) ones.
    pub fn contacts(&self) -> &[ContactManifold] {
        &self.contacts
    }

    /// Positions and velocities of every dynamic body, sorted by entity.
    ///
    /// Static and kinematic bodies are driven by the ECS and are skipped.
    pub fn read_results(&self) -> Vec<(EntityId, Position, Velocity)> {
        let mut results: Vec<_> = self
            .entity_to_body
            .iter()
            .filter_map(|(&entity, &handle)| {
                let rb = self.rigid_body_set.get(handle)?;
                if !rb.is_dynamic() {
                    return None;
                }
                let t = rb.translation();
                let v = rb.linvel();
                Some((
                    entity,
                    Position {
                        x: t.x as f64,
                        y: t.y as f64,
                    },
                    Velocity {
                        dx: v.x as f64,
                        dy: v.y as f64,
                    },
                ))
            })
            .collect();
        results.sort_by_key(|(entity, _, _)| *entity);
        results
    }

    pub fn has_entity(&self, entity: EntityId) -> bool {
        self.entity_to_body.contains_key(&entity)
    }

    pub fn body_count(&self) -> usize {
        self.rigid_body_set.len()
    }
}

impl ContactSource for PhysicsWorld {
    fn manifolds_mut(&mut self) -> &mut [ContactManifold] {
        &mut self.contacts
    }
}

impl std::fmt::Debug for PhysicsWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicsWorld")
            .field("gravity", &(self.gravity.x, self.gravity.y))
            .field("bodies", &self.rigid_body_set.len())
            .field("contacts", &self.contacts.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// PhysicsStepSystem
// ---------------------------------------------------------------------------

/// Keeps the physics world in sync with the entity manager and steps it.
///
/// Entities with a [`Position`] and a [`PhysicsBody`] get a rigid body; a
/// missing [`Velocity`] counts as zero. Kinematic bodies are pushed from the
/// ECS before the step, dynamic bodies are written back after it.
pub struct PhysicsStepSystem {
    bodies: EntityFilter<(Position, PhysicsBody, Optional<Velocity>)>,
}

impl PhysicsStepSystem {
    pub fn new() -> Self {
        Self {
            bodies: EntityFilter::new(true),
        }
    }
}

impl Default for PhysicsStepSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl System for PhysicsStepSystem {
    fn name(&self) -> &str {
        PHYSICS_SYSTEM_NAME
    }

    fn init(&mut self, ctx: &mut SystemContext<'_>) -> anyhow::Result<()> {
        self.bodies.bind(ctx.entities)?;
        Ok(())
    }

    fn update(&mut self, ctx: &mut SystemContext<'_>, dt: f64) -> anyhow::Result<()> {
        for entity in self.bodies.removed_entities(ctx.entities) {
            ctx.physics.unregister_entity(entity);
        }
        for entity in self.bodies.added_entities(ctx.entities) {
            if let Some((pos, body, vel)) = self.bodies.get(ctx.entities, entity) {
                let vel = vel.cloned().unwrap_or_default();
                ctx.physics.register_entity(entity, pos, &vel, body);
            }
        }
        self.bodies.clear_changes(ctx.entities);

        for (entity, (pos, body, vel)) in self.bodies.iter(ctx.entities) {
            if body.body_type == PhysicsBodyType::Kinematic {
                ctx.physics
                    .sync_to_rapier(entity, pos, &vel.cloned().unwrap_or_default());
            }
        }

        ctx.physics.step(dt);

        for (entity, pos, vel) in ctx.physics.read_results() {
            if let Some(p) = ctx.entities.get_component_mut::<Position>(entity) {
                *p = pos;
            }
            if let Some(v) = ctx.entities.get_component_mut::<Velocity>(entity) {
                *v = vel;
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, ctx: &mut SystemContext<'_>) {
        self.bodies.unbind(ctx.entities);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn ball() -> PhysicsBody {
        PhysicsBody {
            body_type: PhysicsBodyType::Dynamic,
            collider: ColliderShape::Circle { radius: 0.5 },
            restitution: 1.0,
            is_sensor: false,
        }
    }

    fn wall() -> PhysicsBody {
        PhysicsBody {
            body_type: PhysicsBodyType::Static,
            collider: ColliderShape::Box {
                half_width: 0.5,
                half_height: 10.0,
            },
            restitution: 1.0,
            is_sensor: false,
        }
    }

    #[test]
    fn register_and_unregister() {
        let mut pw = PhysicsWorld::new_zero_gravity();
        let eid = EntityId::new(0, 0);
        pw.register_entity(eid, &Position::default(), &Velocity::default(), &ball());
        pw.register_entity(eid, &Position::default(), &Velocity::default(), &ball());
        assert!(pw.has_entity(eid));
        assert_eq!(pw.body_count(), 1);

        pw.unregister_entity(eid);
        pw.unregister_entity(EntityId::new(42, 0));
        assert!(!pw.has_entity(eid));
        assert_eq!(pw.body_count(), 0);
    }

    #[test]
    fn dynamic_body_moves_and_static_is_not_read_back() {
        let mut pw = PhysicsWorld::new_zero_gravity();
        let moving = EntityId::new(0, 0);
        let fixed = EntityId::new(1, 0);
        pw.register_entity(moving, &Position::default(), &Velocity { dx: 10.0, dy: 0.0 }, &ball());
        pw.register_entity(fixed, &Position { x: 50.0, y: 0.0 }, &Velocity::default(), &wall());

        pw.step(1.0 / 60.0);
        let results = pw.read_results();
        assert_eq!(results.len(), 1);
        let (entity, pos, _) = &results[0];
        assert_eq!(*entity, moving);
        assert!(pos.x > 0.0, "ball should move right, got x={}", pos.x);
    }

    #[test]
    fn gravity_pulls_dynamic_bodies() {
        let mut pw = PhysicsWorld::new(0.0, -9.81);
        let eid = EntityId::new(0, 0);
        pw.register_entity(eid, &Position::default(), &Velocity::default(), &ball());
        for _ in 0..10 {
            pw.step(1.0 / 60.0);
        }
        let (_, pos, vel) = &pw.read_results()[0];
        assert!(pos.y < 0.0);
        assert!(vel.dy < 0.0);
    }

    #[test]
    fn touching_bodies_report_tagged_manifold() {
        let mut pw = PhysicsWorld::new_zero_gravity();
        let b = EntityId::new(0, 0);
        let w = EntityId::new(1, 0);
        pw.register_entity(b, &Position::default(), &Velocity { dx: 100.0, dy: 0.0 }, &ball());
        pw.register_entity(w, &Position { x: 2.0, y: 0.0 }, &Velocity::default(), &wall());

        let mut seen = false;
        for _ in 0..120 {
            pw.step(1.0 / 60.0);
            seen |= pw.contacts().iter().any(|m| {
                let tags = [m.body_a.entity(), m.body_b.entity()];
                tags.contains(&Some(b)) && tags.contains(&Some(w)) && !m.is_empty()
            });
        }
        assert!(seen, "ball and wall should have produced a contact manifold");
    }

    #[test]
    fn step_replaces_injected_manifolds() {
        let mut pw = PhysicsWorld::new_zero_gravity();
        pw.report_manifold(ContactManifold::between(EntityId::new(0, 0), EntityId::new(1, 0)));
        assert_eq!(pw.manifolds_mut().len(), 1);
        pw.step(1.0 / 60.0);
        assert!(pw.contacts().is_empty());
    }

    #[test]
    fn components_use_persisted_names() {
        let body: PhysicsBody = serde_json::from_value(serde_json::json!({
            "body_type": "Static",
            "collider": { "Circle": { "radius": 1.0 } }
        }))
        .unwrap();
        assert_eq!(body.restitution, 0.0);
        assert!(!body.is_sensor);
        assert_eq!(PhysicsBody::TYPE_NAME, "PhysicsBody");
    }
}
