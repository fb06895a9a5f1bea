//! Whole-manager save and restore.
//!
//! The persisted form of an [`EntityManager`] is a JSON object keyed by entity
//! id (`"<index>v<generation>"`), each mapping component `TYPE_NAME`s to that
//! component's serialized fields:
//!
//! ```json
//! { "0v0": { "Position": { "x": 1.0, "y": 2.0 }, "Health": 10 }, "3v1": {} }
//! ```
//!
//! Keys come out sorted, so the same state always produces the same bytes.
//! Unknown fields inside a component are ignored on load. An unknown component
//! name is an error, because dropping it would silently lose data.

use serde_json::{Map, Value};

use crate::entity::EntityId;
use crate::manager::EntityManager;
use crate::EcsError;

impl EntityManager {
    /// Serialize every live entity and its components.
    ///
    /// Queued removals are not applied first: an entity pending destruction
    /// is still saved.
    pub fn storage(&self) -> Result<Value, EcsError> {
        let mut entities = Map::new();
        for entity in self.entities() {
            let mut components = Map::new();
            for storage in self.storages() {
                if let Some(fields) = storage.to_json(entity) {
                    components.insert(storage.type_name().to_owned(), fields?);
                }
            }
            entities.insert(entity.to_string(), Value::Object(components));
        }
        Ok(Value::Object(entities))
    }

    /// Replace the manager's contents with the entities in `blob`.
    ///
    /// Entity ids are restored exactly. Slots that are not restored keep
    /// their generation, so entities removed by the restore are never handed
    /// out again. On any error the manager is left empty, never partially
    /// loaded, and the error is returned.
    pub fn restore(&mut self, blob: &Value) -> Result<(), EcsError> {
        self.clear();
        let result = self.restore_entities(blob);
        if result.is_err() {
            self.clear();
        }
        result
    }

    fn restore_entities(&mut self, blob: &Value) -> Result<(), EcsError> {
        let entries = blob.as_object().ok_or_else(|| EcsError::MalformedStorage {
            details: format!("entity storage must be an object, found {}", kind(blob)),
        })?;

        let mut parsed = Vec::with_capacity(entries.len());
        for (key, components) in entries {
            let entity: EntityId = key.parse().map_err(|e| EcsError::MalformedStorage {
                details: format!("{e}"),
            })?;
            let components = components
                .as_object()
                .ok_or_else(|| EcsError::MalformedStorage {
                    details: format!(
                        "components of entity {entity} must be an object, found {}",
                        kind(components)
                    ),
                })?;
            parsed.push((entity, components));
        }

        let ids: Vec<EntityId> = parsed.iter().map(|(entity, _)| *entity).collect();
        self.restore_allocator(&ids).map_err(|e| EcsError::MalformedStorage {
            details: e.to_string(),
        })?;

        for (entity, components) in &parsed {
            for (name, fields) in *components {
                let type_id = self
                    .registry()
                    .lookup_by_name(name)
                    .ok_or_else(|| self.registry().unknown(name))?;
                self.storages_mut()[type_id.index()].insert_json(*entity, fields)?;
            }
        }

        for entity in ids {
            self.refresh_filters(entity, None);
        }
        tracing::debug!(entities = parsed.len(), "restored entity storage");
        Ok(())
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::prelude::*;

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Position {
        x: f32,
        y: f32,
    }
    impl Component for Position {
        const TYPE_NAME: &'static str = "Position";
    }

    #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Health(u32);
    impl Component for Health {
        const TYPE_NAME: &'static str = "Health";
    }

    fn setup_manager() -> EntityManager {
        let mut registry = ComponentRegistry::new();
        registry.register::<Position>();
        registry.register::<Health>();
        EntityManager::new(Arc::new(registry))
    }

    #[test]
    fn storage_layout_is_keyed_by_id_and_type_name() {
        let mut m = setup_manager();
        let e = m.create_entity();
        m.add_component(e, Position { x: 1.0, y: 2.0 }).unwrap();
        m.add_component(e, Health(10)).unwrap();
        let bare = m.create_entity();

        let blob = m.storage().unwrap();
        assert_eq!(
            blob,
            json!({
                e.to_string(): { "Position": { "x": 1.0, "y": 2.0 }, "Health": 10 },
                bare.to_string(): {}
            })
        );
    }

    #[test]
    fn restore_reproduces_ids_and_values() {
        let mut m = setup_manager();
        let a = m.create_entity();
        let b = m.create_entity();
        m.add_component(a, Health(3)).unwrap();
        m.destroy_entity(a).unwrap();
        m.process_removals();
        let c = m.create_entity(); // recycles a's slot with generation 1
        m.add_component(c, Position { x: 5.0, y: 6.0 }).unwrap();
        m.add_component(b, Health(7)).unwrap();
        let blob = m.storage().unwrap();

        let mut loaded = setup_manager();
        loaded.restore(&blob).unwrap();
        assert_eq!(loaded.entities(), vec![c, b]);
        assert_eq!(loaded.get_component::<Position>(c), Some(&Position { x: 5.0, y: 6.0 }));
        assert_eq!(loaded.get_component::<Health>(b), Some(&Health(7)));
        assert!(!loaded.is_alive(a));
        assert_eq!(loaded.storage().unwrap(), blob);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let mut m = setup_manager();
        m.restore(&json!({ "0v0": { "Position": { "x": 1.0, "y": 1.0, "z": 9.0 } } }))
            .unwrap();
        let e = EntityId::new(0, 0);
        assert_eq!(m.get_component::<Position>(e), Some(&Position { x: 1.0, y: 1.0 }));
    }

    #[test]
    fn failed_restore_leaves_manager_empty() {
        let mut m = setup_manager();
        let keep = m.create_entity();
        m.add_component(keep, Health(1)).unwrap();

        let err = m
            .restore(&json!({
                "0v0": { "Health": 4 },
                "1v0": { "Shield": { "hp": 3 } }
            }))
            .unwrap_err();
        assert!(matches!(err, EcsError::UnknownComponent { ref name, .. } if name == "Shield"));
        assert_eq!(m.entity_count(), 0);
        assert_eq!(m.component_storage::<Health>().unwrap().len(), 0);
    }

    #[test]
    fn malformed_blobs_are_rejected() {
        let mut m = setup_manager();
        assert!(matches!(
            m.restore(&json!([1, 2])),
            Err(EcsError::MalformedStorage { .. })
        ));
        assert!(matches!(
            m.restore(&json!({ "not-an-id": {} })),
            Err(EcsError::MalformedStorage { .. })
        ));
        assert!(matches!(
            m.restore(&json!({ "0v0": 5 })),
            Err(EcsError::MalformedStorage { .. })
        ));
        assert!(matches!(
            m.restore(&json!({ "2v0": {}, "2v1": {} })),
            Err(EcsError::MalformedStorage { .. })
        ));
        assert!(matches!(
            m.restore(&json!({ "0v0": { "Health": "lots" } })),
            Err(EcsError::ComponentDeserializationError { .. })
        ));
        assert_eq!(m.entity_count(), 0);
    }

    #[test]
    fn restore_notifies_bound_filters() {
        let mut m = setup_manager();
        let mut f = EntityFilter::<(Health,)>::new(true);
        f.bind(&mut m).unwrap();
        let old = m.create_entity();
        m.add_component(old, Health(1)).unwrap();
        f.clear_changes(&mut m);

        m.restore(&json!({ "4v2": { "Health": 9 } })).unwrap();
        let restored = EntityId::new(4, 2);
        assert_eq!(f.entities(&m), vec![restored]);
        assert_eq!(f.removed_entities(&m), vec![old]);
        assert_eq!(f.added_entities(&m), vec![restored]);
    }

    #[test]
    fn ids_removed_by_restore_are_not_reused() {
        let mut m = setup_manager();
        let mut f = EntityFilter::<()>::new(true);
        f.bind(&mut m).unwrap();
        let _a = m.create_entity();
        let b = m.create_entity();
        f.clear_changes(&mut m);

        m.restore(&json!({ "0v0": {} })).unwrap();
        assert!(f.removed_entities(&m).contains(&b));

        let fresh = m.create_entity();
        assert_ne!(fresh, b);
        assert_eq!(fresh, EntityId::new(1, 1));
        assert!(!f.removed_entities(&m).contains(&fresh));
        assert!(f.added_entities(&m).contains(&fresh));
    }

    #[test]
    fn far_away_entity_index_is_malformed() {
        let mut m = setup_manager();
        let err = m.restore(&json!({ "4294967294v0": {} })).unwrap_err();
        assert!(matches!(
            err,
            EcsError::MalformedStorage { ref details } if details.contains("4294967294v0")
        ));
        assert_eq!(m.entity_count(), 0);
    }
}
