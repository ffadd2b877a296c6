//! Entity storage: stored/active partitions, named groups, history ring
//!
//! The store owns every live entity. `stored` and `active` are disjoint
//! views: activating an entity moves it into the tick set, deactivating
//! moves it back. Groups and history hold ids and snapshots respectively;
//! removing an entity scrubs all three.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::core::types::{EntityId, Millis};
use crate::entity::{Entity, LayerState, VarState};

/// Result of a store attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored,
    /// `max_entities` reached; the entity was rejected
    LimitReached,
}

/// Deep-cloned restorable state; variable rates are recomputed on restore,
/// not trusted from the snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: Millis,
    pub attributes: AHashMap<String, f64>,
    pub variables: AHashMap<String, VarState>,
    pub contexts: AHashMap<String, Value>,
    pub layers: AHashMap<String, LayerState>,
    pub modifiers: Vec<String>,
    pub compounds: Vec<String>,
    pub derived: AHashMap<String, f64>,
}

pub struct EntityStore {
    entities: AHashMap<EntityId, Entity>,
    stored: Vec<EntityId>,
    active: Vec<EntityId>,
    groups: AHashMap<String, Vec<EntityId>>,
    history: AHashMap<EntityId, VecDeque<Snapshot>>,
    pub max_entities: usize,
    pub max_history: usize,
}

impl EntityStore {
    pub fn new(max_entities: usize, max_history: usize) -> Self {
        Self {
            entities: AHashMap::new(),
            stored: Vec::new(),
            active: Vec::new(),
            groups: AHashMap::new(),
            history: AHashMap::new(),
            max_entities,
            max_history,
        }
    }

    // ------------------------------------------------------------------
    // Partitions
    // ------------------------------------------------------------------

    pub fn store(&mut self, entity: Entity) -> (EntityId, StoreOutcome) {
        let id = entity.id;
        if self.stored.len() >= self.max_entities {
            return (id, StoreOutcome::LimitReached);
        }
        self.stored.push(id);
        let group = format!("config:{}", entity.config_id);
        self.groups.entry(group).or_default().push(id);
        self.entities.insert(id, entity);
        (id, StoreOutcome::Stored)
    }

    pub fn activate(&mut self, id: EntityId) -> bool {
        if !self.entities.contains_key(&id) || self.active.contains(&id) {
            return false;
        }
        self.stored.retain(|&e| e != id);
        self.active.push(id);
        true
    }

    pub fn deactivate(&mut self, id: EntityId) -> bool {
        let Some(pos) = self.active.iter().position(|&e| e == id) else {
            return false;
        };
        self.active.remove(pos);
        self.stored.push(id);
        true
    }

    /// Drop the entity from every view, group, and its history.
    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        let entity = self.entities.remove(&id)?;
        self.stored.retain(|&e| e != id);
        self.active.retain(|&e| e != id);
        self.history.remove(&id);
        for members in self.groups.values_mut() {
            members.retain(|&e| e != id);
        }
        Some(entity)
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn is_active(&self, id: EntityId) -> bool {
        self.active.contains(&id)
    }

    pub fn stored_ids(&self) -> &[EntityId] {
        &self.stored
    }

    pub fn active_ids(&self) -> &[EntityId] {
        &self.active
    }

    /// Every entity in either partition
    pub fn all_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.stored.iter().chain(self.active.iter()).copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_group(&mut self, name: &str) -> bool {
        if self.groups.contains_key(name) {
            return false;
        }
        self.groups.insert(name.to_string(), Vec::new());
        true
    }

    pub fn add_to_group(&mut self, name: &str, id: EntityId) -> bool {
        if !self.entities.contains_key(&id) {
            return false;
        }
        let members = self.groups.entry(name.to_string()).or_default();
        if members.contains(&id) {
            return false;
        }
        members.push(id);
        true
    }

    pub fn remove_from_group(&mut self, name: &str, id: EntityId) -> bool {
        let Some(members) = self.groups.get_mut(name) else {
            return false;
        };
        let before = members.len();
        members.retain(|&e| e != id);
        members.len() != before
    }

    pub fn group(&self, name: &str) -> Option<&[EntityId]> {
        self.groups.get(name).map(Vec::as_slice)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    pub fn delete_group(&mut self, name: &str) -> bool {
        self.groups.remove(name).is_some()
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    pub fn snapshot(&mut self, id: EntityId, timestamp: Millis) -> bool {
        let Some(entity) = self.entities.get(&id) else {
            return false;
        };
        let snap = Snapshot {
            timestamp,
            attributes: entity.attributes.clone(),
            variables: entity.variables.clone(),
            contexts: entity.contexts.clone(),
            layers: entity.layers.clone(),
            modifiers: entity.modifiers.clone(),
            compounds: entity.compounds.clone(),
            derived: entity.derived.clone(),
        };
        let ring = self.history.entry(id).or_default();
        if ring.len() == self.max_history {
            ring.pop_front();
        }
        ring.push_back(snap);
        true
    }

    /// Restore the newest snapshot taken at or before `timestamp`.
    /// Modifier states for restored modifier ids are kept if present.
    pub fn rollback(&mut self, id: EntityId, timestamp: Millis) -> bool {
        let Some(ring) = self.history.get(&id) else {
            return false;
        };
        let Some(snap) = ring.iter().rev().find(|s| s.timestamp <= timestamp).cloned() else {
            return false;
        };
        let Some(entity) = self.entities.get_mut(&id) else {
            return false;
        };
        entity.attributes = snap.attributes;
        entity.variables = snap.variables;
        entity.contexts = snap.contexts;
        entity.layers = snap.layers;
        entity.modifier_states.retain(|m, _| snap.modifiers.contains(m));
        entity.modifiers = snap.modifiers;
        entity.compounds = snap.compounds;
        entity.derived = snap.derived;
        true
    }

    /// Snapshots oldest-first
    pub fn history(&self, id: EntityId) -> impl Iterator<Item = &Snapshot> {
        self.history.get(&id).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity() -> Entity {
        Entity::new("cfg", 0)
    }

    #[test]
    fn test_store_and_partitions() {
        let mut store = EntityStore::new(10, 50);
        let (id, outcome) = store.store(entity());
        assert_eq!(outcome, StoreOutcome::Stored);
        assert_eq!(store.stored_ids(), [id]);
        assert!(store.active_ids().is_empty());

        assert!(store.activate(id));
        assert!(store.stored_ids().is_empty());
        assert_eq!(store.active_ids(), [id]);
        assert!(store.is_active(id));

        assert!(store.deactivate(id));
        assert_eq!(store.stored_ids(), [id]);
    }

    #[test]
    fn test_capacity_limit() {
        let mut store = EntityStore::new(1, 50);
        store.store(entity());
        let (_, outcome) = store.store(entity());
        assert_eq!(outcome, StoreOutcome::LimitReached);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_config_group_is_synthetic() {
        let mut store = EntityStore::new(10, 50);
        let (id, _) = store.store(entity());
        assert_eq!(store.group("config:cfg"), Some(&[id][..]));
    }

    #[test]
    fn test_remove_scrubs_groups_and_history() {
        let mut store = EntityStore::new(10, 50);
        let (id, _) = store.store(entity());
        store.create_group("squad");
        store.add_to_group("squad", id);
        store.snapshot(id, 5);

        assert!(store.remove(id).is_some());
        assert!(store.group("squad").unwrap().is_empty());
        assert_eq!(store.history(id).count(), 0);
        assert!(!store.contains(id));
    }

    #[test]
    fn test_history_ring_caps() {
        let mut store = EntityStore::new(10, 3);
        let (id, _) = store.store(entity());
        for t in 0..5 {
            store.snapshot(id, t);
        }
        let timestamps: Vec<_> = store.history(id).map(|s| s.timestamp).collect();
        assert_eq!(timestamps, [2, 3, 4]);
    }

    #[test]
    fn test_rollback_picks_newest_at_or_before() {
        let mut store = EntityStore::new(10, 50);
        let (id, _) = store.store(entity());
        store.get_mut(id).unwrap().attributes.insert("str".into(), 10.0);
        store.snapshot(id, 100);
        store.get_mut(id).unwrap().attributes.insert("str".into(), 20.0);
        store.snapshot(id, 200);
        store.get_mut(id).unwrap().attributes.insert("str".into(), 30.0);

        assert!(store.rollback(id, 150));
        assert_eq!(store.get(id).unwrap().attributes["str"], 10.0);

        assert!(!store.rollback(id, 50), "no snapshot at or before 50");
    }
}
