//! Entity state records
//!
//! An entity is a bag of per-node state generated from a configuration:
//! rolled attributes, drifting variables, layered traits, applied modifiers,
//! emergent compounds, computed derived values, and action cooldowns. All
//! evaluation is per-entity; nothing here references other entities.

pub mod store;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

use crate::config::schema::{ChangeMode, Direction};
use crate::core::types::{EntityId, Millis};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub config_id: String,
    pub created_at: Millis,
    pub preset_id: Option<String>,
    pub attributes: AHashMap<String, f64>,
    pub variables: AHashMap<String, VarState>,
    pub contexts: AHashMap<String, Value>,
    pub layers: AHashMap<String, LayerState>,
    /// Applied modifier ids, in application order
    pub modifiers: Vec<String>,
    pub modifier_states: AHashMap<String, ModState>,
    /// Currently-met compound ids, in activation order
    pub compounds: Vec<String>,
    pub derived: AHashMap<String, f64>,
    pub actions: AHashMap<String, ActionState>,
    pub pool_id: Option<String>,
    pub log: EntityLog,
    pub last_tick: Millis,
}

impl Entity {
    pub fn new(config_id: impl Into<String>, created_at: Millis) -> Self {
        Self {
            id: EntityId::new(),
            config_id: config_id.into(),
            created_at,
            preset_id: None,
            attributes: AHashMap::new(),
            variables: AHashMap::new(),
            contexts: AHashMap::new(),
            layers: AHashMap::new(),
            modifiers: Vec::new(),
            modifier_states: AHashMap::new(),
            compounds: Vec::new(),
            derived: AHashMap::new(),
            actions: AHashMap::new(),
            pool_id: None,
            log: EntityLog::default(),
            last_tick: created_at,
        }
    }

    pub fn has_modifier(&self, modifier_id: &str) -> bool {
        self.modifiers.iter().any(|m| m == modifier_id)
    }

    pub fn has_compound(&self, compound_id: &str) -> bool {
        self.compounds.iter().any(|c| c == compound_id)
    }

    /// Whether the trait is active in any layer
    pub fn has_trait(&self, trait_id: &str) -> bool {
        self.layers.values().any(|l| l.active.iter().any(|t| t == trait_id))
    }

    pub fn active_traits(&self) -> impl Iterator<Item = &str> {
        self.layers.values().flat_map(|l| l.active.iter().map(String::as_str))
    }

    pub fn variable_value(&self, variable_id: &str) -> Option<f64> {
        self.variables.get(variable_id).map(|v| v.value)
    }
}

/// Live numeric state of one variable
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VarState {
    pub value: f64,
    pub base_rate: f64,
    /// Effective rate after rate_modifier relationships; recomputed each cascade
    pub current_rate: f64,
    pub min: f64,
    pub max: f64,
    pub change_mode: ChangeMode,
    pub direction: Direction,
}

/// Bookkeeping for one applied modifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModState {
    pub applied_at: Millis,
    pub stacks: u32,
    /// Managed by the threshold arbiter; never expires on a timer
    pub is_static: bool,
    pub expires_at: Option<Millis>,
    pub ticks_remaining: Option<u32>,
}

/// Per-layer active trait list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LayerState {
    pub active: Vec<String>,
    pub last_roll: Option<Millis>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionState {
    /// Seconds until the action may run again
    pub cooldown_remaining: f64,
}

/// Bounded per-entity lifecycle log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: Millis,
    pub kind: String,
    pub detail: String,
}

impl Default for EntityLog {
    fn default() -> Self {
        Self { entries: VecDeque::new(), capacity: 100 }
    }
}

impl EntityLog {
    pub fn push(&mut self, at: Millis, kind: impl Into<String>, detail: impl Into<String>) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry { at, kind: kind.into(), detail: detail.into() });
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trait_lookup_across_layers() {
        let mut entity = Entity::new("cfg", 0);
        entity.layers.insert(
            "mood".into(),
            LayerState { active: vec!["grumpy".into()], last_roll: None },
        );
        entity.layers.insert("build".into(), LayerState::default());

        assert!(entity.has_trait("grumpy"));
        assert!(!entity.has_trait("cheerful"));
        assert_eq!(entity.active_traits().count(), 1);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut log = EntityLog::default();
        for i in 0..150 {
            log.push(i, "tick", "");
        }
        assert_eq!(log.len(), 100);
        assert_eq!(log.entries().next().unwrap().at, 50);
    }
}
