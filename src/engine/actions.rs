//! Action availability, weighted selection, and execution
//!
//! Actions gate on cooldown, variable costs, condition requirements,
//! blocking nodes, and eligibility. Execution pays costs, starts the
//! cooldown, and hands the config's opaque `effects` payload back to the
//! caller; the engine never interprets effects itself.

use rand::Rng;
use serde_json::Value;

use crate::config::schema::{Connector, NodeKind, Operation, RelationType};
use crate::config::store::ConfigStore;
use crate::engine::cascade::{self, CascadeCtl};
use crate::engine::conditions::{evaluate, evaluate_list, is_node_active};
use crate::engine::selection::{relationship_value, weighted_index};
use crate::engine::thresholds;
use crate::entity::Entity;
use crate::events::{EngineEvent, EventBus};

pub struct ActionAvailability {
    pub available: bool,
    pub reason: Option<String>,
}

impl ActionAvailability {
    pub fn yes() -> Self {
        Self { available: true, reason: None }
    }

    pub fn no(reason: impl Into<String>) -> Self {
        Self { available: false, reason: Some(reason.into()) }
    }
}

#[derive(Debug, Clone)]
pub struct ActionOutcome {
    pub executed: bool,
    pub effects: Value,
    pub reason: Option<String>,
}

pub fn is_available(cfg: &ConfigStore, entity: &Entity, action_id: &str) -> ActionAvailability {
    let Some(def) = cfg.action(action_id) else {
        return ActionAvailability::no(format!("unknown action '{action_id}'"));
    };
    if entity
        .actions
        .get(action_id)
        .map(|a| a.cooldown_remaining > 0.0)
        .unwrap_or(false)
    {
        return ActionAvailability::no("on cooldown");
    }
    for (variable, cost) in &def.costs {
        let balance = entity.variable_value(variable).unwrap_or(0.0);
        if balance < *cost {
            return ActionAvailability::no(format!("insufficient {variable}"));
        }
    }
    if !evaluate_list(cfg, entity, &def.requirements, Connector::And) {
        return ActionAvailability::no("requirements not met");
    }
    for blocker in &def.blocked_by {
        if is_node_active(cfg, entity, blocker) {
            return ActionAvailability::no(format!("blocked by {blocker}"));
        }
    }
    if let Some(eligibility) = &def.eligibility {
        if !evaluate(cfg, entity, eligibility) {
            return ActionAvailability::no("not eligible");
        }
    }
    ActionAvailability::yes()
}

pub fn available_actions(cfg: &ConfigStore, entity: &Entity) -> Vec<String> {
    cfg.ids_of_kind(NodeKind::Action)
        .iter()
        .filter(|id| is_available(cfg, entity, id).available)
        .cloned()
        .collect()
}

/// Weighted draw over available actions: base weight plus active,
/// passing `weight_influence` relationships.
pub fn select_action(cfg: &ConfigStore, entity: &Entity, rng: &mut impl Rng) -> Option<String> {
    let available = available_actions(cfg, entity);
    let weights: Vec<f64> = available
        .iter()
        .map(|id| {
            let mut weight = cfg.action(id).map(|d| d.base_weight).unwrap_or(0.0);
            for rel in cfg.influences_on(id, RelationType::WeightInfluence) {
                if !is_node_active(cfg, entity, &rel.source_id) {
                    continue;
                }
                if !evaluate_list(cfg, entity, &rel.conditions, Connector::And) {
                    continue;
                }
                let value = relationship_value(cfg, entity, rel);
                weight = match rel.config.operation {
                    Operation::Add => weight + value,
                    Operation::Multiply => weight * value,
                    Operation::Set => value,
                };
            }
            weight.max(0.0)
        })
        .collect();
    weighted_index(rng, &weights).map(|i| available[i].clone())
}

/// Pay costs, start the cooldown, and return the action's effects.
pub fn execute(
    cfg: &ConfigStore,
    entity: &mut Entity,
    action_id: &str,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> ActionOutcome {
    let availability = is_available(cfg, entity, action_id);
    if !availability.available {
        return ActionOutcome { executed: false, effects: Value::Null, reason: availability.reason };
    }
    let def = cfg.action(action_id).expect("availability checked the definition");
    let costs: Vec<(String, f64)> = def.costs.iter().map(|(k, v)| (k.clone(), *v)).collect();
    let cooldown = def.cooldown;
    let effects = def.effects.clone();

    cascade::begin_batch(ctl);
    for (variable, cost) in costs {
        let Some(var) = entity.variables.get_mut(&variable) else {
            continue;
        };
        let old = var.value;
        let new = (old - cost).clamp(var.min, var.max);
        var.value = new;
        if new != old {
            thresholds::check_variable_thresholds(cfg, entity, &variable, ctl, events);
            events.emit(&EngineEvent::VariableChanged {
                entity: entity.id,
                variable,
                from: old,
                to: new,
            });
            cascade::run(cfg, entity, ctl, events);
        }
    }
    entity.actions.entry(action_id.to_string()).or_default().cooldown_remaining = cooldown;
    entity.log.push(entity.last_tick, "actionExecuted", action_id);
    cascade::end_batch(cfg, entity, ctl, events);

    ActionOutcome { executed: true, effects, reason: None }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ChangeMode, ConfigDocument, Direction};
    use crate::entity::VarState;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn store(json: &str) -> ConfigStore {
        ConfigStore::build(ConfigDocument::from_json_str(json).unwrap()).unwrap()
    }

    fn action_config() -> ConfigStore {
        store(
            r#"{"nodes":[
                {"id":"stamina","kind":"variable","min":0,"max":100,"initial":100},
                {"id":"sprint","kind":"action","cooldown":10,"costs":{"stamina":30},
                 "effects":{"speed":2.0}},
                {"id":"rest","kind":"action","baseWeight":5}
            ]}"#,
        )
    }

    fn entity_with_stamina(value: f64) -> Entity {
        let mut e = Entity::new("cfg", 0);
        e.variables.insert(
            "stamina".into(),
            VarState {
                value,
                base_rate: 0.0,
                current_rate: 0.0,
                min: 0.0,
                max: 100.0,
                change_mode: ChangeMode::Manual,
                direction: Direction::None,
            },
        );
        e
    }

    #[test]
    fn test_cost_gates_availability() {
        let cfg = action_config();
        let e = entity_with_stamina(20.0);
        let availability = is_available(&cfg, &e, "sprint");
        assert!(!availability.available);
        assert_eq!(availability.reason.as_deref(), Some("insufficient stamina"));
    }

    #[test]
    fn test_execute_pays_costs_and_sets_cooldown() {
        let cfg = action_config();
        let mut e = entity_with_stamina(100.0);
        let mut ctl = CascadeCtl::default();
        let mut events = EventBus::new();

        let outcome = execute(&cfg, &mut e, "sprint", &mut ctl, &mut events);
        assert!(outcome.executed);
        assert_eq!(outcome.effects["speed"], 2.0);
        assert_eq!(e.variables["stamina"].value, 70.0);
        assert_eq!(e.actions["sprint"].cooldown_remaining, 10.0);

        let again = execute(&cfg, &mut e, "sprint", &mut ctl, &mut events);
        assert!(!again.executed);
        assert_eq!(again.reason.as_deref(), Some("on cooldown"));
    }

    #[test]
    fn test_blocked_by_active_node() {
        let cfg = store(
            r#"{"nodes":[
                {"id":"stunned","kind":"modifier"},
                {"id":"strike","kind":"action","blockedBy":["stunned"]}
            ]}"#,
        );
        let mut e = Entity::new("cfg", 0);
        assert!(is_available(&cfg, &e, "strike").available);
        e.modifiers.push("stunned".into());
        assert!(!is_available(&cfg, &e, "strike").available);
    }

    #[test]
    fn test_select_action_draws_from_available() {
        let cfg = action_config();
        let e = entity_with_stamina(10.0);
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        // sprint is unaffordable, so every draw lands on rest
        for _ in 0..20 {
            assert_eq!(select_action(&cfg, &e, &mut rng).as_deref(), Some("rest"));
        }
    }

    #[test]
    fn test_unknown_action() {
        let cfg = action_config();
        let e = entity_with_stamina(10.0);
        assert!(!is_available(&cfg, &e, "fly").available);
    }
}
