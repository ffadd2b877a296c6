//! The cascade triple: rates, compounds, derived
//!
//! Every cascade-worthy mutation funnels through [`run`]. Outside a batch
//! the triple executes inline; inside one it marks a dirty flag and the
//! whole batch flushes exactly once at [`end_batch`]. Batches nest (a
//! threshold sweep inside a tick), so depth is counted.

use ahash::AHashMap;

use crate::config::schema::{Connector, Logic, NodeKind, RelationType, Requirement};
use crate::config::store::ConfigStore;
use crate::engine::conditions::{evaluate, evaluate_list, entity_value, is_node_active};
use crate::engine::selection::relationship_value;
use crate::entity::Entity;
use crate::events::{EngineEvent, EventBus};

/// Batching state plus a run counter for observability
#[derive(Debug, Default)]
pub struct CascadeCtl {
    depth: u32,
    dirty: bool,
    pub runs: u64,
}

pub fn begin_batch(ctl: &mut CascadeCtl) {
    ctl.depth += 1;
}

/// Close a batch level; the outermost close flushes a dirty cascade once.
pub fn end_batch(cfg: &ConfigStore, entity: &mut Entity, ctl: &mut CascadeCtl, events: &mut EventBus) {
    debug_assert!(ctl.depth > 0, "end_batch without begin_batch");
    ctl.depth = ctl.depth.saturating_sub(1);
    if ctl.depth == 0 && ctl.dirty {
        ctl.dirty = false;
        ctl.runs += 1;
        cascade_now(cfg, entity, events);
    }
}

/// Request a cascade: deferred under a batch, immediate otherwise.
pub fn run(cfg: &ConfigStore, entity: &mut Entity, ctl: &mut CascadeCtl, events: &mut EventBus) {
    if ctl.depth > 0 {
        ctl.dirty = true;
    } else {
        ctl.runs += 1;
        cascade_now(cfg, entity, events);
    }
}

/// The triple, in order. Idempotent: a second run with no intervening
/// writes recomputes identical state.
pub fn cascade_now(cfg: &ConfigStore, entity: &mut Entity, events: &mut EventBus) {
    recalculate_rates(cfg, entity);
    check_compounds(cfg, entity, events);
    calculate_derived(cfg, entity);
}

/// Reset each variable's rate to base, then fold active, passing
/// `rate_modifier` relationships in document order.
pub fn recalculate_rates(cfg: &ConfigStore, entity: &mut Entity) {
    let ids: Vec<String> = entity.variables.keys().cloned().collect();
    for id in ids {
        let mut rate = entity.variables[&id].base_rate;
        for rel in cfg.influences_on(&id, RelationType::RateModifier) {
            if !is_node_active(cfg, entity, &rel.source_id) {
                continue;
            }
            if !evaluate_list(cfg, entity, &rel.conditions, Connector::And) {
                continue;
            }
            let value = relationship_value(cfg, entity, rel);
            rate = crate::engine::selection::apply_operation(rate, rel.config.operation, value);
        }
        if let Some(var) = entity.variables.get_mut(&id) {
            var.current_rate = rate;
        }
    }
}

/// Re-check every compound's requirements and reconcile membership,
/// emitting transition events.
pub fn check_compounds(cfg: &ConfigStore, entity: &mut Entity, events: &mut EventBus) {
    for compound_id in cfg.ids_of_kind(NodeKind::Compound).to_vec() {
        let met = requirements_met(cfg, entity, &compound_id);
        let current = entity.has_compound(&compound_id);
        if met && !current {
            entity.compounds.push(compound_id.clone());
            entity.log.push(entity.last_tick, "compoundActivated", compound_id.as_str());
            events.emit(&EngineEvent::CompoundActivated { entity: entity.id, compound: compound_id });
        } else if !met && current {
            entity.compounds.retain(|c| c != &compound_id);
            entity.log.push(entity.last_tick, "compoundDeactivated", compound_id.as_str());
            events.emit(&EngineEvent::CompoundDeactivated { entity: entity.id, compound: compound_id });
        }
    }
}

pub fn requirements_met(cfg: &ConfigStore, entity: &Entity, compound_id: &str) -> bool {
    let Some(def) = cfg.compound(compound_id) else {
        return false;
    };
    let check = |req: &Requirement| -> bool {
        match req {
            Requirement::Active(id) | Requirement::Ref { id } => is_node_active(cfg, entity, id),
            Requirement::Threshold { id, operator, value } => entity_value(entity, id)
                .map(|left| operator.compare(left, *value))
                .unwrap_or(false),
            Requirement::Nested { condition } => evaluate(cfg, entity, condition),
        }
    };
    match def.requirement_logic {
        Logic::All => def.requires.iter().all(check),
        Logic::Any => def.requires.iter().any(check),
    }
}

/// Evaluate every derived formula against attributes, variable values, and
/// numeric contexts. Results clamp to the node's bounds; any evaluation
/// failure (or a non-finite result) writes `0`.
pub fn calculate_derived(cfg: &ConfigStore, entity: &mut Entity) {
    let derived_ids = cfg.ids_of_kind(NodeKind::Derived);
    if derived_ids.is_empty() {
        return;
    }

    let mut context: AHashMap<String, f64> = AHashMap::new();
    for (id, value) in &entity.attributes {
        context.insert(id.clone(), *value);
    }
    for (id, var) in &entity.variables {
        context.insert(id.clone(), var.value);
    }
    for (id, value) in &entity.contexts {
        if let Some(number) = value.as_f64() {
            context.insert(id.clone(), number);
        }
    }

    for id in derived_ids.to_vec() {
        let Some(def) = cfg.derived(&id) else {
            continue;
        };
        let result = cfg
            .formulas()
            .get(&def.formula)
            .map(|compiled| compiled.evaluate(&context));
        let value = match result {
            Some(Ok(v)) => {
                let clamped = v.clamp(def.min, def.max);
                if clamped.is_finite() {
                    clamped
                } else {
                    0.0
                }
            }
            Some(Err(e)) => {
                tracing::warn!(target: "vivarium::cascade", derived = %id, "formula failed: {e}");
                0.0
            }
            None => 0.0,
        };
        entity.derived.insert(id, value);
    }
}
