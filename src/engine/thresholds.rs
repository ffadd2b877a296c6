//! Threshold arbiter
//!
//! Drives state that is not randomly selected: threshold traits bound to a
//! variable, and static (threshold-triggered) modifiers. Mutual-exclusion
//! classes resolve to at most one winner; when several members qualify the
//! most specific predicate wins.

use crate::config::schema::{Operator, Trigger};
use crate::config::store::ConfigStore;
use crate::core::types::Millis;
use crate::engine::activation::{activate_trait, deactivate_trait};
use crate::engine::cascade::{self, CascadeCtl};
use crate::engine::conditions::evaluate_with_logic;
use crate::engine::modifiers;
use crate::entity::Entity;
use crate::events::EventBus;

fn trigger_passes(cfg: &ConfigStore, entity: &Entity, trigger: &Trigger) -> bool {
    evaluate_with_logic(cfg, entity, &trigger.conditions, trigger.logic)
}

/// Removal check: explicit `removeConditions` when present, otherwise the
/// inverse of the trigger.
fn removal_passes(cfg: &ConfigStore, entity: &Entity, trigger: &Trigger) -> bool {
    if trigger.remove_conditions.is_empty() {
        !trigger_passes(cfg, entity, trigger)
    } else {
        evaluate_with_logic(cfg, entity, &trigger.remove_conditions, trigger.remove_logic)
    }
}

/// Re-check threshold traits watching one variable: activate on trigger,
/// deactivate on autoRemove.
pub fn check_variable_thresholds(
    cfg: &ConfigStore,
    entity: &mut Entity,
    variable_id: &str,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) {
    for trait_id in cfg.threshold_traits_for(variable_id).to_vec() {
        let Some(def) = cfg.trait_def(&trait_id) else {
            continue;
        };
        let active = entity.has_trait(&trait_id);
        if !active {
            if let Some(trigger) = &def.selection.trigger {
                if trigger_passes(cfg, entity, trigger) && activate_trait(cfg, entity, &trait_id, events) {
                    cascade::run(cfg, entity, ctl, events);
                }
            }
        } else if let Some(auto_remove) = &def.selection.auto_remove {
            if trigger_passes(cfg, entity, auto_remove) && deactivate_trait(cfg, entity, &trait_id, events) {
                cascade::run(cfg, entity, ctl, events);
            }
        }
    }
}

/// Entity-wide static modifier sweep: resolve exclusive groups, then apply
/// or remove every threshold modifier. Runs under one batched cascade.
pub fn check_modifier_thresholds(
    cfg: &ConfigStore,
    entity: &mut Entity,
    now: Millis,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) {
    cascade::begin_batch(ctl);

    let verdicts = resolve_exclusive_groups(cfg, entity);

    for modifier_id in cfg.threshold_modifiers().to_vec() {
        let active = entity.has_modifier(&modifier_id);

        if let Some(&wins) = verdicts.iter().find(|(id, _)| id == &modifier_id).map(|(_, w)| w) {
            if wins && !active {
                modifiers::apply(cfg, entity, &modifier_id, None, now, true, ctl, events);
            } else if !wins && active {
                modifiers::remove(cfg, entity, &modifier_id, ctl, events);
            }
            continue;
        }

        let Some(def) = cfg.modifier(&modifier_id) else {
            continue;
        };
        let Some(trigger) = &def.trigger else {
            continue;
        };
        if !active {
            if trigger_passes(cfg, entity, trigger) {
                modifiers::apply(cfg, entity, &modifier_id, None, now, true, ctl, events);
            }
        } else {
            let is_static = entity
                .modifier_states
                .get(&modifier_id)
                .map(|s| s.is_static)
                .unwrap_or(false);
            if is_static && removal_passes(cfg, entity, trigger) {
                modifiers::remove(cfg, entity, &modifier_id, ctl, events);
            }
        }
    }

    cascade::end_batch(cfg, entity, ctl, events);
}

/// Verdicts for every threshold modifier belonging to an exclusion class:
/// zero qualifiers lose everywhere, one qualifier wins, several go to the
/// most specific.
fn resolve_exclusive_groups(cfg: &ConfigStore, entity: &Entity) -> Vec<(String, bool)> {
    let mut verdicts: Vec<(String, bool)> = Vec::new();
    let mut resolved: Vec<&str> = Vec::new();

    for modifier_id in cfg.threshold_modifiers() {
        if resolved.contains(&modifier_id.as_str()) {
            continue;
        }
        let Some(group) = cfg.exclusive_group(modifier_id) else {
            continue;
        };
        // Class members in declaration order, threshold-triggered only
        let members: Vec<&String> = cfg
            .threshold_modifiers()
            .iter()
            .filter(|m| group.contains(*m))
            .collect();

        let qualifying: Vec<&String> = members
            .iter()
            .copied()
            .filter(|m| {
                cfg.modifier(m)
                    .and_then(|def| def.trigger.as_ref())
                    .map(|t| trigger_passes(cfg, entity, t))
                    .unwrap_or(false)
            })
            .collect();

        let winner: Option<&String> = match qualifying.len() {
            0 => None,
            1 => Some(qualifying[0]),
            _ => Some(most_specific(cfg, &qualifying)),
        };

        for member in members {
            verdicts.push((member.clone(), Some(member) == winner));
            resolved.push(member.as_str());
        }
    }
    verdicts
}

/// Among qualifying candidates whose triggers are single-leaf predicates on
/// one shared variable: `<`/`<=` family picks the lowest threshold,
/// `>`/`>=` the highest. Anything else falls back to declaration order.
fn most_specific<'a>(cfg: &ConfigStore, candidates: &[&'a String]) -> &'a String {
    let mut leaves = Vec::with_capacity(candidates.len());
    for id in candidates {
        let Some(trigger) = cfg.modifier(id).and_then(|d| d.trigger.as_ref()) else {
            return candidates[0];
        };
        if trigger.conditions.len() != 1 {
            return candidates[0];
        }
        let leaf = &trigger.conditions[0];
        let (Some(target), Some(op), Some(value)) = (
            leaf.target.as_deref(),
            leaf.operator,
            leaf.value.as_ref().and_then(serde_json::Value::as_f64),
        ) else {
            return candidates[0];
        };
        leaves.push((*id, target, op, value));
    }

    let target = leaves[0].1;
    if !leaves.iter().all(|(_, t, _, _)| *t == target) {
        return candidates[0];
    }

    if leaves.iter().all(|(_, _, op, _)| matches!(op, Operator::Lt | Operator::Lte)) {
        return leaves
            .iter()
            .min_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _, _, _)| *id)
            .unwrap_or(candidates[0]);
    }
    if leaves.iter().all(|(_, _, op, _)| matches!(op, Operator::Gt | Operator::Gte)) {
        return leaves
            .iter()
            .max_by(|a, b| a.3.partial_cmp(&b.3).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(id, _, _, _)| *id)
            .unwrap_or(candidates[0]);
    }
    candidates[0]
}
