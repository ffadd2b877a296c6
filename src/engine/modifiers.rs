//! Modifier application, stacking, and removal
//!
//! Timed modifiers carry `expires_at` in host milliseconds; tick-counted
//! ones carry `ticks_remaining`. Static modifiers are owned by the
//! threshold arbiter and never expire on a timer. Applying a modifier
//! evicts active members of its mutual-exclusion class.

use crate::config::schema::{DurationType, Stacking};
use crate::config::store::ConfigStore;
use crate::core::types::Millis;
use crate::engine::cascade::{self, CascadeCtl};
use crate::entity::{Entity, ModState};
use crate::events::{EngineEvent, EventBus};

/// Optional per-application overrides
#[derive(Debug, Clone, Default)]
pub struct ApplyConfig {
    /// Override the configured duration (seconds or ticks)
    pub duration: Option<f64>,
}

pub fn apply(
    cfg: &ConfigStore,
    entity: &mut Entity,
    modifier_id: &str,
    overrides: Option<&ApplyConfig>,
    now: Millis,
    is_static: bool,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> bool {
    let Some(def) = cfg.modifier(modifier_id) else {
        return false;
    };
    let duration = overrides.and_then(|o| o.duration).unwrap_or(def.duration);

    if entity.has_modifier(modifier_id) {
        match def.stacking {
            Stacking::Refresh => {
                let timed = def.duration_type == DurationType::Timed;
                if let Some(state) = entity.modifier_states.get_mut(modifier_id) {
                    state.applied_at = now;
                    if timed && !state.is_static {
                        state.expires_at = Some(now + (duration * 1000.0) as Millis);
                    }
                }
                events.emit(&EngineEvent::ModifierApplied {
                    entity: entity.id,
                    modifier: modifier_id.to_string(),
                    stacks: entity.modifier_states[modifier_id].stacks,
                });
                cascade::run(cfg, entity, ctl, events);
                return true;
            }
            Stacking::Stack => {
                let max_stacks = def.max_stacks;
                let stacks = {
                    let state = entity.modifier_states.get_mut(modifier_id).expect("state for applied modifier");
                    state.stacks = (state.stacks + 1).min(max_stacks);
                    state.stacks
                };
                events.emit(&EngineEvent::ModifierApplied {
                    entity: entity.id,
                    modifier: modifier_id.to_string(),
                    stacks,
                });
                cascade::run(cfg, entity, ctl, events);
                return true;
            }
            Stacking::Ignore => return false,
        }
    }

    // Mutual exclusion: the incoming modifier evicts active class members
    if let Some(group) = cfg.exclusive_group(modifier_id) {
        let conflicting: Vec<String> = group
            .iter()
            .filter(|m| m.as_str() != modifier_id && entity.has_modifier(m))
            .cloned()
            .collect();
        for other in conflicting {
            remove(cfg, entity, &other, ctl, events);
        }
    }

    let expires_at = match def.duration_type {
        DurationType::Timed if !is_static => Some(now + (duration * 1000.0) as Millis),
        _ => None,
    };
    let ticks_remaining = match def.duration_type {
        DurationType::Ticks => Some(duration as u32),
        _ => None,
    };
    entity.modifiers.push(modifier_id.to_string());
    entity.modifier_states.insert(
        modifier_id.to_string(),
        ModState { applied_at: now, stacks: 1, is_static, expires_at, ticks_remaining },
    );
    entity.log.push(now, "modifierApplied", modifier_id);
    events.emit(&EngineEvent::ModifierApplied {
        entity: entity.id,
        modifier: modifier_id.to_string(),
        stacks: 1,
    });
    cascade::run(cfg, entity, ctl, events);
    true
}

pub fn remove(
    cfg: &ConfigStore,
    entity: &mut Entity,
    modifier_id: &str,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> bool {
    let Some(pos) = entity.modifiers.iter().position(|m| m == modifier_id) else {
        return false;
    };
    entity.modifiers.remove(pos);
    entity.modifier_states.remove(modifier_id);
    entity.log.push(entity.last_tick, "modifierRemoved", modifier_id);
    events.emit(&EngineEvent::ModifierRemoved {
        entity: entity.id,
        modifier: modifier_id.to_string(),
    });
    cascade::run(cfg, entity, ctl, events);
    true
}
