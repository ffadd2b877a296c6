//! Per-entity tick: variable integration, expiry, threshold sweep
//!
//! One tick integrates every timed variable by `current_rate * dt`,
//! re-checks thresholds on each change, expires timed and tick-counted
//! modifiers, runs the entity-wide modifier sweep, and winds down action
//! cooldowns. The whole tick runs under a single batched cascade.

use crate::config::schema::{ChangeMode, Direction};
use crate::config::store::ConfigStore;
use crate::core::types::Millis;
use crate::engine::cascade::{self, CascadeCtl};
use crate::engine::{modifiers, thresholds};
use crate::entity::Entity;
use crate::events::{EngineEvent, EventBus};

pub fn tick_entity(
    cfg: &ConfigStore,
    entity: &mut Entity,
    dt_seconds: f64,
    now: Millis,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) {
    cascade::begin_batch(ctl);

    integrate_variables(cfg, entity, dt_seconds, ctl, events);
    expire_modifiers(cfg, entity, now, ctl, events);
    thresholds::check_modifier_thresholds(cfg, entity, now, ctl, events);

    for action in entity.actions.values_mut() {
        action.cooldown_remaining = (action.cooldown_remaining - dt_seconds).max(0.0);
    }

    entity.last_tick = now;
    cascade::end_batch(cfg, entity, ctl, events);
    // Derived values track the clock even when nothing marked the cascade
    cascade::calculate_derived(cfg, entity);

    events.emit(&EngineEvent::Tick { entity: entity.id, dt: dt_seconds });
}

fn integrate_variables(
    cfg: &ConfigStore,
    entity: &mut Entity,
    dt_seconds: f64,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) {
    let ids: Vec<String> = entity.variables.keys().cloned().collect();
    for id in ids {
        let (old, new) = {
            let Some(var) = entity.variables.get_mut(&id) else {
                continue;
            };
            if var.change_mode != ChangeMode::Timed || var.direction == Direction::None {
                continue;
            }
            let old = var.value;
            let new = (old + var.current_rate * dt_seconds).clamp(var.min, var.max);
            var.value = new;
            (old, new)
        };
        if new != old {
            thresholds::check_variable_thresholds(cfg, entity, &id, ctl, events);
            events.emit(&EngineEvent::VariableChanged {
                entity: entity.id,
                variable: id,
                from: old,
                to: new,
            });
            cascade::run(cfg, entity, ctl, events);
        }
    }
}

/// Remove timed modifiers past `expires_at` and tick-counted modifiers
/// whose counter reaches zero. Counters decrement once per tick.
fn expire_modifiers(
    cfg: &ConfigStore,
    entity: &mut Entity,
    now: Millis,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) {
    let mut expired = Vec::new();
    for (id, state) in entity.modifier_states.iter_mut() {
        if let Some(expires_at) = state.expires_at {
            if expires_at <= now {
                expired.push(id.clone());
                continue;
            }
        }
        if let Some(ticks) = state.ticks_remaining.as_mut() {
            *ticks = ticks.saturating_sub(1);
            if *ticks == 0 {
                expired.push(id.clone());
            }
        }
    }
    // Stable expiry order regardless of map iteration
    expired.sort();
    for id in expired {
        modifiers::remove(cfg, entity, &id, ctl, events);
    }
}
