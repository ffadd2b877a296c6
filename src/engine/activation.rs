//! Trait activation and deactivation
//!
//! Activation deactivates the trait's `replaces` list first, then any
//! incompatible active traits, then appends to the layer's active list,
//! bounded by the layer's `maxItems`. Callers run the cascade afterwards.

use crate::config::schema::RelationType;
use crate::config::store::ConfigStore;
use crate::engine::cascade::CascadeCtl;
use crate::entity::Entity;
use crate::events::{EngineEvent, EventBus};

pub fn activate_trait(
    cfg: &ConfigStore,
    entity: &mut Entity,
    trait_id: &str,
    events: &mut EventBus,
) -> bool {
    let Some(def) = cfg.trait_def(trait_id) else {
        return false;
    };
    let layer_id = def.layer_id.clone();
    if entity
        .layers
        .get(&layer_id)
        .map(|l| l.active.iter().any(|t| t == trait_id))
        .unwrap_or(false)
    {
        return false;
    }

    for replaced in def.selection.replaces.clone() {
        deactivate_trait(cfg, entity, &replaced, events);
    }
    let replaced_via_relationship: Vec<String> = cfg
        .relationships_from(trait_id)
        .filter(|rel| rel.kind == RelationType::Replaces)
        .map(|rel| rel.target_id.clone())
        .collect();
    for replaced in replaced_via_relationship {
        deactivate_trait(cfg, entity, &replaced, events);
    }
    for incompatible in def.incompatible_with.clone() {
        deactivate_trait(cfg, entity, &incompatible, events);
    }

    let max_items = cfg
        .layer(&layer_id)
        .map(|l| l.selection.max_items)
        .unwrap_or(10);
    let layer = entity.layers.entry(layer_id.clone()).or_default();
    if layer.active.len() >= max_items {
        return false;
    }
    layer.active.push(trait_id.to_string());
    entity.log.push(entity.last_tick, "traitActivated", trait_id);
    events.emit(&EngineEvent::TraitActivated {
        entity: entity.id,
        layer: layer_id,
        trait_id: trait_id.to_string(),
    });
    true
}

pub fn deactivate_trait(
    cfg: &ConfigStore,
    entity: &mut Entity,
    trait_id: &str,
    events: &mut EventBus,
) -> bool {
    let Some(def) = cfg.trait_def(trait_id) else {
        return false;
    };
    let Some(layer) = entity.layers.get_mut(&def.layer_id) else {
        return false;
    };
    let Some(pos) = layer.active.iter().position(|t| t == trait_id) else {
        return false;
    };
    layer.active.remove(pos);
    entity.log.push(entity.last_tick, "traitDeactivated", trait_id);
    events.emit(&EngineEvent::TraitDeactivated {
        entity: entity.id,
        layer: def.layer_id.clone(),
        trait_id: trait_id.to_string(),
    });
    true
}

/// Activate a list of trait ids under one batched cascade.
pub fn force_activate_all(
    cfg: &ConfigStore,
    entity: &mut Entity,
    trait_ids: &[String],
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> usize {
    use crate::engine::cascade;
    cascade::begin_batch(ctl);
    let mut activated = 0;
    for trait_id in trait_ids {
        if activate_trait(cfg, entity, trait_id, events) {
            cascade::run(cfg, entity, ctl, events);
            activated += 1;
        }
    }
    cascade::end_batch(cfg, entity, ctl, events);
    activated
}
