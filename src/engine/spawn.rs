//! Entity generation
//!
//! Spawning resolves attributes and layers in a single ordered pass:
//! attributes sort by `spawnOrder`, spawn-time layers by `order`, and the
//! two lists merge ascending. Because layers rolled early activate traits
//! before later attributes roll, a trait's `value_modifier` relationships
//! retarget the ranges of every attribute that comes after it.

use ahash::AHashMap;
use rand::Rng;
use serde_json::Value;

use crate::config::schema::{
    Connector, NodeKind, Operation, Preset, PresetAttribute, PresetTraitMode, PresetTraits,
    RelationType, RollAt,
};
use crate::config::store::ConfigStore;
use crate::core::types::Millis;
use crate::engine::activation::{activate_trait, force_activate_all};
use crate::engine::cascade::{self, CascadeCtl};
use crate::engine::conditions::{evaluate_list, is_node_active};
use crate::engine::selection::{self, relationship_value};
use crate::entity::{ActionState, Entity, LayerState, VarState};
use crate::events::EventBus;

/// Caller-supplied per-spawn overrides; explicit values beat preset specs.
#[derive(Debug, Clone, Default)]
pub struct SpawnOverrides {
    pub attributes: AHashMap<String, f64>,
    pub contexts: AHashMap<String, Value>,
}

/// A preset flattened to concrete spawn inputs
#[derive(Debug, Clone, Default)]
pub struct ResolvedPreset {
    pub attributes: AHashMap<String, f64>,
    pub contexts: AHashMap<String, Value>,
    pub forced_traits: Vec<String>,
}

enum SpawnItem {
    Attribute(String, f64),
    Layer(String, f64),
}

/// Generate a fresh entity from the loaded config.
pub fn generate(
    cfg: &ConfigStore,
    overrides: &SpawnOverrides,
    spawn_contexts: &AHashMap<String, Value>,
    now: Millis,
    rng: &mut impl Rng,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> Entity {
    let mut entity = Entity::new(cfg.id.clone(), now);

    for id in cfg.ids_of_kind(NodeKind::Variable) {
        let def = cfg.variable(id).expect("kind index is consistent");
        entity.variables.insert(
            id.clone(),
            VarState {
                value: def.initial.clamp(def.min, def.max),
                base_rate: def.base_rate,
                current_rate: def.base_rate,
                min: def.min,
                max: def.max,
                change_mode: def.change_mode,
                direction: def.direction,
            },
        );
    }
    for id in cfg.ids_of_kind(NodeKind::Context) {
        let value = overrides
            .contexts
            .get(id)
            .or_else(|| spawn_contexts.get(id))
            .cloned()
            .or_else(|| cfg.context(id).and_then(|c| c.default.clone()))
            .unwrap_or(Value::Null);
        entity.contexts.insert(id.clone(), value);
    }
    for id in cfg.ids_of_kind(NodeKind::Layer) {
        entity.layers.insert(id.clone(), LayerState::default());
    }
    for id in cfg.ids_of_kind(NodeKind::Action) {
        entity.actions.insert(id.clone(), ActionState::default());
    }

    for item in spawn_order(cfg) {
        match item {
            SpawnItem::Attribute(id, _) => {
                let value = match overrides.attributes.get(&id) {
                    Some(v) => *v,
                    None => roll_attribute(cfg, &entity, &id, rng),
                };
                entity.attributes.insert(id, value);
            }
            SpawnItem::Layer(id, _) => {
                let rolls = cfg.layer(&id).map(|l| l.selection.initial_rolls).unwrap_or(1);
                roll_layer_into(cfg, &mut entity, &id, rolls, now, rng, events);
            }
        }
    }

    // Extension overrides: attribute ids outside the spawn order
    for (id, value) in &overrides.attributes {
        if !entity.attributes.contains_key(id) {
            entity.attributes.insert(id.clone(), *value);
        }
    }

    cascade::run(cfg, &mut entity, ctl, events);
    entity.log.push(now, "generated", "");
    entity
}

/// Generate from a preset: merge its resolved specs under the caller's
/// overrides, then force-activate the collected traits.
pub fn spawn_from_preset(
    cfg: &ConfigStore,
    preset_id: &str,
    preset: &Preset,
    overrides: &SpawnOverrides,
    spawn_contexts: &AHashMap<String, Value>,
    now: Millis,
    rng: &mut impl Rng,
    ctl: &mut CascadeCtl,
    events: &mut EventBus,
) -> Entity {
    let resolved = resolve_preset(cfg, preset, rng);
    let mut merged = overrides.clone();
    for (id, value) in resolved.attributes {
        merged.attributes.entry(id).or_insert(value);
    }
    for (id, value) in resolved.contexts {
        merged.contexts.entry(id).or_insert(value);
    }

    let mut entity = generate(cfg, &merged, spawn_contexts, now, rng, ctl, events);
    entity.preset_id = Some(preset_id.to_string());
    force_activate_all(cfg, &mut entity, &resolved.forced_traits, ctl, events);
    entity
}

/// Flatten a preset's attribute and trait specs to concrete values.
pub fn resolve_preset(cfg: &ConfigStore, preset: &Preset, rng: &mut impl Rng) -> ResolvedPreset {
    let mut resolved = ResolvedPreset {
        contexts: preset.contexts.clone(),
        forced_traits: preset.force_traits.clone(),
        ..ResolvedPreset::default()
    };

    for (id, spec) in &preset.attributes {
        let value = match spec {
            PresetAttribute::Fixed(v) => *v,
            PresetAttribute::Value { value } => *value,
            PresetAttribute::Range { min, max } => {
                if min < max {
                    rng.gen_range(*min..=*max)
                } else {
                    *min
                }
            }
            PresetAttribute::Variance { base, variance } => {
                if *variance > 0.0 {
                    base + rng.gen_range(-variance..=*variance)
                } else {
                    *base
                }
            }
        };
        resolved.attributes.insert(id.clone(), value);
    }

    for (layer_id, spec) in &preset.traits {
        resolved.forced_traits.extend(resolve_trait_spec(cfg, layer_id, spec, rng));
    }
    resolved
}

fn resolve_trait_spec(
    cfg: &ConfigStore,
    layer_id: &str,
    spec: &PresetTraits,
    rng: &mut impl Rng,
) -> Vec<String> {
    match spec {
        PresetTraits::One(id) => vec![id.clone()],
        PresetTraits::Many(ids) => ids.clone(),
        PresetTraits::Spec(spec) => match spec.mode {
            PresetTraitMode::All => spec.pool.iter().map(|e| e.id().to_string()).collect(),
            PresetTraitMode::Weighted => {
                let weights: Vec<f64> = spec.pool.iter().map(|e| e.weight()).collect();
                selection::weighted_index(rng, &weights)
                    .map(|i| vec![spec.pool[i].id().to_string()])
                    .unwrap_or_default()
            }
            PresetTraitMode::Chance => {
                if !spec.pool.is_empty() && rng.gen::<f64>() < spec.chance {
                    let i = rng.gen_range(0..spec.pool.len());
                    vec![spec.pool[i].id().to_string()]
                } else {
                    Vec::new()
                }
            }
            PresetTraitMode::PickN => {
                let mut pool: Vec<&crate::config::schema::PoolEntry> = spec.pool.iter().collect();
                let mut picked = Vec::new();
                for _ in 0..spec.count {
                    let weights: Vec<f64> = pool.iter().map(|e| e.weight()).collect();
                    let Some(i) = selection::weighted_index(rng, &weights) else {
                        break;
                    };
                    picked.push(pool.remove(i).id().to_string());
                }
                picked
            }
            PresetTraitMode::TaxonomyFilter => {
                let members = cfg.layer(layer_id).map(|l| l.trait_ids.clone()).unwrap_or_default();
                cfg.traits_of_layer(layer_id)
                    .iter()
                    .filter(|id| members.is_empty() || members.contains(id))
                    .filter(|id| {
                        cfg.trait_def(id)
                            .map(|def| {
                                spec.filter
                                    .iter()
                                    .all(|(k, v)| def.taxonomy.get(k).map(|t| t == v).unwrap_or(false))
                            })
                            .unwrap_or(false)
                    })
                    .cloned()
                    .collect()
            }
        },
    }
}

/// Ordered attribute/layer resolution sequence. Ties keep attributes ahead
/// of layers.
fn spawn_order(cfg: &ConfigStore) -> Vec<SpawnItem> {
    let mut items: Vec<SpawnItem> = Vec::new();
    for id in cfg.ids_of_kind(NodeKind::Attribute) {
        let order = cfg.attribute(id).map(|a| a.spawn_order).unwrap_or(0.0);
        items.push(SpawnItem::Attribute(id.clone(), order));
    }
    for id in cfg.ids_of_kind(NodeKind::Layer) {
        let Some(layer) = cfg.layer(id) else {
            continue;
        };
        if matches!(layer.timing.roll_at, RollAt::Spawn | RollAt::Create) {
            items.push(SpawnItem::Layer(id.clone(), layer.order));
        }
    }
    fn order_of(item: &SpawnItem) -> f64 {
        match item {
            SpawnItem::Attribute(_, order) | SpawnItem::Layer(_, order) => *order,
        }
    }
    items.sort_by(|a, b| {
        order_of(a).partial_cmp(&order_of(b)).unwrap_or(std::cmp::Ordering::Equal)
    });
    items
}

/// Roll one attribute: start from its default range, fold `value_modifier`
/// relationships from active sources, draw uniformly, and round.
pub fn roll_attribute(cfg: &ConfigStore, entity: &Entity, attribute_id: &str, rng: &mut impl Rng) -> f64 {
    let Some(def) = cfg.attribute(attribute_id) else {
        return 0.0;
    };
    let [mut lo, mut hi] = def.default_range.unwrap_or([def.min, def.max]);

    for rel in cfg.influences_on(attribute_id, RelationType::ValueModifier) {
        if !is_node_active(cfg, entity, &rel.source_id) {
            continue;
        }
        if !evaluate_list(cfg, entity, &rel.conditions, Connector::And) {
            continue;
        }
        let value = relationship_value(cfg, entity, rel);
        match rel.config.operation {
            Operation::Add => {
                lo += value;
                hi += value;
            }
            Operation::Multiply => {
                lo *= value;
                hi *= value;
            }
            Operation::Set => {
                lo = value;
                hi = value;
            }
        }
    }

    if lo > hi {
        std::mem::swap(&mut lo, &mut hi);
    }
    let raw = if lo < hi { rng.gen_range(lo..=hi) } else { lo };
    let factor = 10f64.powi(def.precision as i32);
    ((raw * factor).round() / factor).clamp(def.min, def.max)
}

/// Roll a layer and activate the results.
pub fn roll_layer_into(
    cfg: &ConfigStore,
    entity: &mut Entity,
    layer_id: &str,
    rolls: usize,
    now: Millis,
    rng: &mut impl Rng,
    events: &mut EventBus,
) -> Vec<String> {
    let mut activated = Vec::new();
    for _ in 0..rolls.max(1) {
        let result = selection::select(cfg, entity, layer_id, 1, rng);
        for trait_id in result.selected {
            if activate_trait(cfg, entity, &trait_id, events) {
                activated.push(trait_id);
            }
        }
        if result.no_eligible {
            break;
        }
    }
    if let Some(layer) = entity.layers.get_mut(layer_id) {
        layer.last_roll = Some(now);
    }
    activated
}
