//! Weighted trait selection
//!
//! Builds the eligible pool for a layer, computes per-candidate weights
//! (base weight, conditional weight modifiers, then active weight-influence
//! relationships with optional diminishing returns), and draws. Ties and
//! iteration order always follow config declaration order, so identical
//! seeds give identical picks.

use rand::Rng;

use crate::config::schema::{
    Connector, Operation, RelationType, Relationship, Scaling, SelectionMode, WeightOp,
};
use crate::config::store::ConfigStore;
use crate::engine::conditions::{
    evaluate, evaluate_list, is_node_active, node_max, relationship_source_value,
};
use crate::entity::Entity;

#[derive(Debug, Clone)]
pub struct WeightedCandidate {
    pub trait_id: String,
    pub base_weight: f64,
    pub weight: f64,
}

/// Outcome of one selection pass. `no_eligible` distinguishes an empty or
/// fully-dampened pool from a mode that legitimately selects nothing.
#[derive(Debug, Clone, Default)]
pub struct SelectionResult {
    pub selected: Vec<String>,
    pub no_eligible: bool,
}

/// Traits currently drawable from a layer: not active, not threshold-mode,
/// eligibility satisfied, and compatible with the active set.
pub fn eligible_pool(cfg: &ConfigStore, entity: &Entity, layer_id: &str) -> Vec<String> {
    let mut pool = Vec::new();
    for trait_id in cfg.traits_of_layer(layer_id) {
        let Some(def) = cfg.trait_def(trait_id) else {
            continue;
        };
        if def.selection.mode == Some(SelectionMode::Threshold) {
            continue;
        }
        if entity.has_trait(trait_id) {
            continue;
        }
        if def.incompatible_with.iter().any(|other| entity.has_trait(other)) {
            continue;
        }
        if !def.eligibility.iter().all(|c| evaluate(cfg, entity, c)) {
            continue;
        }
        if !eligibility_gates_pass(cfg, entity, trait_id) {
            continue;
        }
        if !requirements_pass(cfg, entity, trait_id) {
            continue;
        }
        pool.push(trait_id.clone());
    }
    pool
}

fn eligibility_gates_pass(cfg: &ConfigStore, entity: &Entity, trait_id: &str) -> bool {
    cfg.influences_on(trait_id, RelationType::EligibilityGate)
        .all(|rel| evaluate_list(cfg, entity, &rel.conditions, Connector::And))
}

/// Outgoing `requires` relationships gate the trait on active targets
fn requirements_pass(cfg: &ConfigStore, entity: &Entity, trait_id: &str) -> bool {
    cfg.relationships_from(trait_id)
        .filter(|rel| rel.kind == RelationType::Requires)
        .all(|rel| is_node_active(cfg, entity, &rel.target_id))
}

/// Effective numeric contribution of a relationship, after perPoint scaling
pub fn relationship_value(cfg: &ConfigStore, entity: &Entity, rel: &Relationship) -> f64 {
    let mut value = rel.config.value;
    if rel.config.scaling == Scaling::PerPoint {
        let source = rel.config.per_point_source.as_deref().unwrap_or(&rel.source_id);
        let point = relationship_source_value(entity, source).unwrap_or(0.0);
        if rel.config.invert {
            let max = node_max(cfg, source).unwrap_or(0.0);
            value *= max - point;
        } else {
            value *= point;
        }
    }
    value
}

pub fn apply_operation(current: f64, operation: Operation, value: f64) -> f64 {
    match operation {
        Operation::Add => current + value,
        Operation::Multiply => current * value,
        Operation::Set => value,
    }
}

/// Compute draw weights for every trait in the eligible pool.
pub fn compute_weights(cfg: &ConfigStore, entity: &Entity, layer_id: &str) -> Vec<WeightedCandidate> {
    let pool = eligible_pool(cfg, entity, layer_id);
    weigh_candidates(cfg, entity, layer_id, &pool)
}

fn weigh_candidates(
    cfg: &ConfigStore,
    entity: &Entity,
    layer_id: &str,
    pool: &[String],
) -> Vec<WeightedCandidate> {
    let layer = cfg.layer(layer_id);
    let diminishing = layer.map(|l| l.selection.diminishing_returns).unwrap_or(false);
    let floor = layer.map(|l| l.selection.weight_floor).unwrap_or(0.0);

    pool.iter()
        .filter_map(|trait_id| {
            let def = cfg.trait_def(trait_id)?;
            let base = def.selection.base_weight;
            let mut weight = base;

            for wm in &def.selection.weight_modifiers {
                if evaluate(cfg, entity, &wm.condition) {
                    match wm.operation {
                        WeightOp::Add => weight += wm.value,
                        WeightOp::Multiply => weight *= wm.value,
                    }
                }
            }

            for rel in cfg.influences_on(trait_id, RelationType::WeightInfluence) {
                if !is_node_active(cfg, entity, &rel.source_id) {
                    continue;
                }
                if !evaluate_list(cfg, entity, &rel.conditions, Connector::And) {
                    continue;
                }
                let value = relationship_value(cfg, entity, rel);
                match rel.config.operation {
                    Operation::Add => {
                        // Dampened additions pull toward the pre-influence base
                        let delta = if diminishing {
                            value.signum() * value.abs().sqrt() * base.abs().sqrt()
                        } else {
                            value
                        };
                        weight += delta;
                    }
                    Operation::Multiply => weight *= value,
                    Operation::Set => weight = value,
                }
            }

            Some(WeightedCandidate { trait_id: trait_id.clone(), base_weight: base, weight: weight.max(floor) })
        })
        .collect()
}

/// Uniform draw over cumulative weights; first insertion wins ties.
/// Returns `None` when the total weight is zero.
pub fn weighted_index(rng: &mut impl Rng, weights: &[f64]) -> Option<usize> {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return None;
    }
    let draw = rng.gen_range(0.0..total);
    let mut cumulative = 0.0;
    for (i, w) in weights.iter().enumerate() {
        cumulative += w;
        if draw < cumulative {
            return Some(i);
        }
    }
    Some(weights.len() - 1)
}

/// Run one selection pass for a layer according to its mode.
/// `rolls` is the draw count for `pickN`; other modes ignore it.
pub fn select(
    cfg: &ConfigStore,
    entity: &Entity,
    layer_id: &str,
    rolls: usize,
    rng: &mut impl Rng,
) -> SelectionResult {
    let Some(layer) = cfg.layer(layer_id) else {
        return SelectionResult { selected: Vec::new(), no_eligible: true };
    };

    match layer.selection.mode {
        SelectionMode::Weighted => {
            let candidates = compute_weights(cfg, entity, layer_id);
            let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
            match weighted_index(rng, &weights) {
                Some(i) => SelectionResult {
                    selected: vec![candidates[i].trait_id.clone()],
                    no_eligible: false,
                },
                None => SelectionResult { selected: Vec::new(), no_eligible: true },
            }
        }
        SelectionMode::PickN => pick_n(cfg, entity, layer_id, rolls.max(1), rng),
        SelectionMode::AllMatching => {
            let pool = eligible_pool(cfg, entity, layer_id);
            SelectionResult { no_eligible: pool.is_empty(), selected: pool }
        }
        SelectionMode::FirstMatch => {
            let pool = eligible_pool(cfg, entity, layer_id);
            match pool.into_iter().next() {
                Some(first) => SelectionResult { selected: vec![first], no_eligible: false },
                None => SelectionResult { selected: Vec::new(), no_eligible: true },
            }
        }
        // Threshold layers never roll; the arbiter drives them
        SelectionMode::Threshold => SelectionResult::default(),
    }
}

/// N weighted draws without replacement; the remaining pool is reweighted
/// after each draw.
pub fn pick_n(
    cfg: &ConfigStore,
    entity: &Entity,
    layer_id: &str,
    n: usize,
    rng: &mut impl Rng,
) -> SelectionResult {
    let mut pool = eligible_pool(cfg, entity, layer_id);
    if pool.is_empty() {
        return SelectionResult { selected: Vec::new(), no_eligible: true };
    }
    let mut selected = Vec::new();
    for _ in 0..n {
        if pool.is_empty() {
            break;
        }
        let candidates = weigh_candidates(cfg, entity, layer_id, &pool);
        let weights: Vec<f64> = candidates.iter().map(|c| c.weight).collect();
        let Some(i) = weighted_index(rng, &weights) else {
            break;
        };
        let chosen = candidates[i].trait_id.clone();
        pool.retain(|t| *t != chosen);
        selected.push(chosen);
    }
    SelectionResult { no_eligible: selected.is_empty(), selected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ConfigDocument;
    use crate::entity::LayerState;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn store(json: &str) -> ConfigStore {
        ConfigStore::build(ConfigDocument::from_json_str(json).unwrap()).unwrap()
    }

    fn base_config() -> ConfigStore {
        store(
            r#"{"nodes":[
                {"id":"mood","kind":"layer"},
                {"id":"cheerful","kind":"trait","layerId":"mood","selection":{"baseWeight":30}},
                {"id":"grumpy","kind":"trait","layerId":"mood","selection":{"baseWeight":10},
                 "incompatibleWith":["cheerful"]},
                {"id":"stoic","kind":"trait","layerId":"mood","selection":{"baseWeight":60}}
            ]}"#,
        )
    }

    fn entity_for(cfg: &ConfigStore) -> Entity {
        let mut e = Entity::new(cfg.id.clone(), 0);
        e.layers.insert("mood".into(), LayerState::default());
        e
    }

    #[test]
    fn test_pool_skips_active_and_incompatible() {
        let cfg = base_config();
        let mut e = entity_for(&cfg);
        e.layers.get_mut("mood").unwrap().active.push("cheerful".into());

        let pool = eligible_pool(&cfg, &e, "mood");
        assert_eq!(pool, ["stoic"], "active and incompatible traits excluded");
    }

    #[test]
    fn test_weighted_index_respects_cumulative_order() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let weights = [0.0, 5.0, 0.0];
        for _ in 0..50 {
            assert_eq!(weighted_index(&mut rng, &weights), Some(1));
        }
        assert_eq!(weighted_index(&mut rng, &[0.0, 0.0]), None);
    }

    #[test]
    fn test_empirical_frequencies_track_weights() {
        let cfg = base_config();
        let e = entity_for(&cfg);
        let mut rng = ChaCha8Rng::seed_from_u64(42);

        let mut stoic = 0;
        let trials = 4000;
        for _ in 0..trials {
            let result = select(&cfg, &e, "mood", 1, &mut rng);
            if result.selected == ["stoic"] {
                stoic += 1;
            }
        }
        // stoic carries 60 of 100 total weight
        let frequency = stoic as f64 / trials as f64;
        assert!((frequency - 0.6).abs() < 0.05, "frequency {frequency} drifted from 0.6");
    }

    #[test]
    fn test_diminishing_returns_dampens_additions() {
        let cfg = store(
            r#"{"nodes":[
                {"id":"mood","kind":"layer","selection":{"diminishingReturns":true}},
                {"id":"bold","kind":"trait","layerId":"mood","selection":{"baseWeight":16}},
                {"id":"srcA","kind":"modifier"},
                {"id":"srcB","kind":"modifier"}
            ],
            "relationships":[
                {"sourceId":"srcA","targetId":"bold","type":"weight_influence","config":{"operation":"add","value":9}},
                {"sourceId":"srcB","targetId":"bold","type":"weight_influence","config":{"operation":"add","value":9}}
            ]}"#,
        );
        let mut e = entity_for(&cfg);
        e.modifiers.push("srcA".into());
        e.modifiers.push("srcB".into());

        let weights = compute_weights(&cfg, &e, "mood");
        // 16 + 2 * (sqrt(9) * sqrt(16)) = 40
        assert_eq!(weights[0].weight, 40.0);
    }

    #[test]
    fn test_per_point_scaling_with_invert() {
        let cfg = store(
            r#"{"nodes":[
                {"id":"fatigue","kind":"variable","min":0,"max":100,"initial":30},
                {"id":"mood","kind":"layer"},
                {"id":"sluggish","kind":"trait","layerId":"mood","selection":{"baseWeight":10}},
                {"id":"src","kind":"modifier"}
            ],
            "relationships":[
                {"sourceId":"src","targetId":"sluggish","type":"weight_influence",
                 "config":{"operation":"add","value":0.5,"scaling":"perPoint","perPointSource":"fatigue","invert":true}}
            ]}"#,
        );
        let mut e = entity_for(&cfg);
        e.modifiers.push("src".into());
        e.variables.insert(
            "fatigue".into(),
            crate::entity::VarState {
                value: 30.0,
                base_rate: 0.0,
                current_rate: 0.0,
                min: 0.0,
                max: 100.0,
                change_mode: crate::config::schema::ChangeMode::Manual,
                direction: crate::config::schema::Direction::None,
            },
        );

        let weights = compute_weights(&cfg, &e, "mood");
        // 10 + 0.5 * (100 - 30) = 45
        assert_eq!(weights[0].weight, 45.0);
    }

    #[test]
    fn test_weight_floor_clamps_negative() {
        let cfg = store(
            r#"{"nodes":[
                {"id":"mood","kind":"layer"},
                {"id":"meek","kind":"trait","layerId":"mood","selection":{"baseWeight":5}},
                {"id":"src","kind":"modifier"}
            ],
            "relationships":[
                {"sourceId":"src","targetId":"meek","type":"weight_influence","config":{"operation":"add","value":-50}}
            ]}"#,
        );
        let mut e = entity_for(&cfg);
        e.modifiers.push("src".into());
        let weights = compute_weights(&cfg, &e, "mood");
        assert_eq!(weights[0].weight, 0.0);
    }

    #[test]
    fn test_pick_n_draws_without_replacement() {
        let cfg = base_config();
        let e = entity_for(&cfg);
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let result = pick_n(&cfg, &e, "mood", 5, &mut rng);
        assert_eq!(result.selected.len(), 3, "pool exhausts at three traits");
        let mut sorted = result.selected.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), 3, "no repeats");
    }

    #[test]
    fn test_no_eligible_when_pool_empty() {
        let cfg = base_config();
        let mut e = entity_for(&cfg);
        for t in ["cheerful", "grumpy", "stoic"] {
            e.layers.get_mut("mood").unwrap().active.push(t.into());
        }
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let result = select(&cfg, &e, "mood", 1, &mut rng);
        assert!(result.no_eligible);
        assert!(result.selected.is_empty());
    }
}
