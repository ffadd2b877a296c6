//! Condition evaluation against a single entity
//!
//! Handles three composite forms, in priority order: explicit `all`/`any`/
//! `not` trees, ordered lists folded through per-leaf connectors, and the
//! legacy `logic` marker. A `group` leaf folds its own members (OR default)
//! and participates as one boolean in the outer fold.

use serde_json::Value;

use crate::config::schema::{Condition, ConditionKind, Connector, Logic, NodePayload, Operator};
use crate::config::store::ConfigStore;
use crate::entity::Entity;

/// Numeric read used by conditions and thresholds:
/// attribute, then variable value, then derived.
pub fn entity_value(entity: &Entity, id: &str) -> Option<f64> {
    if let Some(v) = entity.attributes.get(id) {
        return Some(*v);
    }
    if let Some(v) = entity.variables.get(id) {
        return Some(v.value);
    }
    entity.derived.get(id).copied()
}

/// Numeric read used by relationship math (`perPoint` scaling):
/// attribute, then variable value, then numeric context.
pub fn relationship_source_value(entity: &Entity, id: &str) -> Option<f64> {
    if let Some(v) = entity.attributes.get(id) {
        return Some(*v);
    }
    if let Some(v) = entity.variables.get(id) {
        return Some(v.value);
    }
    entity.contexts.get(id).and_then(Value::as_f64)
}

/// Upper bound of a node's numeric range, for inverted perPoint scaling
pub fn node_max(cfg: &ConfigStore, id: &str) -> Option<f64> {
    match cfg.node(id).map(|n| &n.payload) {
        Some(NodePayload::Attribute(a)) => Some(a.max),
        Some(NodePayload::Variable(v)) => Some(v.max),
        Some(NodePayload::Derived(d)) => Some(d.max),
        _ => None,
    }
}

/// Membership test behind the `active`/`inactive` operators
pub fn is_node_active(cfg: &ConfigStore, entity: &Entity, id: &str) -> bool {
    match cfg.node(id).map(|n| &n.payload) {
        Some(NodePayload::Trait(_)) => entity.has_trait(id),
        Some(NodePayload::Modifier(_)) => entity.has_modifier(id),
        Some(NodePayload::Compound(_)) => entity.has_compound(id),
        // Unknown or non-membership node: any membership counts
        _ => entity.has_trait(id) || entity.has_modifier(id) || entity.has_compound(id),
    }
}

pub fn evaluate(cfg: &ConfigStore, entity: &Entity, cond: &Condition) -> bool {
    if let Some(all) = &cond.all {
        return all.iter().all(|c| evaluate(cfg, entity, c));
    }
    if let Some(any) = &cond.any {
        return any.iter().any(|c| evaluate(cfg, entity, c));
    }
    if let Some(not) = &cond.not {
        return !evaluate(cfg, entity, not);
    }
    if cond.kind == Some(ConditionKind::Group) {
        return evaluate_list(cfg, entity, &cond.conditions, Connector::Or);
    }
    // Bare composite: legacy `logic` marker, else connector fold
    if !cond.conditions.is_empty() {
        return match cond.logic {
            Some(logic) => evaluate_with_logic(cfg, entity, &cond.conditions, logic),
            None => evaluate_list(cfg, entity, &cond.conditions, Connector::And),
        };
    }
    evaluate_leaf(cfg, entity, cond)
}

/// Fold an ordered list left-to-right through each leaf's connector.
/// The first leaf seeds the accumulator; its own connector is ignored.
pub fn evaluate_list(
    cfg: &ConfigStore,
    entity: &Entity,
    conditions: &[Condition],
    default_connector: Connector,
) -> bool {
    let mut iter = conditions.iter();
    let Some(first) = iter.next() else {
        return true;
    };
    let mut acc = evaluate(cfg, entity, first);
    for cond in iter {
        let value = evaluate(cfg, entity, cond);
        match cond.connector.unwrap_or(default_connector) {
            Connector::And => acc = acc && value,
            Connector::Or => acc = acc || value,
        }
    }
    acc
}

/// Legacy composite: `logic='all'` folds as AND, `'any'` as OR
pub fn evaluate_with_logic(
    cfg: &ConfigStore,
    entity: &Entity,
    conditions: &[Condition],
    logic: Logic,
) -> bool {
    match logic {
        Logic::All => conditions.iter().all(|c| evaluate(cfg, entity, c)),
        Logic::Any => conditions.iter().any(|c| evaluate(cfg, entity, c)),
    }
}

fn evaluate_leaf(cfg: &ConfigStore, entity: &Entity, cond: &Condition) -> bool {
    let Some(target) = cond.target.as_deref() else {
        return true;
    };

    match cond.operator {
        Some(Operator::Active) => return is_node_active(cfg, entity, target),
        Some(Operator::Inactive) => return !is_node_active(cfg, entity, target),
        _ => {}
    }

    // Membership kinds without a numeric operator are activity tests
    if cond.value.is_none()
        && matches!(
            cond.kind,
            Some(ConditionKind::Trait | ConditionKind::Modifier | ConditionKind::Compound)
        )
    {
        return is_node_active(cfg, entity, target);
    }

    let left = match cond.kind {
        Some(ConditionKind::Attribute) => entity.attributes.get(target).copied(),
        Some(ConditionKind::Variable) => entity.variable_value(target),
        Some(ConditionKind::Derived) => entity.derived.get(target).copied(),
        Some(ConditionKind::Context) => {
            return compare_context(entity, target, cond.operator, cond.value.as_ref())
        }
        Some(ConditionKind::Trait | ConditionKind::Modifier | ConditionKind::Compound) => {
            Some(if is_node_active(cfg, entity, target) { 1.0 } else { 0.0 })
        }
        Some(ConditionKind::Group) | None => entity_value(entity, target),
    };

    let (Some(left), Some(right)) = (left, cond.value.as_ref().and_then(Value::as_f64)) else {
        return false;
    };
    cond.operator.unwrap_or(Operator::Eq).compare(left, right)
}

fn compare_context(
    entity: &Entity,
    target: &str,
    operator: Option<Operator>,
    expected: Option<&Value>,
) -> bool {
    let Some(actual) = entity.contexts.get(target) else {
        return false;
    };
    // Numeric contexts compare numerically; anything else supports equality
    if let (Some(left), Some(right)) = (actual.as_f64(), expected.and_then(Value::as_f64)) {
        return operator.unwrap_or(Operator::Eq).compare(left, right);
    }
    match operator.unwrap_or(Operator::Eq) {
        Operator::Eq => Some(actual) == expected,
        Operator::Neq => Some(actual) != expected,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ConfigDocument;
    use crate::entity::{LayerState, VarState};
    use crate::config::schema::{ChangeMode, Direction};
    use serde_json::json;

    fn cfg() -> ConfigStore {
        ConfigStore::build(
            ConfigDocument::from_json_str(
                r#"{"nodes":[
                    {"id":"hunger","kind":"variable","min":0,"max":100,"initial":60},
                    {"id":"str","kind":"attribute","min":0,"max":20},
                    {"id":"mood","kind":"layer"},
                    {"id":"grumpy","kind":"trait","layerId":"mood"},
                    {"id":"starving","kind":"modifier"},
                    {"id":"biome","kind":"context","default":"forest"}
                ]}"#,
            )
            .unwrap(),
        )
        .unwrap()
    }

    fn entity(cfg: &ConfigStore) -> Entity {
        let mut e = Entity::new(cfg.id.clone(), 0);
        e.variables.insert(
            "hunger".into(),
            VarState {
                value: 60.0,
                base_rate: 0.0,
                current_rate: 0.0,
                min: 0.0,
                max: 100.0,
                change_mode: ChangeMode::Manual,
                direction: Direction::None,
            },
        );
        e.attributes.insert("str".into(), 14.0);
        e.contexts.insert("biome".into(), json!("forest"));
        e.layers.insert("mood".into(), LayerState::default());
        e
    }

    fn cond(json: serde_json::Value) -> Condition {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_numeric_leaf() {
        let cfg = cfg();
        let e = entity(&cfg);
        assert!(evaluate(&cfg, &e, &cond(json!({"target":"hunger","operator":"<=","value":60}))));
        assert!(!evaluate(&cfg, &e, &cond(json!({"target":"hunger","operator":"<","value":60}))));
        assert!(evaluate(&cfg, &e, &cond(json!({"target":"str","operator":">","value":10}))));
    }

    #[test]
    fn test_active_inactive_operators() {
        let cfg = cfg();
        let mut e = entity(&cfg);
        assert!(evaluate(&cfg, &e, &cond(json!({"target":"grumpy","operator":"inactive"}))));
        e.layers.get_mut("mood").unwrap().active.push("grumpy".into());
        assert!(evaluate(&cfg, &e, &cond(json!({"target":"grumpy","operator":"active"}))));
    }

    #[test]
    fn test_explicit_tree() {
        let cfg = cfg();
        let e = entity(&cfg);
        let tree = cond(json!({
            "all": [
                {"target":"hunger","operator":">","value":10},
                {"not": {"target":"starving","operator":"active"}}
            ]
        }));
        assert!(evaluate(&cfg, &e, &tree));
    }

    #[test]
    fn test_connector_fold_left_to_right() {
        let cfg = cfg();
        let e = entity(&cfg);
        // false OR true AND true -> ((false OR true) AND true) = true
        let list = vec![
            cond(json!({"target":"hunger","operator":">","value":90})),
            cond(json!({"target":"hunger","operator":"<","value":90, "connector":"OR"})),
            cond(json!({"target":"str","operator":">","value":10, "connector":"AND"})),
        ];
        assert!(evaluate_list(&cfg, &e, &list, Connector::And));
    }

    #[test]
    fn test_group_defaults_to_or() {
        let cfg = cfg();
        let e = entity(&cfg);
        let group = cond(json!({
            "type": "group",
            "conditions": [
                {"target":"hunger","operator":">","value":90},
                {"target":"str","operator":">","value":10}
            ]
        }));
        assert!(evaluate(&cfg, &e, &group));
    }

    #[test]
    fn test_bare_composite_with_legacy_logic() {
        let cfg = cfg();
        let e = entity(&cfg);
        let composite = cond(json!({
            "logic": "any",
            "conditions": [
                {"target":"hunger","operator":">","value":90},
                {"target":"str","operator":">","value":10}
            ]
        }));
        assert!(evaluate(&cfg, &e, &composite));
    }

    #[test]
    fn test_legacy_logic_any() {
        let cfg = cfg();
        let e = entity(&cfg);
        let conds = vec![
            cond(json!({"target":"hunger","operator":">","value":90})),
            cond(json!({"target":"str","operator":">","value":10})),
        ];
        assert!(evaluate_with_logic(&cfg, &e, &conds, Logic::Any));
        assert!(!evaluate_with_logic(&cfg, &e, &conds, Logic::All));
    }

    #[test]
    fn test_context_comparison() {
        let cfg = cfg();
        let e = entity(&cfg);
        assert!(evaluate(
            &cfg,
            &e,
            &cond(json!({"type":"context","target":"biome","operator":"==","value":"forest"}))
        ));
        assert!(evaluate(
            &cfg,
            &e,
            &cond(json!({"type":"context","target":"biome","operator":"!=","value":"tundra"}))
        ));
    }

    #[test]
    fn test_missing_target_fails_numeric_comparison() {
        let cfg = cfg();
        let e = entity(&cfg);
        assert!(!evaluate(&cfg, &e, &cond(json!({"target":"ghost","operator":">","value":0}))));
    }
}
