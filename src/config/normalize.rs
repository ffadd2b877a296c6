//! Document normalization
//!
//! Rewrites legacy wire shapes into the canonical forms the indexes and
//! evaluators consume, and fills cross-field defaults serde cannot express
//! (an attribute's roll range defaulting to its bounds, threshold mode
//! implied by a trigger). Runs once, before the store builds its indexes.

use crate::config::schema::{
    Condition, ConfigDocument, DurationType, NodePayload, SelectionMode, Trigger,
};

pub fn normalize(doc: &mut ConfigDocument) {
    for node in &mut doc.nodes {
        match &mut node.payload {
            NodePayload::Attribute(attr) => {
                if attr.default_range.is_none() {
                    attr.default_range = Some([attr.min, attr.max]);
                }
            }
            NodePayload::Trait(tr) => {
                if let Some(trigger) = &mut tr.selection.trigger {
                    normalize_trigger(trigger);
                }
                if let Some(auto) = &mut tr.selection.auto_remove {
                    normalize_trigger(auto);
                }
                // A trigger opts the trait out of random selection
                if tr.selection.trigger.is_some() && tr.selection.mode.is_none() {
                    tr.selection.mode = Some(SelectionMode::Threshold);
                }
            }
            NodePayload::Modifier(modifier) => {
                if modifier.duration_type == DurationType::Manual {
                    modifier.duration_type = DurationType::Permanent;
                }
                if let Some(trigger) = &mut modifier.trigger {
                    normalize_trigger(trigger);
                    // A removal predicate implies static management
                    if let Some(auto) = trigger.auto_remove.take() {
                        let mut auto = *auto;
                        normalize_trigger(&mut auto);
                        trigger.remove_conditions.extend(auto.conditions);
                        trigger.remove_logic = auto.logic;
                        trigger.is_static = true;
                    }
                }
            }
            _ => {}
        }
    }
}

/// Fold the legacy single `target`/`operator`/`value` form into the
/// conditions list, leaving exactly one canonical shape.
fn normalize_trigger(trigger: &mut Trigger) {
    if let Some(target) = trigger.target.take() {
        trigger.conditions.insert(
            0,
            Condition {
                target: Some(target),
                operator: trigger.operator.take(),
                value: trigger.value.take(),
                ..Condition::default()
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{Logic, Operator};

    fn doc_from_json(json: &str) -> ConfigDocument {
        let mut doc = ConfigDocument::from_json_str(json).unwrap();
        normalize(&mut doc);
        doc
    }

    #[test]
    fn test_attribute_default_range_falls_back_to_bounds() {
        let doc = doc_from_json(
            r#"{"nodes":[{"id":"str","kind":"attribute","min":3,"max":18}]}"#,
        );
        match &doc.nodes[0].payload {
            NodePayload::Attribute(attr) => assert_eq!(attr.default_range, Some([3.0, 18.0])),
            _ => panic!("expected attribute"),
        }
    }

    #[test]
    fn test_legacy_single_trigger_target_becomes_condition() {
        let doc = doc_from_json(
            r#"{"nodes":[{"id":"m","kind":"modifier","trigger":{"type":"threshold","target":"hp","operator":"<=","value":50}}]}"#,
        );
        match &doc.nodes[0].payload {
            NodePayload::Modifier(m) => {
                let trigger = m.trigger.as_ref().unwrap();
                assert!(trigger.target.is_none());
                assert_eq!(trigger.conditions.len(), 1);
                let leaf = &trigger.conditions[0];
                assert_eq!(leaf.target.as_deref(), Some("hp"));
                assert_eq!(leaf.operator, Some(Operator::Lte));
            }
            _ => panic!("expected modifier"),
        }
    }

    #[test]
    fn test_auto_remove_becomes_static_remove_conditions() {
        let doc = doc_from_json(
            r#"{"nodes":[{"id":"m","kind":"modifier","trigger":{"target":"hp","operator":"<=","value":50,"autoRemove":{"target":"hp","operator":">","value":60}}}]}"#,
        );
        match &doc.nodes[0].payload {
            NodePayload::Modifier(m) => {
                let trigger = m.trigger.as_ref().unwrap();
                assert!(trigger.is_static);
                assert_eq!(trigger.remove_conditions.len(), 1);
                assert_eq!(trigger.remove_logic, Logic::All);
            }
            _ => panic!("expected modifier"),
        }
    }

    #[test]
    fn test_manual_duration_becomes_permanent() {
        let doc = doc_from_json(
            r#"{"nodes":[{"id":"m","kind":"modifier","durationType":"manual"}]}"#,
        );
        match &doc.nodes[0].payload {
            NodePayload::Modifier(m) => assert_eq!(m.duration_type, DurationType::Permanent),
            _ => panic!("expected modifier"),
        }
    }

    #[test]
    fn test_trait_trigger_implies_threshold_mode() {
        let doc = doc_from_json(
            r#"{"nodes":[{"id":"grumpy","kind":"trait","layerId":"mood","selection":{"trigger":{"target":"hunger","operator":"<=","value":20}}}]}"#,
        );
        match &doc.nodes[0].payload {
            NodePayload::Trait(tr) => {
                assert_eq!(tr.selection.mode, Some(SelectionMode::Threshold));
                assert_eq!(tr.selection.trigger.as_ref().unwrap().conditions.len(), 1);
            }
            _ => panic!("expected trait"),
        }
    }
}
