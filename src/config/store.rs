//! Validated, indexed configuration store
//!
//! Built once per `load_config`. All evaluation-time lookups go through the
//! indexes here; nothing re-walks the raw document after load. Indexes hold
//! ids rather than references, so the store is freely shareable read-only.

use ahash::AHashMap;
use std::collections::BTreeSet;

use crate::config::formula::FormulaCache;
use crate::config::normalize::normalize;
use crate::config::schema::{
    ActionDef, AttributeDef, CompoundDef, ConfigDocument, ContextDef, DerivedDef, LayerDef,
    ModifierDef, Node, NodeKind, NodePayload, Preset, RelationType, Relationship, SelectionMode,
    Settings, TraitDef, VariableDef,
};
use crate::core::error::{Result, SimError};

#[derive(Debug)]
pub struct ConfigStore {
    pub id: String,
    pub name: String,
    pub settings: Settings,
    nodes: AHashMap<String, Node>,
    /// Node ids per kind, in document order. Trait and item share a kind.
    by_kind: AHashMap<NodeKind, Vec<String>>,
    relationships: Vec<Relationship>,
    rel_by_source: AHashMap<String, Vec<usize>>,
    rel_by_target: AHashMap<String, Vec<usize>>,
    rel_by_type: AHashMap<RelationType, Vec<usize>>,
    /// Modifiers whose trigger type is `threshold`, in document order
    threshold_modifiers: Vec<String>,
    /// Variable id -> threshold-mode traits watching it
    threshold_traits_by_var: AHashMap<String, Vec<String>>,
    /// Modifier id -> its full mutual-exclusion class (symmetric closure)
    exclusive_groups: AHashMap<String, BTreeSet<String>>,
    /// Layer id -> member trait ids, in document order
    layer_traits: AHashMap<String, Vec<String>>,
    presets: AHashMap<String, Preset>,
    formulas: FormulaCache,
    /// Non-fatal load diagnostics (cyclic `replaces` chains, bad formulas)
    pub warnings: Vec<String>,
}

impl ConfigStore {
    /// Normalize, validate, and index a configuration document.
    pub fn build(mut doc: ConfigDocument) -> Result<Self> {
        normalize(&mut doc);

        let mut nodes: AHashMap<String, Node> = AHashMap::with_capacity(doc.nodes.len());
        let mut by_kind: AHashMap<NodeKind, Vec<String>> = AHashMap::new();
        for node in &doc.nodes {
            if nodes.contains_key(&node.id) {
                return Err(SimError::DuplicateNode(node.id.clone()));
            }
            by_kind.entry(node.payload.kind()).or_default().push(node.id.clone());
            nodes.insert(node.id.clone(), node.clone());
        }

        // Relationship endpoints must exist
        for rel in &doc.relationships {
            if !nodes.contains_key(&rel.source_id) {
                return Err(SimError::MissingReferent { side: "sourceId", id: rel.source_id.clone() });
            }
            if !nodes.contains_key(&rel.target_id) {
                return Err(SimError::MissingReferent { side: "targetId", id: rel.target_id.clone() });
            }
        }

        let mut rel_by_source: AHashMap<String, Vec<usize>> = AHashMap::new();
        let mut rel_by_target: AHashMap<String, Vec<usize>> = AHashMap::new();
        let mut rel_by_type: AHashMap<RelationType, Vec<usize>> = AHashMap::new();
        for (i, rel) in doc.relationships.iter().enumerate() {
            rel_by_source.entry(rel.source_id.clone()).or_default().push(i);
            rel_by_target.entry(rel.target_id.clone()).or_default().push(i);
            rel_by_type.entry(rel.kind).or_default().push(i);
        }

        let mut warnings = Vec::new();

        // Trait membership per layer, and the threshold-trait watch index
        let mut layer_traits: AHashMap<String, Vec<String>> = AHashMap::new();
        let mut threshold_traits_by_var: AHashMap<String, Vec<String>> = AHashMap::new();
        for id in by_kind.get(&NodeKind::Trait).map(Vec::as_slice).unwrap_or(&[]) {
            let tr = match &nodes[id].payload {
                NodePayload::Trait(tr) => tr,
                _ => unreachable!(),
            };
            match nodes.get(&tr.layer_id) {
                Some(layer) if matches!(layer.payload, NodePayload::Layer(_)) => {}
                _ => {
                    return Err(SimError::UnknownLayer {
                        trait_id: id.clone(),
                        layer_id: tr.layer_id.clone(),
                    })
                }
            }
            layer_traits.entry(tr.layer_id.clone()).or_default().push(id.clone());

            if tr.selection.mode == Some(SelectionMode::Threshold) {
                let mut watched: Vec<&str> = Vec::new();
                for trigger in [tr.selection.trigger.as_ref(), tr.selection.auto_remove.as_ref()]
                    .into_iter()
                    .flatten()
                {
                    for cond in &trigger.conditions {
                        if let Some(target) = cond.target.as_deref() {
                            if matches!(
                                nodes.get(target).map(|n| &n.payload),
                                Some(NodePayload::Variable(_))
                            ) && !watched.contains(&target)
                            {
                                watched.push(target);
                            }
                        }
                    }
                }
                for var in watched {
                    threshold_traits_by_var.entry(var.to_string()).or_default().push(id.clone());
                }
            }
        }

        // Cyclic replaces chains are reported, not fatal
        for cycle in find_replace_cycles(&nodes, by_kind.get(&NodeKind::Trait)) {
            let message = format!("cyclic replaces chain: {}", cycle.join(" -> "));
            tracing::warn!(target: "vivarium::config", "{message}");
            warnings.push(message);
        }

        let mut threshold_modifiers = Vec::new();
        let mut exclusive_edges: AHashMap<String, Vec<String>> = AHashMap::new();
        for id in by_kind.get(&NodeKind::Modifier).map(Vec::as_slice).unwrap_or(&[]) {
            let def = match &nodes[id].payload {
                NodePayload::Modifier(def) => def,
                _ => unreachable!(),
            };
            if def.trigger.as_ref().and_then(|t| t.kind.as_deref()) == Some("threshold") {
                threshold_modifiers.push(id.clone());
            }
            for other in &def.exclusive_with {
                exclusive_edges.entry(id.clone()).or_default().push(other.clone());
                exclusive_edges.entry(other.clone()).or_default().push(id.clone());
            }
        }
        let exclusive_groups = close_exclusive_groups(&exclusive_edges);

        let mut formulas = FormulaCache::new();
        for id in by_kind.get(&NodeKind::Derived).map(Vec::as_slice).unwrap_or(&[]) {
            let def = match &nodes[id].payload {
                NodePayload::Derived(def) => def,
                _ => unreachable!(),
            };
            if let Err(e) = formulas.insert(&def.formula) {
                let message = format!("derived '{id}': {e}");
                tracing::warn!(target: "vivarium::config", "{message}");
                warnings.push(message);
            }
        }

        Ok(Self {
            id: doc.id.unwrap_or_else(|| "config".to_string()),
            name: doc.name.unwrap_or_default(),
            settings: doc.settings,
            nodes,
            by_kind,
            relationships: doc.relationships,
            rel_by_source,
            rel_by_target,
            rel_by_type,
            threshold_modifiers,
            threshold_traits_by_var,
            exclusive_groups,
            layer_traits,
            presets: doc.presets,
            formulas,
            warnings,
        })
    }

    // ------------------------------------------------------------------
    // Node access
    // ------------------------------------------------------------------

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn ids_of_kind(&self, kind: NodeKind) -> &[String] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn attribute(&self, id: &str) -> Option<&AttributeDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Attribute(def)) => Some(def),
            _ => None,
        }
    }

    pub fn variable(&self, id: &str) -> Option<&VariableDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Variable(def)) => Some(def),
            _ => None,
        }
    }

    pub fn context(&self, id: &str) -> Option<&ContextDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Context(def)) => Some(def),
            _ => None,
        }
    }

    pub fn layer(&self, id: &str) -> Option<&LayerDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Layer(def)) => Some(def),
            _ => None,
        }
    }

    pub fn trait_def(&self, id: &str) -> Option<&TraitDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Trait(def)) => Some(def),
            _ => None,
        }
    }

    pub fn modifier(&self, id: &str) -> Option<&ModifierDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Modifier(def)) => Some(def),
            _ => None,
        }
    }

    pub fn compound(&self, id: &str) -> Option<&CompoundDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Compound(def)) => Some(def),
            _ => None,
        }
    }

    pub fn derived(&self, id: &str) -> Option<&DerivedDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Derived(def)) => Some(def),
            _ => None,
        }
    }

    pub fn action(&self, id: &str) -> Option<&ActionDef> {
        match self.nodes.get(id).map(|n| &n.payload) {
            Some(NodePayload::Action(def)) => Some(def),
            _ => None,
        }
    }

    // ------------------------------------------------------------------
    // Relationships
    // ------------------------------------------------------------------

    pub fn relationship(&self, index: usize) -> &Relationship {
        &self.relationships[index]
    }

    pub fn relationships_from(&self, source_id: &str) -> impl Iterator<Item = &Relationship> {
        self.rel_by_source
            .get(source_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.relationships[i])
    }

    pub fn relationships_to(&self, target_id: &str) -> impl Iterator<Item = &Relationship> {
        self.rel_by_target
            .get(target_id)
            .into_iter()
            .flatten()
            .map(move |&i| &self.relationships[i])
    }

    /// Relationships of one type pointing at one target, in document order
    pub fn influences_on(
        &self,
        target_id: &str,
        kind: RelationType,
    ) -> impl Iterator<Item = &Relationship> {
        self.relationships_to(target_id).filter(move |r| r.kind == kind)
    }

    pub fn relationships_of_type(&self, kind: RelationType) -> impl Iterator<Item = &Relationship> {
        self.rel_by_type
            .get(&kind)
            .into_iter()
            .flatten()
            .map(move |&i| &self.relationships[i])
    }

    // ------------------------------------------------------------------
    // Derived indexes
    // ------------------------------------------------------------------

    pub fn threshold_modifiers(&self) -> &[String] {
        &self.threshold_modifiers
    }

    pub fn threshold_traits_for(&self, variable_id: &str) -> &[String] {
        self.threshold_traits_by_var
            .get(variable_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Full mutual-exclusion class for a modifier (includes the modifier)
    pub fn exclusive_group(&self, modifier_id: &str) -> Option<&BTreeSet<String>> {
        self.exclusive_groups.get(modifier_id)
    }

    pub fn traits_of_layer(&self, layer_id: &str) -> &[String] {
        self.layer_traits.get(layer_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn preset(&self, id: &str) -> Option<&Preset> {
        self.presets.get(id)
    }

    pub fn register_preset(&mut self, id: String, preset: Preset) {
        self.presets.insert(id, preset);
    }

    pub fn formulas(&self) -> &FormulaCache {
        &self.formulas
    }
}

/// Symmetric transitive closure: every member of a connected component maps
/// to the whole component.
fn close_exclusive_groups(
    edges: &AHashMap<String, Vec<String>>,
) -> AHashMap<String, BTreeSet<String>> {
    let mut groups: AHashMap<String, BTreeSet<String>> = AHashMap::new();
    let mut visited: BTreeSet<&str> = BTreeSet::new();
    for start in edges.keys() {
        if visited.contains(start.as_str()) {
            continue;
        }
        let mut component: BTreeSet<String> = BTreeSet::new();
        let mut stack = vec![start.as_str()];
        while let Some(id) = stack.pop() {
            if !component.insert(id.to_string()) {
                continue;
            }
            visited.insert(id);
            for next in edges.get(id).into_iter().flatten() {
                if !component.contains(next.as_str()) {
                    stack.push(next.as_str());
                }
            }
        }
        for member in &component {
            groups.insert(member.clone(), component.clone());
        }
    }
    groups
}

/// Walk `replaces` chains and report each cycle once.
fn find_replace_cycles(
    nodes: &AHashMap<String, Node>,
    trait_ids: Option<&Vec<String>>,
) -> Vec<Vec<String>> {
    let mut cycles = Vec::new();
    let mut cleared: BTreeSet<&str> = BTreeSet::new();
    for start in trait_ids.into_iter().flatten() {
        if cleared.contains(start.as_str()) {
            continue;
        }
        let mut path: Vec<&str> = Vec::new();
        let mut current = start.as_str();
        loop {
            if let Some(pos) = path.iter().position(|&p| p == current) {
                cycles.push(path[pos..].iter().map(|s| s.to_string()).collect());
                break;
            }
            path.push(current);
            let next = match nodes.get(current).map(|n| &n.payload) {
                Some(NodePayload::Trait(tr)) => tr.selection.replaces.first(),
                _ => None,
            };
            match next {
                Some(next) if !cleared.contains(next.as_str()) => current = next.as_str(),
                _ => break,
            }
        }
        cleared.extend(path);
    }
    cycles
}
