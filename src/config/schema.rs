//! Configuration document schema
//!
//! A configuration is a typed graph: nodes (attributes, variables, layers,
//! traits, modifiers, compounds, derived values, actions) joined by
//! relationships (weight, rate, value influences). Documents arrive as JSON
//! or TOML in the original camelCase wire format; serde defaults fill most
//! omitted fields at parse time, and `normalize` converts the remaining
//! legacy shapes.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::{Result, SimError};

/// Top-level configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigDocument {
    pub id: Option<String>,
    pub name: Option<String>,
    pub settings: Settings,
    pub nodes: Vec<Node>,
    pub relationships: Vec<Relationship>,
    pub presets: AHashMap<String, Preset>,
}

impl ConfigDocument {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(SimError::from)
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(SimError::from)
    }
}

/// Engine-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Auto-tick interval in milliseconds
    pub tick_rate: f64,
    /// Stored-entity cap before `storageLimitReached`
    pub max_entities: usize,
    /// Per-entity history ring capacity
    pub max_history: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self { tick_rate: 1000.0, max_entities: 1000, max_history: 50 }
    }
}

// ============================================================================
// Nodes
// ============================================================================

/// A configuration graph vertex: unique id plus a kind-tagged payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    #[serde(flatten)]
    pub payload: NodePayload,
}

/// Per-kind node payloads; `kind` is the discriminator on the wire.
/// `item` is a retained synonym for `trait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NodePayload {
    Attribute(AttributeDef),
    Variable(VariableDef),
    Context(ContextDef),
    Layer(LayerDef),
    #[serde(rename = "trait", alias = "item")]
    Trait(TraitDef),
    Modifier(ModifierDef),
    Compound(CompoundDef),
    Derived(DerivedDef),
    Action(ActionDef),
}

/// Coarse node kind, used for the by-kind index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NodeKind {
    Attribute,
    Variable,
    Context,
    Layer,
    Trait,
    Modifier,
    Compound,
    Derived,
    Action,
}

impl NodePayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Attribute(_) => NodeKind::Attribute,
            NodePayload::Variable(_) => NodeKind::Variable,
            NodePayload::Context(_) => NodeKind::Context,
            NodePayload::Layer(_) => NodeKind::Layer,
            NodePayload::Trait(_) => NodeKind::Trait,
            NodePayload::Modifier(_) => NodeKind::Modifier,
            NodePayload::Compound(_) => NodeKind::Compound,
            NodePayload::Derived(_) => NodeKind::Derived,
            NodePayload::Action(_) => NodeKind::Action,
        }
    }
}

/// Rolled once per entity at spawn; bounds plus roll range and rounding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttributeDef {
    pub min: f64,
    pub max: f64,
    /// Roll range at spawn; falls back to `[min, max]` during normalization
    pub default_range: Option<[f64; 2]>,
    /// Decimal places kept when rolling (0 = integers)
    pub precision: u32,
    pub spawn_order: f64,
}

impl Default for AttributeDef {
    fn default() -> Self {
        Self { min: 0.0, max: 100.0, default_range: None, precision: 0, spawn_order: 0.0 }
    }
}

/// Numeric state that drifts at a computed rate
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VariableDef {
    pub min: f64,
    pub max: f64,
    pub initial: f64,
    pub base_rate: f64,
    pub change_mode: ChangeMode,
    pub direction: Direction,
}

impl Default for VariableDef {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 100.0,
            initial: 100.0,
            base_rate: 0.0,
            change_mode: ChangeMode::Manual,
            direction: Direction::None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeMode {
    #[default]
    Manual,
    Timed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    #[default]
    None,
    Accumulate,
    Deplete,
}

/// Opaque per-entity value with a config-supplied default
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ContextDef {
    pub default: Option<Value>,
}

/// A container of traits with a selection policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerDef {
    pub order: f64,
    pub selection: LayerSelection,
    pub timing: LayerTiming,
    pub trait_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerSelection {
    pub mode: SelectionMode,
    pub max_items: usize,
    pub initial_rolls: usize,
    pub weight_floor: f64,
    pub diminishing_returns: bool,
}

impl Default for LayerSelection {
    fn default() -> Self {
        Self {
            mode: SelectionMode::Weighted,
            max_items: 10,
            initial_rolls: 1,
            weight_floor: 0.0,
            diminishing_returns: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SelectionMode {
    #[default]
    Weighted,
    AllMatching,
    PickN,
    FirstMatch,
    /// Not rolled; members activate via threshold triggers
    Threshold,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerTiming {
    pub roll_at: RollAt,
    pub reroll_allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RollAt {
    #[default]
    Spawn,
    Create,
    Never,
    Manual,
}

/// A discrete boolean state belonging to a layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraitDef {
    pub layer_id: String,
    pub selection: TraitSelection,
    pub incompatible_with: Vec<String>,
    pub eligibility: Vec<Condition>,
    /// Free-form classification keys, matched by preset taxonomy filters
    pub taxonomy: AHashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TraitSelection {
    pub base_weight: f64,
    /// `threshold` opts the trait out of random selection
    pub mode: Option<SelectionMode>,
    pub weight_modifiers: Vec<WeightModifier>,
    pub trigger: Option<Trigger>,
    pub auto_remove: Option<Trigger>,
    /// Traits deactivated when this one activates
    pub replaces: Vec<String>,
}

impl Default for TraitSelection {
    fn default() -> Self {
        Self {
            base_weight: 20.0,
            mode: None,
            weight_modifiers: Vec::new(),
            trigger: None,
            auto_remove: None,
            replaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightModifier {
    pub condition: Condition,
    pub operation: WeightOp,
    pub value: f64,
}

impl Default for WeightModifier {
    fn default() -> Self {
        Self { condition: Condition::default(), operation: WeightOp::Add, value: 0.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WeightOp {
    #[default]
    Add,
    Multiply,
}

/// A time-limited or threshold-bound state injecting influences
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModifierDef {
    pub duration_type: DurationType,
    /// Seconds for `timed`, tick count for `ticks`
    pub duration: f64,
    pub stacking: Stacking,
    pub max_stacks: u32,
    pub trigger: Option<Trigger>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclusive_with: Vec<String>,
}

impl Default for ModifierDef {
    fn default() -> Self {
        Self {
            duration_type: DurationType::Permanent,
            duration: 0.0,
            stacking: Stacking::Ignore,
            max_stacks: 99,
            trigger: None,
            exclusive_with: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DurationType {
    #[default]
    Permanent,
    Timed,
    Ticks,
    Triggered,
    /// Legacy synonym for permanent, rewritten during normalization
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Stacking {
    #[default]
    Ignore,
    Refresh,
    Stack,
}

/// Activation/removal predicate for threshold traits and modifiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Trigger {
    /// `threshold` marks a statically-managed modifier trigger
    #[serde(rename = "type")]
    pub kind: Option<String>,
    #[serde(rename = "static")]
    pub is_static: bool,
    /// Legacy single-condition form; folded into `conditions` at normalize
    pub target: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<Value>,
    pub conditions: Vec<Condition>,
    pub logic: Logic,
    pub remove_conditions: Vec<Condition>,
    pub remove_logic: Logic,
    /// Legacy removal predicate; folded into `remove_conditions`
    pub auto_remove: Option<Box<Trigger>>,
}

/// An emergent boolean derived from a requirements set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompoundDef {
    pub requires: Vec<Requirement>,
    pub requirement_logic: Logic,
}

/// One compound prerequisite: an id (bare or wrapped), a threshold, or a
/// nested condition
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum Requirement {
    Active(String),
    Threshold { id: String, operator: Operator, value: f64 },
    Ref { id: String },
    Nested { condition: Condition },
}

/// A numeric value computed from other state via a formula
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DerivedDef {
    pub formula: String,
    pub min: f64,
    pub max: f64,
}

impl Default for DerivedDef {
    fn default() -> Self {
        Self { formula: String::from("0"), min: f64::NEG_INFINITY, max: f64::INFINITY }
    }
}

/// A cooldown-gated operation with costs and eligibility
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ActionDef {
    pub base_weight: f64,
    /// Seconds between uses
    pub cooldown: f64,
    /// Variable id -> amount deducted on execution
    pub costs: AHashMap<String, f64>,
    pub requirements: Vec<Condition>,
    /// Node ids whose activity blocks this action
    pub blocked_by: Vec<String>,
    pub eligibility: Option<Condition>,
    /// Opaque payload handed back to the caller on execution
    pub effects: Value,
}

impl Default for ActionDef {
    fn default() -> Self {
        Self {
            base_weight: 20.0,
            cooldown: 0.0,
            costs: AHashMap::new(),
            requirements: Vec::new(),
            blocked_by: Vec::new(),
            eligibility: None,
            effects: Value::Null,
        }
    }
}

// ============================================================================
// Relationships
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Relationship {
    pub source_id: String,
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: RelationType,
    pub config: RelationConfig,
    pub conditions: Vec<Condition>,
}

impl Default for Relationship {
    fn default() -> Self {
        Self {
            source_id: String::new(),
            target_id: String::new(),
            kind: RelationType::WeightInfluence,
            config: RelationConfig::default(),
            conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    WeightInfluence,
    RateModifier,
    ValueModifier,
    EligibilityGate,
    Requires,
    Replaces,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelationConfig {
    pub operation: Operation,
    pub value: f64,
    pub scaling: Scaling,
    /// Node whose value drives `perPoint` scaling; defaults to the source
    pub per_point_source: Option<String>,
    /// Scale by `(max - value)` instead of `value`
    pub invert: bool,
}

impl Default for RelationConfig {
    fn default() -> Self {
        Self {
            operation: Operation::Add,
            value: 0.0,
            scaling: Scaling::Flat,
            per_point_source: None,
            invert: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operation {
    #[default]
    Add,
    Multiply,
    Set,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Scaling {
    #[default]
    Flat,
    PerPoint,
}

// ============================================================================
// Conditions
// ============================================================================

/// An algebraic condition tree. Exactly one form is populated per node:
/// an explicit `all`/`any`/`not` branch, a `group` with its own fold, or a
/// leaf (`kind`/`target`/`operator`/`value`). Ordered sibling lists fold
/// left-to-right through each leaf's `connector`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Condition {
    pub all: Option<Vec<Condition>>,
    pub any: Option<Vec<Condition>>,
    pub not: Option<Box<Condition>>,
    #[serde(rename = "type")]
    pub kind: Option<ConditionKind>,
    pub target: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<Value>,
    pub connector: Option<Connector>,
    /// Group body (when `kind == Group`)
    pub conditions: Vec<Condition>,
    /// Legacy composite marker on ordered lists
    pub logic: Option<Logic>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionKind {
    Attribute,
    Variable,
    Context,
    Trait,
    Modifier,
    Compound,
    Derived,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Connector {
    #[serde(rename = "AND")]
    And,
    #[serde(rename = "OR")]
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Logic {
    #[default]
    All,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Neq,
    #[serde(rename = "active")]
    Active,
    #[serde(rename = "inactive")]
    Inactive,
}

impl Operator {
    pub fn compare(self, left: f64, right: f64) -> bool {
        match self {
            Operator::Lt => left < right,
            Operator::Lte => left <= right,
            Operator::Gt => left > right,
            Operator::Gte => left >= right,
            Operator::Eq => (left - right).abs() < f64::EPSILON,
            Operator::Neq => (left - right).abs() >= f64::EPSILON,
            Operator::Active | Operator::Inactive => false,
        }
    }
}

// ============================================================================
// Presets
// ============================================================================

/// A reusable spawn specification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preset {
    pub attributes: AHashMap<String, PresetAttribute>,
    /// Layer id -> trait specification
    pub traits: AHashMap<String, PresetTraits>,
    pub force_traits: Vec<String>,
    pub contexts: AHashMap<String, Value>,
}

/// Per-attribute preset spec: fixed number, range, base+variance, or value
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum PresetAttribute {
    Fixed(f64),
    Range { min: f64, max: f64 },
    Variance { base: f64, variance: f64 },
    Value { value: f64 },
}

/// Per-layer preset trait spec
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum PresetTraits {
    One(String),
    Many(Vec<String>),
    Spec(PresetTraitSpec),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PresetTraitSpec {
    pub mode: PresetTraitMode,
    pub pool: Vec<PoolEntry>,
    /// Probability for `chance` mode
    pub chance: f64,
    /// Draw count for `pickN` mode
    pub count: usize,
    /// Taxonomy keys for `taxonomyFilter` mode
    pub filter: AHashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresetTraitMode {
    #[default]
    Weighted,
    Chance,
    PickN,
    All,
    TaxonomyFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged, rename_all = "camelCase")]
pub enum PoolEntry {
    Id(String),
    Weighted { id: String, #[serde(default = "default_pool_weight")] weight: f64 },
}

impl PoolEntry {
    pub fn id(&self) -> &str {
        match self {
            PoolEntry::Id(id) => id,
            PoolEntry::Weighted { id, .. } => id,
        }
    }

    pub fn weight(&self) -> f64 {
        match self {
            PoolEntry::Id(_) => 1.0,
            PoolEntry::Weighted { weight, .. } => *weight,
        }
    }
}

fn default_pool_weight() -> f64 {
    1.0
}

/// Accept either a scalar or a list on the wire (legacy `exclusiveWith`)
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}
