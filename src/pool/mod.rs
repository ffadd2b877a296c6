//! Multi-pool entity recycler
//!
//! Pools hold reset-ready entities for high-churn workloads. Acquiring pops
//! and recycles when possible and spawns otherwise; releasing clears
//! transient state and parks the entity, or drops it when the pool is full.
//! Rule-based assignment routes unpinned entities by preset glob matches
//! and scored conditions. A `default` pool always exists.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::config::schema::Operator;
use crate::core::types::{EntityId, Millis};
use crate::engine::spawn::SpawnOverrides;
use crate::engine::EntityManager;
use crate::entity::Entity;
use crate::events::EngineEvent;

pub const DEFAULT_POOL: &str = "default";

/// Available entities kept after a shrink, and the utilization bar below
/// which shrinking starts
const SHRINK_KEEP_MIN: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolConfig {
    pub max_size: usize,
    /// Entities created up-front by `pre_warm_pool`
    pub pre_warm: usize,
    pub pre_warm_preset: Option<String>,
    /// Utilization below which an idle pool sheds entities
    pub shrink_threshold: f64,
    /// Quiet period before a shrink check, milliseconds
    pub shrink_delay_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            pre_warm: 0,
            pre_warm_preset: None,
            shrink_threshold: 0.25,
            shrink_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total_created: u64,
    pub total_acquired: u64,
    pub total_released: u64,
}

/// Scored routing rules for one pool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolRules {
    pub priority: i32,
    pub conditions: Vec<PoolCondition>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PoolCondition {
    pub source: PoolSource,
    /// Glob for `preset` (`*` matches any substring); id for membership sources
    #[serde(rename = "match")]
    pub pattern: Option<String>,
    /// Node id for `attribute`/`variable` comparisons
    pub target: Option<String>,
    pub operator: Option<Operator>,
    pub value: Option<f64>,
    pub weight: f64,
}

impl Default for PoolCondition {
    fn default() -> Self {
        Self {
            source: PoolSource::Preset,
            pattern: None,
            target: None,
            operator: None,
            value: None,
            weight: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolSource {
    #[default]
    Preset,
    Trait,
    Attribute,
    Variable,
    Modifier,
    Compound,
}

struct Pool {
    config: PoolConfig,
    stats: PoolStats,
    entities: Vec<Entity>,
    rules: Option<PoolRules>,
    last_release: Millis,
    shrink_pending: bool,
}

impl Pool {
    fn new(config: PoolConfig) -> Self {
        Self {
            config,
            stats: PoolStats::default(),
            entities: Vec::new(),
            rules: None,
            last_release: 0,
            shrink_pending: false,
        }
    }

    fn stats(&self) -> PoolStats {
        PoolStats { available: self.entities.len(), ..self.stats }
    }
}

pub struct PoolManager {
    pools: AHashMap<String, Pool>,
    /// Creation order, for stable listings and rule scans
    order: Vec<String>,
}

impl PoolManager {
    pub fn new() -> Self {
        let mut pools = AHashMap::new();
        pools.insert(DEFAULT_POOL.to_string(), Pool::new(PoolConfig::default()));
        Self { pools, order: vec![DEFAULT_POOL.to_string()] }
    }

    // ------------------------------------------------------------------
    // Pool administration
    // ------------------------------------------------------------------

    pub fn create_pool(&mut self, mgr: &mut EntityManager, id: &str, config: PoolConfig) -> bool {
        if self.pools.contains_key(id) {
            return false;
        }
        self.pools.insert(id.to_string(), Pool::new(config));
        self.order.push(id.to_string());
        mgr.emit(&EngineEvent::PoolCreated { pool: id.to_string() });
        true
    }

    pub fn configure_pool(&mut self, mgr: &mut EntityManager, id: &str, config: PoolConfig) -> bool {
        let Some(pool) = self.pools.get_mut(id) else {
            return false;
        };
        pool.config = config;
        mgr.emit(&EngineEvent::PoolConfigured { pool: id.to_string() });
        true
    }

    pub fn set_pool_rules(&mut self, mgr: &mut EntityManager, id: &str, rules: PoolRules) -> bool {
        let Some(pool) = self.pools.get_mut(id) else {
            return false;
        };
        pool.rules = Some(rules);
        mgr.emit(&EngineEvent::PoolRulesUpdated { pool: id.to_string() });
        true
    }

    /// The default pool cannot be removed; parked entities are dropped.
    pub fn remove_pool(&mut self, mgr: &mut EntityManager, id: &str) -> bool {
        if id == DEFAULT_POOL || !self.pools.contains_key(id) {
            return false;
        }
        self.pools.remove(id);
        self.order.retain(|p| p != id);
        mgr.emit(&EngineEvent::PoolRemoved { pool: id.to_string() });
        true
    }

    pub fn clear_pool(&mut self, id: &str) -> usize {
        self.pools.get_mut(id).map(|p| std::mem::take(&mut p.entities).len()).unwrap_or(0)
    }

    pub fn list_pools(&self) -> Vec<&str> {
        self.order.iter().map(String::as_str).collect()
    }

    pub fn get_pool_stats(&self, id: &str) -> Option<PoolStats> {
        self.pools.get(id).map(Pool::stats)
    }

    pub fn get_all_pool_stats(&self) -> Vec<(String, PoolStats)> {
        self.order
            .iter()
            .filter_map(|id| self.pools.get(id).map(|p| (id.clone(), p.stats())))
            .collect()
    }

    /// Spawn entities into the pool until `pre_warm` are parked.
    pub fn pre_warm_pool(&mut self, mgr: &mut EntityManager, id: &str) -> usize {
        let Some(pool) = self.pools.get(id) else {
            return 0;
        };
        let preset = pool.config.pre_warm_preset.clone();
        let target = pool.config.pre_warm.min(pool.config.max_size);
        let mut warmed = 0;
        while self.pools[id].entities.len() < target {
            let Some(entity_id) = mgr.spawn(preset.as_deref(), None) else {
                break;
            };
            let Some(mut entity) = mgr.extract_entity(entity_id) else {
                break;
            };
            clear_transient(&mut entity);
            entity.pool_id = Some(id.to_string());
            let pool = self.pools.get_mut(id).expect("pool existence checked");
            pool.stats.total_created += 1;
            pool.entities.push(entity);
            warmed += 1;
        }
        warmed
    }

    // ------------------------------------------------------------------
    // Acquire / release
    // ------------------------------------------------------------------

    /// Hand out an entity: recycle from the pool when one is parked, spawn
    /// otherwise. Without an explicit target, the requested preset picks
    /// the source pool through the routing rules, and the spawned entity
    /// may still be re-routed once its traits are known.
    pub fn acquire(
        &mut self,
        mgr: &mut EntityManager,
        preset: Option<&str>,
        overrides: Option<SpawnOverrides>,
        target_pool: Option<&str>,
    ) -> Option<EntityId> {
        let source_pool = match target_pool {
            Some(target) => {
                if !self.pools.contains_key(target) {
                    return None;
                }
                target.to_string()
            }
            None => self
                .match_preset_rules(preset)
                .unwrap_or_else(|| DEFAULT_POOL.to_string()),
        };

        let (entity_id, reused) = match self.pools.get_mut(&source_pool).and_then(|p| p.entities.pop()) {
            Some(mut entity) => {
                if !mgr.reset_entity(&mut entity, preset) {
                    return None;
                }
                let id = mgr.store_entity(entity)?;
                (id, true)
            }
            None => {
                let id = mgr.spawn(preset, overrides)?;
                self.pools.get_mut(&source_pool).expect("pool resolved above").stats.total_created += 1;
                (id, false)
            }
        };

        // Full-entity routing applies only when the caller did not pin a pool
        let mut final_pool = source_pool.clone();
        if target_pool.is_none() {
            if let Some(routed) = mgr.get_state(entity_id).and_then(|e| self.match_rules(e)) {
                final_pool = routed;
            }
        }

        let pool = self.pools.get_mut(&final_pool).expect("routing only yields known pools");
        pool.stats.in_use += 1;
        pool.stats.total_acquired += 1;
        mgr.set_entity_pool(entity_id, &final_pool);
        if final_pool != source_pool {
            mgr.emit(&EngineEvent::EntityMovedPool {
                entity: entity_id,
                from: source_pool,
                to: final_pool.clone(),
            });
        }

        mgr.activate(entity_id);
        mgr.emit(&EngineEvent::EntityAcquired { pool: final_pool, entity: entity_id, reused });
        Some(entity_id)
    }

    /// Park an entity back into a pool, or drop it when the pool is full.
    /// Returns whether it was parked.
    pub fn release(&mut self, mgr: &mut EntityManager, entity_id: EntityId, target_pool: Option<&str>) -> bool {
        let Some(mut entity) = mgr.extract_entity(entity_id) else {
            return false;
        };
        let pool_id = target_pool
            .map(str::to_string)
            .or_else(|| entity.pool_id.clone())
            .unwrap_or_else(|| DEFAULT_POOL.to_string());
        let pool_id = if self.pools.contains_key(&pool_id) { pool_id } else { DEFAULT_POOL.to_string() };
        let now = mgr.now_ms();

        let pool = self.pools.get_mut(&pool_id).expect("default pool always exists");
        pool.stats.in_use = pool.stats.in_use.saturating_sub(1);
        pool.stats.total_released += 1;

        let to_pool = pool.entities.len() < pool.config.max_size;
        if to_pool {
            clear_transient(&mut entity);
            entity.pool_id = Some(pool_id.clone());
            pool.entities.push(entity);
            pool.last_release = now;
            pool.shrink_pending = true;
        }

        mgr.emit(&EngineEvent::EntityReleased { pool: pool_id, entity: entity_id, to_pool });
        to_pool
    }

    /// Reassign a stored entity to another pool.
    pub fn move_to_pool(&mut self, mgr: &mut EntityManager, entity_id: EntityId, pool_id: &str) -> bool {
        if !self.pools.contains_key(pool_id) {
            return false;
        }
        let Some(previous) = mgr.get_state(entity_id).map(|e| e.pool_id.clone()) else {
            return false;
        };
        let from = previous.unwrap_or_else(|| DEFAULT_POOL.to_string());
        if from == pool_id {
            return true;
        }
        if let Some(pool) = self.pools.get_mut(&from) {
            pool.stats.in_use = pool.stats.in_use.saturating_sub(1);
        }
        if let Some(pool) = self.pools.get_mut(pool_id) {
            pool.stats.in_use += 1;
        }
        mgr.set_entity_pool(entity_id, pool_id);
        mgr.emit(&EngineEvent::EntityMovedPool {
            entity: entity_id,
            from,
            to: pool_id.to_string(),
        });
        true
    }

    /// Shed parked entities from pools that have sat quiet below the
    /// utilization bar. The host calls this from its maintenance cadence.
    pub fn maintain(&mut self, now: Millis) -> usize {
        let mut shed = 0;
        for pool in self.pools.values_mut() {
            if !pool.shrink_pending {
                continue;
            }
            if now.saturating_sub(pool.last_release) < pool.config.shrink_delay_ms {
                continue;
            }
            pool.shrink_pending = false;
            let available = pool.entities.len();
            let in_use = pool.stats.in_use;
            if available <= SHRINK_KEEP_MIN {
                continue;
            }
            let utilization = in_use as f64 / (in_use + available) as f64;
            if utilization >= pool.config.shrink_threshold {
                continue;
            }
            let keep = SHRINK_KEEP_MIN.max(available / 2);
            tracing::debug!(target: "vivarium::pool", available, keep, "shrinking idle pool");
            shed += available - keep;
            pool.entities.truncate(keep);
        }
        shed
    }

    // ------------------------------------------------------------------
    // Rule-based assignment
    // ------------------------------------------------------------------

    /// Pool an entity belongs to: its pinned pool when known, otherwise the
    /// best-scoring rule match, otherwise `default`.
    pub fn get_pool_for_entity(&self, mgr: &EntityManager, entity_id: EntityId) -> String {
        let Some(entity) = mgr.get_state(entity_id) else {
            return DEFAULT_POOL.to_string();
        };
        if let Some(pinned) = &entity.pool_id {
            if self.pools.contains_key(pinned) {
                return pinned.clone();
            }
        }
        self.match_rules(entity).unwrap_or_else(|| DEFAULT_POOL.to_string())
    }

    /// Route by the requested preset id alone, before an entity exists.
    /// Only preset-glob conditions can score at this point.
    fn match_preset_rules(&self, preset: Option<&str>) -> Option<String> {
        let preset = preset?;
        let mut matches: Vec<(&str, i32, f64)> = Vec::new();
        for id in &self.order {
            if id == DEFAULT_POOL {
                continue;
            }
            let pool = &self.pools[id];
            let Some(rules) = &pool.rules else {
                continue;
            };
            let score: f64 = rules
                .conditions
                .iter()
                .filter(|c| {
                    c.source == PoolSource::Preset
                        && c.pattern.as_deref().map(|p| glob_match(p, preset)).unwrap_or(false)
                })
                .map(|c| c.weight)
                .sum();
            if score > 0.0 {
                matches.push((id, rules.priority, score));
            }
        }
        matches.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });
        matches.first().map(|(id, _, _)| id.to_string())
    }

    fn match_rules(&self, entity: &Entity) -> Option<String> {
        let mut matches: Vec<(&str, i32, f64)> = Vec::new();
        for id in &self.order {
            if id == DEFAULT_POOL {
                continue;
            }
            let pool = &self.pools[id];
            let Some(rules) = &pool.rules else {
                continue;
            };
            let score: f64 = rules
                .conditions
                .iter()
                .filter(|c| condition_matches(entity, c))
                .map(|c| c.weight)
                .sum();
            if score > 0.0 {
                matches.push((id, rules.priority, score));
            }
        }
        matches.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
        });
        matches.first().map(|(id, _, _)| id.to_string())
    }
}

impl Default for PoolManager {
    fn default() -> Self {
        Self::new()
    }
}

fn condition_matches(entity: &Entity, condition: &PoolCondition) -> bool {
    match condition.source {
        PoolSource::Preset => {
            let (Some(pattern), Some(preset)) = (condition.pattern.as_deref(), entity.preset_id.as_deref())
            else {
                return false;
            };
            glob_match(pattern, preset)
        }
        PoolSource::Trait => condition
            .pattern
            .as_deref()
            .map(|t| entity.has_trait(t))
            .unwrap_or(false),
        PoolSource::Modifier => condition
            .pattern
            .as_deref()
            .map(|m| entity.has_modifier(m))
            .unwrap_or(false),
        PoolSource::Compound => condition
            .pattern
            .as_deref()
            .map(|c| entity.has_compound(c))
            .unwrap_or(false),
        PoolSource::Attribute => compare_node(condition, |id| entity.attributes.get(id).copied()),
        PoolSource::Variable => compare_node(condition, |id| entity.variable_value(id)),
    }
}

fn compare_node(condition: &PoolCondition, read: impl Fn(&str) -> Option<f64>) -> bool {
    let (Some(target), Some(op), Some(value)) =
        (condition.target.as_deref(), condition.operator, condition.value)
    else {
        return false;
    };
    read(target).map(|left| op.compare(left, value)).unwrap_or(false)
}

/// `*` matches any substring; everything else is literal.
fn glob_match(pattern: &str, input: &str) -> bool {
    let segments: Vec<&str> = pattern.split('*').collect();
    if segments.len() == 1 {
        return pattern == input;
    }
    let mut rest = input;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            continue;
        }
        if i == 0 {
            let Some(stripped) = rest.strip_prefix(segment) else {
                return false;
            };
            rest = stripped;
        } else if i == segments.len() - 1 {
            return rest.ends_with(segment);
        } else {
            let Some(pos) = rest.find(segment) else {
                return false;
            };
            rest = &rest[pos + segment.len()..];
        }
    }
    true
}

/// Strip per-run state while preserving structural keys, so a parked
/// entity resets cheaply.
fn clear_transient(entity: &mut Entity) {
    entity.log.clear();
    entity.modifiers.clear();
    entity.modifier_states.clear();
    entity.compounds.clear();
    for layer in entity.layers.values_mut() {
        layer.active.clear();
    }
}
