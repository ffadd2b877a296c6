//! The entity manager: public operation surface over one loaded config
//!
//! All mutation funnels through here. The manager owns the config store,
//! the entity store, the event bus, a seeded RNG, and the cascade batching
//! state; subsystems are free functions over those pieces, so a method
//! borrows exactly the fields it touches.

pub mod actions;
pub mod activation;
pub mod cascade;
pub mod conditions;
pub mod modifiers;
pub mod selection;
pub mod spawn;
pub mod thresholds;
pub mod tick;

use ahash::AHashMap;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde_json::Value;
use std::sync::Arc;

use crate::config::schema::{NodeKind, Operator, Preset, Relationship, RollAt};
use crate::config::{ConfigDocument, ConfigStore};
use crate::core::clock::{Clock, SystemClock};
use crate::core::error::Result;
use crate::core::types::{EntityId, Millis, Subscription};
use crate::entity::store::{EntityStore, Snapshot, StoreOutcome};
use crate::entity::Entity;
use crate::events::{EngineEvent, EventBus, EventKind};

use actions::{ActionAvailability, ActionOutcome};
use cascade::CascadeCtl;
use modifiers::ApplyConfig;
use selection::{SelectionResult, WeightedCandidate};
use spawn::SpawnOverrides;

/// Attempts before `spawn_where` gives up on matching its filter
const SPAWN_WHERE_ATTEMPTS: usize = 25;

/// Entity filter for `query` and `spawn_where`
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub preset: Option<String>,
    pub group: Option<String>,
    pub has_trait: Option<String>,
    pub has_modifier: Option<String>,
    pub has_compound: Option<String>,
    pub attribute: Option<(String, Operator, f64)>,
    pub variable: Option<(String, Operator, f64)>,
}

/// Relationships touching one node, for tooling and debugging
#[derive(Debug, Clone)]
pub struct InfluenceSummary {
    pub inbound: Vec<Relationship>,
    pub outbound: Vec<Relationship>,
}

struct AutoTickState {
    rate_ms: f64,
    last_dispatch: Millis,
}

pub struct EntityManager {
    config: Option<ConfigStore>,
    store: EntityStore,
    events: EventBus,
    rng: ChaCha8Rng,
    clock: Arc<dyn Clock>,
    ctl: CascadeCtl,
    auto_tick: Option<AutoTickState>,
    spawn_contexts: AHashMap<String, Value>,
}

impl EntityManager {
    pub fn new() -> Self {
        Self::with_rng(ChaCha8Rng::from_entropy())
    }

    /// Deterministic manager for tests and replays
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(ChaCha8Rng::seed_from_u64(seed))
    }

    fn with_rng(rng: ChaCha8Rng) -> Self {
        Self {
            config: None,
            store: EntityStore::new(1000, 50),
            events: EventBus::new(),
            rng,
            clock: Arc::new(SystemClock::new()),
            ctl: CascadeCtl::default(),
            auto_tick: None,
            spawn_contexts: AHashMap::new(),
        }
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn now_ms(&self) -> Millis {
        self.clock.now_ms()
    }

    // ------------------------------------------------------------------
    // Config
    // ------------------------------------------------------------------

    /// Build and install a config store. Existing entities are kept; their
    /// node references resolve against the new config.
    pub fn load_config(&mut self, doc: ConfigDocument) -> Result<()> {
        let cfg = ConfigStore::build(doc)?;
        self.store.max_entities = cfg.settings.max_entities;
        self.store.max_history = cfg.settings.max_history;
        self.config = Some(cfg);
        Ok(())
    }

    pub fn config(&self) -> Option<&ConfigStore> {
        self.config.as_ref()
    }

    pub fn register_preset(&mut self, id: &str, preset: Preset) -> bool {
        let Some(cfg) = self.config.as_mut() else {
            return false;
        };
        cfg.register_preset(id.to_string(), preset);
        self.events.emit(&EngineEvent::PresetRegistered { preset: id.to_string() });
        true
    }

    pub fn set_spawn_context(&mut self, key: &str, value: Value) {
        self.spawn_contexts.insert(key.to_string(), value.clone());
        self.events.emit(&EngineEvent::SpawnContextUpdated { key: key.to_string(), value });
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    pub fn on(&mut self, kind: EventKind, listener: impl FnMut(&EngineEvent) + 'static) -> Subscription {
        self.events.on(kind, listener)
    }

    pub fn off(&mut self, subscription: Subscription) -> bool {
        self.events.off(subscription)
    }

    pub fn emit(&mut self, event: &EngineEvent) {
        self.events.emit(event);
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    pub fn generate(&mut self, overrides: Option<SpawnOverrides>) -> Option<EntityId> {
        let now = self.clock.now_ms();
        let overrides = overrides.unwrap_or_default();
        let cfg = self.config.as_ref()?;
        let entity = spawn::generate(
            cfg,
            &overrides,
            &self.spawn_contexts,
            now,
            &mut self.rng,
            &mut self.ctl,
            &mut self.events,
        );
        self.finish_spawn(entity)
    }

    pub fn spawn(&mut self, preset_id: Option<&str>, overrides: Option<SpawnOverrides>) -> Option<EntityId> {
        let Some(preset_id) = preset_id else {
            return self.generate(overrides);
        };
        let now = self.clock.now_ms();
        let overrides = overrides.unwrap_or_default();
        let cfg = self.config.as_ref()?;
        let preset = cfg.preset(preset_id)?.clone();
        let entity = spawn::spawn_from_preset(
            cfg,
            preset_id,
            &preset,
            &overrides,
            &self.spawn_contexts,
            now,
            &mut self.rng,
            &mut self.ctl,
            &mut self.events,
        );
        self.finish_spawn(entity)
    }

    /// Spawn until a fresh entity matches the filter, bounded; mismatches
    /// are discarded.
    pub fn spawn_where(&mut self, filter: &QueryFilter, overrides: Option<SpawnOverrides>) -> Option<EntityId> {
        for _ in 0..SPAWN_WHERE_ATTEMPTS {
            let id = self.generate(overrides.clone())?;
            let matches = self
                .store
                .get(id)
                .map(|e| self.entity_matches(e, filter))
                .unwrap_or(false);
            if matches {
                return Some(id);
            }
            self.store.remove(id);
        }
        None
    }

    fn finish_spawn(&mut self, entity: Entity) -> Option<EntityId> {
        let (id, outcome) = self.store.store(entity);
        match outcome {
            StoreOutcome::Stored => {
                self.events.emit(&EngineEvent::EntitySpawned { entity: id });
                self.events.emit(&EngineEvent::EntityStored { entity: id });
                Some(id)
            }
            StoreOutcome::LimitReached => {
                self.events.emit(&EngineEvent::StorageLimitReached { limit: self.store.max_entities });
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Runtime
    // ------------------------------------------------------------------

    /// Advance one entity by `dt` seconds (config tick rate when omitted).
    pub fn tick(&mut self, id: EntityId, dt_seconds: Option<f64>) -> bool {
        let now = self.clock.now_ms();
        let dt = dt_seconds.unwrap_or_else(|| self.default_dt());
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        tick::tick_entity(cfg, entity, dt, now, &mut self.ctl, &mut self.events);
        true
    }

    /// Tick every active entity; returns how many ticked.
    pub fn tick_all(&mut self, dt_seconds: Option<f64>) -> usize {
        let ids = self.store.active_ids().to_vec();
        ids.into_iter().filter(|&id| self.tick(id, dt_seconds)).count()
    }

    fn default_dt(&self) -> f64 {
        self.config
            .as_ref()
            .map(|c| c.settings.tick_rate / 1000.0)
            .unwrap_or(1.0)
    }

    /// Arm the cooperative auto-tick scheduler. Idempotent.
    pub fn start_auto_tick(&mut self, rate_ms: Option<f64>) {
        if self.auto_tick.is_some() {
            return;
        }
        let rate = rate_ms
            .or_else(|| self.config.as_ref().map(|c| c.settings.tick_rate))
            .unwrap_or(1000.0)
            .max(1.0);
        self.auto_tick = Some(AutoTickState { rate_ms: rate, last_dispatch: self.clock.now_ms() });
        self.events.emit(&EngineEvent::AutoTickStarted { rate_ms: rate });
    }

    pub fn stop_auto_tick(&mut self) -> bool {
        if self.auto_tick.take().is_some() {
            self.events.emit(&EngineEvent::AutoTickStopped);
            true
        } else {
            false
        }
    }

    /// Dispatch every tick that has come due since the last pump. The host
    /// drives this from its own loop; handlers run to completion between
    /// dispatches.
    pub fn pump_auto_tick(&mut self) -> usize {
        let Some(state) = self.auto_tick.as_ref() else {
            return 0;
        };
        let rate_ms = state.rate_ms;
        let mut last = state.last_dispatch;
        let now = self.clock.now_ms();
        let step = rate_ms as Millis;

        let mut dispatched = 0;
        while now.saturating_sub(last) >= step {
            last += step;
            self.tick_all(Some(rate_ms / 1000.0));
            dispatched += 1;
        }
        if let Some(state) = self.auto_tick.as_mut() {
            state.last_dispatch = last;
        }
        dispatched
    }

    // ------------------------------------------------------------------
    // Variables
    // ------------------------------------------------------------------

    pub fn modify_variable(&mut self, id: EntityId, variable: &str, delta: f64) -> bool {
        let Some(current) = self.store.get(id).and_then(|e| e.variable_value(variable)) else {
            return false;
        };
        self.write_variable(id, variable, current + delta)
    }

    pub fn set_variable(&mut self, id: EntityId, variable: &str, value: f64) -> bool {
        self.write_variable(id, variable, value)
    }

    fn write_variable(&mut self, id: EntityId, variable: &str, new_value: f64) -> bool {
        let now = self.clock.now_ms();
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        let Some(var) = entity.variables.get_mut(variable) else {
            return false;
        };
        let old = var.value;
        let new = new_value.clamp(var.min, var.max);
        if new == old {
            return true;
        }
        var.value = new;

        cascade::begin_batch(&mut self.ctl);
        thresholds::check_variable_thresholds(cfg, entity, variable, &mut self.ctl, &mut self.events);
        self.events.emit(&EngineEvent::VariableChanged {
            entity: id,
            variable: variable.to_string(),
            from: old,
            to: new,
        });
        cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        thresholds::check_modifier_thresholds(cfg, entity, now, &mut self.ctl, &mut self.events);
        cascade::end_batch(cfg, entity, &mut self.ctl, &mut self.events);
        true
    }

    // ------------------------------------------------------------------
    // Traits
    // ------------------------------------------------------------------

    pub fn activate_trait(&mut self, id: EntityId, trait_id: &str) -> bool {
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        if !activation::activate_trait(cfg, entity, trait_id, &mut self.events) {
            return false;
        }
        cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        true
    }

    pub fn deactivate_trait(&mut self, id: EntityId, trait_id: &str) -> bool {
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        if !activation::deactivate_trait(cfg, entity, trait_id, &mut self.events) {
            return false;
        }
        cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        true
    }

    /// Re-roll a layer once. Layers that already rolled require
    /// `timing.rerollAllowed`.
    pub fn roll_layer(&mut self, id: EntityId, layer_id: &str) -> SelectionResult {
        self.roll_outcome(id, layer_id, 1)
    }

    /// Roll a layer `n` times, activating each result.
    pub fn roll_outcome(&mut self, id: EntityId, layer_id: &str, n: usize) -> SelectionResult {
        let now = self.clock.now_ms();
        let Some(cfg) = self.config.as_ref() else {
            return SelectionResult::default();
        };
        let Some(entity) = self.store.get_mut(id) else {
            return SelectionResult::default();
        };
        let Some(layer) = cfg.layer(layer_id) else {
            return SelectionResult::default();
        };
        if entity
            .layers
            .get(layer_id)
            .map(|l| l.last_roll.is_some())
            .unwrap_or(false)
            && !layer.timing.reroll_allowed
        {
            return SelectionResult::default();
        }
        let activated =
            spawn::roll_layer_into(cfg, entity, layer_id, n, now, &mut self.rng, &mut self.events);
        if activated.is_empty() {
            return SelectionResult { selected: Vec::new(), no_eligible: true };
        }
        cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        SelectionResult { selected: activated, no_eligible: false }
    }

    // ------------------------------------------------------------------
    // Modifiers
    // ------------------------------------------------------------------

    pub fn apply_modifier(&mut self, id: EntityId, modifier_id: &str, overrides: Option<ApplyConfig>) -> bool {
        let now = self.clock.now_ms();
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        modifiers::apply(
            cfg,
            entity,
            modifier_id,
            overrides.as_ref(),
            now,
            false,
            &mut self.ctl,
            &mut self.events,
        )
    }

    pub fn remove_modifier(&mut self, id: EntityId, modifier_id: &str) -> bool {
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        modifiers::remove(cfg, entity, modifier_id, &mut self.ctl, &mut self.events)
    }

    // ------------------------------------------------------------------
    // Actions
    // ------------------------------------------------------------------

    pub fn is_action_available(&self, id: EntityId, action_id: &str) -> ActionAvailability {
        let (Some(cfg), Some(entity)) = (self.config.as_ref(), self.store.get(id)) else {
            return ActionAvailability::no("entity not found");
        };
        actions::is_available(cfg, entity, action_id)
    }

    pub fn get_available_actions(&self, id: EntityId) -> Vec<String> {
        let (Some(cfg), Some(entity)) = (self.config.as_ref(), self.store.get(id)) else {
            return Vec::new();
        };
        actions::available_actions(cfg, entity)
    }

    pub fn select_action(&mut self, id: EntityId) -> Option<String> {
        let (Some(cfg), Some(entity)) = (self.config.as_ref(), self.store.get(id)) else {
            return None;
        };
        actions::select_action(cfg, entity, &mut self.rng)
    }

    pub fn execute_action(&mut self, id: EntityId, action_id: &str) -> ActionOutcome {
        let Some(cfg) = self.config.as_ref() else {
            return ActionOutcome { executed: false, effects: Value::Null, reason: Some("no config".into()) };
        };
        let Some(entity) = self.store.get_mut(id) else {
            return ActionOutcome { executed: false, effects: Value::Null, reason: Some("entity not found".into()) };
        };
        actions::execute(cfg, entity, action_id, &mut self.ctl, &mut self.events)
    }

    pub fn get_action_cooldown(&self, id: EntityId, action_id: &str) -> Option<f64> {
        self.store
            .get(id)
            .and_then(|e| e.actions.get(action_id))
            .map(|a| a.cooldown_remaining)
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    pub fn get_state(&self, id: EntityId) -> Option<&Entity> {
        self.store.get(id)
    }

    pub fn query(&self, filter: &QueryFilter) -> Vec<EntityId> {
        self.store
            .all_ids()
            .filter(|&id| {
                self.store
                    .get(id)
                    .map(|e| self.entity_matches(e, filter))
                    .unwrap_or(false)
            })
            .collect()
    }

    fn entity_matches(&self, entity: &Entity, filter: &QueryFilter) -> bool {
        if let Some(preset) = &filter.preset {
            if entity.preset_id.as_deref() != Some(preset.as_str()) {
                return false;
            }
        }
        if let Some(group) = &filter.group {
            let member = self
                .store
                .group(group)
                .map(|ids| ids.contains(&entity.id))
                .unwrap_or(false);
            if !member {
                return false;
            }
        }
        if let Some(trait_id) = &filter.has_trait {
            if !entity.has_trait(trait_id) {
                return false;
            }
        }
        if let Some(modifier) = &filter.has_modifier {
            if !entity.has_modifier(modifier) {
                return false;
            }
        }
        if let Some(compound) = &filter.has_compound {
            if !entity.has_compound(compound) {
                return false;
            }
        }
        if let Some((attribute, op, value)) = &filter.attribute {
            let passes = entity
                .attributes
                .get(attribute)
                .map(|left| op.compare(*left, *value))
                .unwrap_or(false);
            if !passes {
                return false;
            }
        }
        if let Some((variable, op, value)) = &filter.variable {
            let passes = entity
                .variable_value(variable)
                .map(|left| op.compare(left, *value))
                .unwrap_or(false);
            if !passes {
                return false;
            }
        }
        true
    }

    /// Current selection weights for a layer, without rolling.
    pub fn get_weights(&self, id: EntityId, layer_id: &str) -> Vec<WeightedCandidate> {
        let (Some(cfg), Some(entity)) = (self.config.as_ref(), self.store.get(id)) else {
            return Vec::new();
        };
        selection::compute_weights(cfg, entity, layer_id)
    }

    pub fn preview_influences(&self, node_id: &str) -> Option<InfluenceSummary> {
        let cfg = self.config.as_ref()?;
        cfg.node(node_id)?;
        Some(InfluenceSummary {
            inbound: cfg.relationships_to(node_id).cloned().collect(),
            outbound: cfg.relationships_from(node_id).cloned().collect(),
        })
    }

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------

    /// Store an externally-built entity.
    pub fn store_entity(&mut self, entity: Entity) -> Option<EntityId> {
        let (id, outcome) = self.store.store(entity);
        match outcome {
            StoreOutcome::Stored => {
                self.events.emit(&EngineEvent::EntityStored { entity: id });
                Some(id)
            }
            StoreOutcome::LimitReached => {
                self.events.emit(&EngineEvent::StorageLimitReached { limit: self.store.max_entities });
                None
            }
        }
    }

    pub fn activate(&mut self, id: EntityId) -> bool {
        if self.store.activate(id) {
            self.events.emit(&EngineEvent::EntityActivated { entity: id });
            true
        } else {
            false
        }
    }

    pub fn deactivate(&mut self, id: EntityId) -> bool {
        if self.store.deactivate(id) {
            self.events.emit(&EngineEvent::EntityDeactivated { entity: id });
            true
        } else {
            false
        }
    }

    pub fn remove(&mut self, id: EntityId) -> bool {
        if self.store.remove(id).is_some() {
            self.events.emit(&EngineEvent::EntityRemoved { entity: id });
            true
        } else {
            false
        }
    }

    /// Pull an entity out of storage without the removal event; pool
    /// recycling owns the entity afterwards.
    pub fn extract_entity(&mut self, id: EntityId) -> Option<Entity> {
        self.store.deactivate(id);
        self.store.remove(id)
    }

    pub fn snapshot(&mut self, id: EntityId) -> bool {
        let at = self.clock.now_ms();
        if self.store.snapshot(id, at) {
            self.events.emit(&EngineEvent::SnapshotTaken { entity: id, at });
            true
        } else {
            false
        }
    }

    /// Restore the newest snapshot at or before `timestamp`; rates are
    /// recomputed by a fresh cascade rather than restored.
    pub fn rollback(&mut self, id: EntityId, timestamp: Millis) -> bool {
        if !self.store.rollback(id, timestamp) {
            return false;
        }
        if let (Some(cfg), Some(entity)) = (self.config.as_ref(), self.store.get_mut(id)) {
            cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        }
        self.events.emit(&EngineEvent::EntityRolledBack { entity: id, to: timestamp });
        true
    }

    pub fn get_history(&self, id: EntityId) -> Vec<&Snapshot> {
        self.store.history(id).collect()
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    pub fn create_group(&mut self, name: &str) -> bool {
        if self.store.create_group(name) {
            self.events.emit(&EngineEvent::GroupCreated { group: name.to_string() });
            true
        } else {
            false
        }
    }

    pub fn add_to_group(&mut self, name: &str, id: EntityId) -> bool {
        if self.store.add_to_group(name, id) {
            self.events.emit(&EngineEvent::AddedToGroup { group: name.to_string(), entity: id });
            true
        } else {
            false
        }
    }

    pub fn remove_from_group(&mut self, name: &str, id: EntityId) -> bool {
        self.store.remove_from_group(name, id)
    }

    pub fn get_group(&self, name: &str) -> Option<&[EntityId]> {
        self.store.group(name)
    }

    pub fn list_groups(&self) -> Vec<&str> {
        self.store.group_names().collect()
    }

    pub fn delete_group(&mut self, name: &str) -> bool {
        self.store.delete_group(name)
    }

    pub fn entity_count(&self) -> usize {
        self.store.len()
    }

    pub fn active_ids(&self) -> &[EntityId] {
        self.store.active_ids()
    }

    pub fn stored_ids(&self) -> &[EntityId] {
        self.store.stored_ids()
    }

    pub fn cascade_runs(&self) -> u64 {
        self.ctl.runs
    }

    // ------------------------------------------------------------------
    // Pool support
    // ------------------------------------------------------------------

    /// Pin a stored entity to a pool id.
    pub fn set_entity_pool(&mut self, id: EntityId, pool_id: &str) -> bool {
        let Some(entity) = self.store.get_mut(id) else {
            return false;
        };
        entity.pool_id = Some(pool_id.to_string());
        true
    }

    /// Recycle a pooled entity in place: fresh id and creation time,
    /// re-rolled attributes and layers, variables back to initial, all
    /// transient state cleared, preset traits re-forced.
    pub fn reset_entity(&mut self, entity: &mut Entity, preset_id: Option<&str>) -> bool {
        let now = self.clock.now_ms();
        let Some(cfg) = self.config.as_ref() else {
            return false;
        };
        entity.id = EntityId::new();
        entity.created_at = now;
        entity.last_tick = now;
        if preset_id.is_some() {
            entity.preset_id = preset_id.map(str::to_string);
        }

        let resolved = entity
            .preset_id
            .as_deref()
            .and_then(|p| cfg.preset(p))
            .cloned()
            .map(|preset| spawn::resolve_preset(cfg, &preset, &mut self.rng));

        for layer in entity.layers.values_mut() {
            layer.active.clear();
            layer.last_roll = None;
        }
        entity.modifiers.clear();
        entity.modifier_states.clear();
        entity.compounds.clear();
        entity.derived.clear();
        entity.log.clear();
        for (id, var) in entity.variables.iter_mut() {
            if let Some(def) = cfg.variable(id) {
                var.value = def.initial.clamp(def.min, def.max);
                var.base_rate = def.base_rate;
                var.current_rate = def.base_rate;
            }
        }
        for action in entity.actions.values_mut() {
            action.cooldown_remaining = 0.0;
        }

        let preset_attributes = resolved.as_ref().map(|r| r.attributes.clone()).unwrap_or_default();
        for id in cfg.ids_of_kind(NodeKind::Attribute).to_vec() {
            let value = match preset_attributes.get(&id) {
                Some(v) => *v,
                None => spawn::roll_attribute(cfg, entity, &id, &mut self.rng),
            };
            entity.attributes.insert(id, value);
        }

        for layer_id in cfg.ids_of_kind(NodeKind::Layer).to_vec() {
            let Some(layer) = cfg.layer(&layer_id) else {
                continue;
            };
            if matches!(layer.timing.roll_at, RollAt::Spawn | RollAt::Create) {
                let rolls = layer.selection.initial_rolls;
                spawn::roll_layer_into(cfg, entity, &layer_id, rolls, now, &mut self.rng, &mut self.events);
            }
        }

        if let Some(resolved) = resolved {
            activation::force_activate_all(cfg, entity, &resolved.forced_traits, &mut self.ctl, &mut self.events);
        }
        cascade::run(cfg, entity, &mut self.ctl, &mut self.events);
        entity.log.push(now, "reset", "");
        true
    }
}

impl Default for EntityManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;

    fn hunger_doc() -> ConfigDocument {
        ConfigDocument::from_json_str(
            r#"{"id":"creatures","nodes":[
                {"id":"hunger","kind":"variable","min":0,"max":100,"initial":60,
                 "baseRate":-10,"changeMode":"timed","direction":"deplete"},
                {"id":"mood","kind":"layer","timing":{"rollAt":"never"}},
                {"id":"grumpy","kind":"trait","layerId":"mood",
                 "selection":{"trigger":{"target":"hunger","operator":"<=","value":20},
                              "autoRemove":{"target":"hunger","operator":">=","value":40}}}
            ]}"#,
        )
        .unwrap()
    }

    fn manager() -> (EntityManager, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let mut mgr = EntityManager::with_seed(7);
        mgr.set_clock(clock.clone());
        (mgr, clock)
    }

    #[test]
    fn test_spawn_requires_config() {
        let (mut mgr, _) = manager();
        assert!(mgr.generate(None).is_none());
    }

    #[test]
    fn test_variable_write_clamps_and_fires_thresholds() {
        let (mut mgr, _) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let id = mgr.generate(None).unwrap();

        assert!(mgr.set_variable(id, "hunger", -50.0));
        assert_eq!(mgr.get_state(id).unwrap().variables["hunger"].value, 0.0);
        assert!(mgr.get_state(id).unwrap().has_trait("grumpy"));

        assert!(mgr.set_variable(id, "hunger", 50.0));
        assert!(!mgr.get_state(id).unwrap().has_trait("grumpy"));
    }

    #[test]
    fn test_unknown_ids_are_falsy() {
        let (mut mgr, _) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let ghost = EntityId::new();
        assert!(!mgr.tick(ghost, None));
        assert!(!mgr.set_variable(ghost, "hunger", 1.0));
        assert!(!mgr.remove(ghost));
        assert!(mgr.get_state(ghost).is_none());
    }

    #[test]
    fn test_tick_all_only_touches_active() {
        let (mut mgr, _) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let a = mgr.generate(None).unwrap();
        let b = mgr.generate(None).unwrap();
        mgr.activate(a);

        assert_eq!(mgr.tick_all(Some(1.0)), 1);
        assert_eq!(mgr.get_state(a).unwrap().variables["hunger"].value, 50.0);
        assert_eq!(mgr.get_state(b).unwrap().variables["hunger"].value, 60.0);
    }

    #[test]
    fn test_auto_tick_pump_dispatches_due_ticks() {
        let (mut mgr, clock) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let id = mgr.generate(None).unwrap();
        mgr.activate(id);

        mgr.start_auto_tick(Some(1000.0));
        mgr.start_auto_tick(Some(5.0)); // idempotent, keeps the first rate
        assert_eq!(mgr.pump_auto_tick(), 0, "nothing due yet");

        clock.advance(3_500);
        assert_eq!(mgr.pump_auto_tick(), 3);
        assert_eq!(mgr.get_state(id).unwrap().variables["hunger"].value, 30.0);

        assert!(mgr.stop_auto_tick());
        assert!(!mgr.stop_auto_tick());
        clock.advance(10_000);
        assert_eq!(mgr.pump_auto_tick(), 0);
    }

    #[test]
    fn test_query_by_trait_and_variable() {
        let (mut mgr, _) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let hungry = mgr.generate(None).unwrap();
        let fed = mgr.generate(None).unwrap();
        mgr.set_variable(hungry, "hunger", 10.0);

        let filter = QueryFilter { has_trait: Some("grumpy".into()), ..QueryFilter::default() };
        assert_eq!(mgr.query(&filter), [hungry]);

        let filter = QueryFilter {
            variable: Some(("hunger".into(), Operator::Gte, 50.0)),
            ..QueryFilter::default()
        };
        assert_eq!(mgr.query(&filter), [fed]);
    }

    #[test]
    fn test_snapshot_rollback_restores_state() {
        let (mut mgr, clock) = manager();
        mgr.load_config(hunger_doc()).unwrap();
        let id = mgr.generate(None).unwrap();

        clock.advance(100);
        mgr.snapshot(id);
        clock.advance(100);
        mgr.set_variable(id, "hunger", 5.0);
        assert!(mgr.get_state(id).unwrap().has_trait("grumpy"));

        assert!(mgr.rollback(id, 150));
        let entity = mgr.get_state(id).unwrap();
        assert_eq!(entity.variables["hunger"].value, 60.0);
        assert!(!entity.has_trait("grumpy"));
    }

    #[test]
    fn test_reroll_gated_by_timing() {
        let (mut mgr, _) = manager();
        mgr.load_config(
            ConfigDocument::from_json_str(
                r#"{"nodes":[
                    {"id":"mood","kind":"layer","timing":{"rollAt":"spawn","rerollAllowed":false}},
                    {"id":"stoic","kind":"trait","layerId":"mood"},
                    {"id":"giddy","kind":"trait","layerId":"mood"}
                ]}"#,
            )
            .unwrap(),
        )
        .unwrap();
        let id = mgr.generate(None).unwrap();
        assert_eq!(mgr.get_state(id).unwrap().layers["mood"].active.len(), 1);

        let result = mgr.roll_layer(id, "mood");
        assert!(result.selected.is_empty(), "reroll refused");
    }
}
