//! Lifecycle event bus
//!
//! Typed events, dispatched synchronously to subscribers in subscription
//! order. Stats and state are always settled before emission, so listeners
//! observe consistent counts. Subscribing returns a handle; dropping it does
//! nothing, `off` removes the listener.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::types::{EntityId, Millis, Subscription};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EngineEvent {
    EntitySpawned { entity: EntityId },
    EntityStored { entity: EntityId },
    EntityActivated { entity: EntityId },
    EntityDeactivated { entity: EntityId },
    EntityRemoved { entity: EntityId },
    VariableChanged { entity: EntityId, variable: String, from: f64, to: f64 },
    ModifierApplied { entity: EntityId, modifier: String, stacks: u32 },
    ModifierRemoved { entity: EntityId, modifier: String },
    TraitActivated { entity: EntityId, layer: String, trait_id: String },
    TraitDeactivated { entity: EntityId, layer: String, trait_id: String },
    CompoundActivated { entity: EntityId, compound: String },
    CompoundDeactivated { entity: EntityId, compound: String },
    Tick { entity: EntityId, dt: f64 },
    AutoTickStarted { rate_ms: f64 },
    AutoTickStopped,
    SnapshotTaken { entity: EntityId, at: Millis },
    EntityRolledBack { entity: EntityId, to: Millis },
    SpawnContextUpdated { key: String, value: Value },
    PresetRegistered { preset: String },
    GroupCreated { group: String },
    AddedToGroup { group: String, entity: EntityId },
    EntityAcquired { pool: String, entity: EntityId, reused: bool },
    EntityReleased { pool: String, entity: EntityId, to_pool: bool },
    PoolCreated { pool: String },
    PoolRemoved { pool: String },
    PoolConfigured { pool: String },
    PoolRulesUpdated { pool: String },
    EntityMovedPool { entity: EntityId, from: String, to: String },
    StorageLimitReached { limit: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    EntitySpawned,
    EntityStored,
    EntityActivated,
    EntityDeactivated,
    EntityRemoved,
    VariableChanged,
    ModifierApplied,
    ModifierRemoved,
    TraitActivated,
    TraitDeactivated,
    CompoundActivated,
    CompoundDeactivated,
    Tick,
    AutoTickStarted,
    AutoTickStopped,
    SnapshotTaken,
    EntityRolledBack,
    SpawnContextUpdated,
    PresetRegistered,
    GroupCreated,
    AddedToGroup,
    EntityAcquired,
    EntityReleased,
    PoolCreated,
    PoolRemoved,
    PoolConfigured,
    PoolRulesUpdated,
    EntityMovedPool,
    StorageLimitReached,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::EntitySpawned { .. } => EventKind::EntitySpawned,
            EngineEvent::EntityStored { .. } => EventKind::EntityStored,
            EngineEvent::EntityActivated { .. } => EventKind::EntityActivated,
            EngineEvent::EntityDeactivated { .. } => EventKind::EntityDeactivated,
            EngineEvent::EntityRemoved { .. } => EventKind::EntityRemoved,
            EngineEvent::VariableChanged { .. } => EventKind::VariableChanged,
            EngineEvent::ModifierApplied { .. } => EventKind::ModifierApplied,
            EngineEvent::ModifierRemoved { .. } => EventKind::ModifierRemoved,
            EngineEvent::TraitActivated { .. } => EventKind::TraitActivated,
            EngineEvent::TraitDeactivated { .. } => EventKind::TraitDeactivated,
            EngineEvent::CompoundActivated { .. } => EventKind::CompoundActivated,
            EngineEvent::CompoundDeactivated { .. } => EventKind::CompoundDeactivated,
            EngineEvent::Tick { .. } => EventKind::Tick,
            EngineEvent::AutoTickStarted { .. } => EventKind::AutoTickStarted,
            EngineEvent::AutoTickStopped => EventKind::AutoTickStopped,
            EngineEvent::SnapshotTaken { .. } => EventKind::SnapshotTaken,
            EngineEvent::EntityRolledBack { .. } => EventKind::EntityRolledBack,
            EngineEvent::SpawnContextUpdated { .. } => EventKind::SpawnContextUpdated,
            EngineEvent::PresetRegistered { .. } => EventKind::PresetRegistered,
            EngineEvent::GroupCreated { .. } => EventKind::GroupCreated,
            EngineEvent::AddedToGroup { .. } => EventKind::AddedToGroup,
            EngineEvent::EntityAcquired { .. } => EventKind::EntityAcquired,
            EngineEvent::EntityReleased { .. } => EventKind::EntityReleased,
            EngineEvent::PoolCreated { .. } => EventKind::PoolCreated,
            EngineEvent::PoolRemoved { .. } => EventKind::PoolRemoved,
            EngineEvent::PoolConfigured { .. } => EventKind::PoolConfigured,
            EngineEvent::PoolRulesUpdated { .. } => EventKind::PoolRulesUpdated,
            EngineEvent::EntityMovedPool { .. } => EventKind::EntityMovedPool,
            EngineEvent::StorageLimitReached { .. } => EventKind::StorageLimitReached,
        }
    }
}

type Listener = Box<dyn FnMut(&EngineEvent)>;

#[derive(Default)]
pub struct EventBus {
    listeners: AHashMap<EventKind, Vec<(u64, Listener)>>,
    next_token: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, listener: impl FnMut(&EngineEvent) + 'static) -> Subscription {
        let token = self.next_token;
        self.next_token += 1;
        self.listeners.entry(kind).or_default().push((token, Box::new(listener)));
        Subscription(token)
    }

    pub fn off(&mut self, subscription: Subscription) -> bool {
        for listeners in self.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(token, _)| *token != subscription.0);
            if listeners.len() != before {
                return true;
            }
        }
        false
    }

    pub fn emit(&mut self, event: &EngineEvent) {
        if let Some(listeners) = self.listeners.get_mut(&event.kind()) {
            for (_, listener) in listeners.iter_mut() {
                listener(event);
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners.get(&kind).map(Vec::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_listeners_fire_in_subscription_order() {
        let mut bus = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let first = seen.clone();
        bus.on(EventKind::Tick, move |_| first.borrow_mut().push(1));
        let second = seen.clone();
        bus.on(EventKind::Tick, move |_| second.borrow_mut().push(2));

        bus.emit(&EngineEvent::Tick { entity: EntityId::new(), dt: 1.0 });
        assert_eq!(*seen.borrow(), [1, 2]);
    }

    #[test]
    fn test_off_removes_listener() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));

        let counter = count.clone();
        let sub = bus.on(EventKind::AutoTickStopped, move |_| *counter.borrow_mut() += 1);

        bus.emit(&EngineEvent::AutoTickStopped);
        assert!(bus.off(sub));
        assert!(!bus.off(sub), "double-off reports false");
        bus.emit(&EngineEvent::AutoTickStopped);

        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn test_unrelated_kinds_not_dispatched() {
        let mut bus = EventBus::new();
        let count = Rc::new(RefCell::new(0));
        let counter = count.clone();
        bus.on(EventKind::EntitySpawned, move |_| *counter.borrow_mut() += 1);

        bus.emit(&EngineEvent::AutoTickStopped);
        assert_eq!(*count.borrow(), 0);
    }
}
