//! Vivarium - declarative, data-driven entity simulation engine
//!
//! A configuration describes a typed graph of nodes (attributes, variables,
//! layers, traits, modifiers, compounds, derived values, actions) joined by
//! relationships. The engine generates entities from that graph and evolves
//! them over ticks: variables drift at computed rates, traits roll from
//! weighted pools, modifiers apply and expire, compounds emerge, and
//! derived formulas recompute after every relevant change.
//!
//! ```no_run
//! use vivarium::config::ConfigDocument;
//! use vivarium::engine::EntityManager;
//!
//! let doc = ConfigDocument::from_json_str(r#"{"nodes":[
//!     {"id":"hunger","kind":"variable","min":0,"max":100,"initial":60,
//!      "baseRate":-1,"changeMode":"timed","direction":"deplete"}
//! ]}"#).unwrap();
//!
//! let mut manager = EntityManager::with_seed(42);
//! manager.load_config(doc).unwrap();
//! let id = manager.generate(None).unwrap();
//! manager.activate(id);
//! manager.tick_all(Some(5.0));
//! ```

pub mod config;
pub mod core;
pub mod engine;
pub mod entity;
pub mod events;
pub mod pool;

pub use crate::config::{ConfigDocument, ConfigStore};
pub use crate::core::{Clock, EntityId, ManualClock, Result, SimError, Subscription, SystemClock};
pub use crate::engine::spawn::SpawnOverrides;
pub use crate::engine::{EntityManager, QueryFilter};
pub use crate::entity::Entity;
pub use crate::events::{EngineEvent, EventBus, EventKind};
pub use crate::pool::{PoolConfig, PoolManager, PoolRules, PoolStats};
