pub mod clock;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, SimError};
pub use types::{EntityId, Millis, NodeId, Subscription, Tick};
