//! The Subscription Multiplexer and Health Monitor: the two stateful
//! components that own concurrency and failure semantics for the broker.

pub mod events;
pub mod health;
pub mod model;
pub mod multiplexer;

pub use events::BrokerEvent;
pub use health::{HealthConfig, HealthMonitor};
pub use model::{normalize_timeframe, timeframe_ms, Bar, SubscriptionKey};
pub use multiplexer::SubscriptionMultiplexer;
