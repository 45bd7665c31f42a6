//! Events emitted by the Subscription Multiplexer. Listeners (the Health
//! Monitor, the Bar Fan-out) subscribe to a broadcast channel rather than
//! registering callbacks, the channel-per-listener translation of the
//! source's `on`/`emit` pattern (spec §9 design note).

use crate::model::{Bar, SubscriptionKey};
use tokio::sync::broadcast;

/// Default capacity of the event broadcast channel. Sized generously so a
/// temporarily lagging listener (the Health Monitor mid-scan) doesn't miss
/// events under normal load; a listener that falls behind this many events
/// sees `RecvError::Lagged` and must resynchronize from `list()`.
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub enum BrokerEvent {
    Bar { key: SubscriptionKey, bar: Bar },
    Subscribed { key: SubscriptionKey },
    Unsubscribed { key: SubscriptionKey },
    Connect,
    Disconnect,
    Error { message: String },
    SubscriptionError { key: SubscriptionKey, reason: String },
    MaxReconnectAttempts,
}

/// Creates the broadcast bus used by the Multiplexer. Returns the sender
/// kept by the Multiplexer; listeners call `.subscribe()` on a clone.
#[must_use]
pub fn new_bus() -> broadcast::Sender<BrokerEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
