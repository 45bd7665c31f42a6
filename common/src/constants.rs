//! Small constants shared across crates.
//!
//! Single source of truth, same intent as the teacher's `constants.rs`,
//! scoped down to what this broker actually needs.

/// Default WebSocket client-front listen port.
pub const DEFAULT_WEBSOCKET_PORT: u16 = 8081;

/// Default Prometheus metrics port.
pub const DEFAULT_METRICS_PORT: u16 = 9100;

/// Default Health HTTP API port.
pub const DEFAULT_HEALTH_PORT: u16 = 8082;

/// Default upstream connect timeout in milliseconds.
pub const DEFAULT_UPSTREAM_TIMEOUT_MS: u64 = 10_000;

/// `fullReconnect` settle delay.
pub const FULL_RECONNECT_SETTLE_MS: u64 = 2_000;

/// Reconnect backoff base delay.
pub const RECONNECT_BACKOFF_BASE_SECS: f64 = 5.0;

/// Reconnect backoff growth factor.
pub const RECONNECT_BACKOFF_FACTOR: f64 = 1.5;

/// Reconnect backoff cap.
pub const RECONNECT_BACKOFF_CAP_SECS: f64 = 60.0;

/// Maximum reconnect attempts before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Individual recovery settle delay between unsubscribe and resubscribe.
pub const RECOVERY_SETTLE_SECS: u64 = 1;

/// Upstream provider's streaming WebSocket endpoint.
pub const TRADINGVIEW_WS_URL: &str = "wss://data.tradingview.com/socket.io/websocket";
