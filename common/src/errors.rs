//! Error taxonomy shared by the driver, broker and gateway crates.
//!
//! Transient upstream failures are recoverable and never unwind past a task
//! boundary; configuration errors are fatal at startup.

use thiserror::Error;

/// Errors surfaced by the subscription multiplexer and health monitor.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The upstream driver rejected a connect/subscribe/teardown call.
    #[error("upstream driver error: {0}")]
    Driver(String),

    /// No active session exists for an operation that requires one.
    #[error("not connected to upstream")]
    NotConnected,

    /// A chart/session wiring step failed (callback registration, `setMarket`, ...).
    #[error("subscription wiring failed for {symbol}/{timeframe}: {reason}")]
    SubscriptionFailed {
        /// Symbol the failed subscription was for.
        symbol: String,
        /// Normalized timeframe the failed subscription was for.
        timeframe: String,
        /// Driver-reported reason.
        reason: String,
    },

    /// Reconnect budget exhausted.
    #[error("max reconnect attempts exhausted")]
    MaxReconnectAttempts,
}

/// Fatal startup errors — these terminate the process.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable held a value that failed to parse.
    #[error("invalid value for {var}: {source}")]
    InvalidValue {
        /// Name of the offending environment variable.
        var: &'static str,
        /// Underlying parse error, stringified.
        source: String,
    },

    /// `SUBSCRIPTIONS` was set but was not valid JSON / did not match the schema.
    #[error("malformed SUBSCRIPTIONS: {0}")]
    MalformedSubscriptions(String),
}
