//! The Upstream Driver contract.
//!
//! The broker treats the upstream provider as an opaque collaborator: a
//! session that hands out per-instrument chart handles, each of which fires
//! callbacks as bars arrive. In idiomatic Rust the callback registration
//! (`onUpdate`, `onError`, `onSymbolLoaded`) becomes a channel the
//! multiplexer reads from, handed back alongside the chart handle used for
//! `setMarket`/`delete`.

use async_trait::async_trait;
use common::BrokerError;
use tokio::sync::mpsc;

/// One OHLCV period as reported by the driver, before canonicalization.
///
/// The driver is free to report either `high`/`low` or the TradingView-style
/// `max`/`min` synonyms; `volume` is optional and defaults to `0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPeriod {
    /// Unix seconds.
    pub time: i64,
    pub open: f64,
    pub close: f64,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub max: Option<f64>,
    pub min: Option<f64>,
    pub volume: Option<f64>,
}

impl RawPeriod {
    /// Resolve the high, accepting `max` as a synonym.
    #[must_use]
    pub fn resolved_high(&self) -> f64 {
        self.high.or(self.max).unwrap_or(self.close)
    }

    /// Resolve the low, accepting `min` as a synonym.
    #[must_use]
    pub fn resolved_low(&self) -> f64 {
        self.low.or(self.min).unwrap_or(self.close)
    }

    /// Resolve volume, defaulting to `0` when absent.
    #[must_use]
    pub fn resolved_volume(&self) -> f64 {
        self.volume.unwrap_or(0.0)
    }
}

/// Events a chart handle can fire, corresponding to the driver's
/// `onUpdate`/`onError`/`onSymbolLoaded` callbacks.
#[derive(Debug, Clone)]
pub enum ChartEvent {
    /// `chart.onUpdate` — `chart.periods[0]` changed.
    Update(RawPeriod),
    /// `chart.onSymbolLoaded`.
    SymbolLoaded,
    /// `chart.onError` — carries the driver's error text.
    Error(String),
}

/// A chart handle bound to a single `(symbol, timeframe)`.
#[async_trait]
pub trait ChartHandle: Send + Sync {
    /// `chart.setMarket(symbol, {timeframe})`.
    async fn set_market(&self, symbol: &str, timeframe: &str) -> Result<(), BrokerError>;

    /// `chart.delete()`. Errors are logged by the caller, never propagated
    /// into map mutation.
    async fn delete(&self) -> Result<(), BrokerError>;
}

/// Result of `Session.Chart()`: the handle plus the event stream wired to
/// its callbacks.
pub struct OpenedChart {
    pub handle: Box<dyn ChartHandle>,
    pub events: mpsc::Receiver<ChartEvent>,
}

/// The upstream session contract consumed by the Subscription Multiplexer.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Opens (or re-opens) the upstream session. Implementations own their
    /// own reconnect/backoff policy internally; a new explicit call resets
    /// any backoff counter.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// `Session.Chart()` — opens a new per-instrument chart handle.
    async fn open_chart(&self) -> Result<OpenedChart, BrokerError>;

    /// `client.end()` — closes the session.
    async fn end(&self) -> Result<(), BrokerError>;

    /// Whether the session is currently connected.
    fn is_connected(&self) -> bool;
}
