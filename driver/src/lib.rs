//! Adapter crate for the upstream streaming OHLCV provider.
//!
//! Exposes the [`UpstreamClient`]/[`ChartHandle`] contract consumed by the
//! broker crate's Subscription Multiplexer, a concrete WebSocket-backed
//! implementation ([`tradingview::TradingViewClient`]), and a fake
//! implementation for tests ([`testing::FakeUpstreamClient`]).

pub mod backoff;
pub mod contract;
pub mod protocol;
pub mod testing;
pub mod tradingview;

pub use contract::{ChartEvent, ChartHandle, OpenedChart, RawPeriod, UpstreamClient};
pub use tradingview::{TradingViewClient, TradingViewConfig};
