//! An in-memory [`UpstreamClient`] for exercising the broker and gateway
//! crates without a real upstream socket.
//!
//! Grounded on the generic test connector pattern in the teacher's connector
//! factory: a lightweight stand-in that records calls and lets the test
//! drive events directly, rather than a full protocol mock.

use crate::contract::{ChartHandle, ChartEvent, OpenedChart, RawPeriod, UpstreamClient};
use async_trait::async_trait;
use common::BrokerError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct FakeChart {
    tx: mpsc::Sender<ChartEvent>,
    binding: Mutex<Option<(String, String)>>,
}

struct FakeInner {
    connected: AtomicBool,
    fail_next_connect: AtomicBool,
    charts: DashMap<u64, FakeChart>,
    by_key: DashMap<(String, String), u64>,
    next_id: AtomicU64,
    opens: AtomicU64,
    deletes: AtomicU64,
}

/// A fake upstream driver for tests. Starts disconnected; call
/// [`FakeUpstreamClient::connect`] (via the trait) or
/// [`FakeUpstreamClient::set_connected`] before opening charts.
#[derive(Clone)]
pub struct FakeUpstreamClient {
    inner: Arc<FakeInner>,
}

impl Default for FakeUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeUpstreamClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FakeInner {
                connected: AtomicBool::new(false),
                fail_next_connect: AtomicBool::new(false),
                charts: DashMap::new(),
                by_key: DashMap::new(),
                next_id: AtomicU64::new(0),
                opens: AtomicU64::new(0),
                deletes: AtomicU64::new(0),
            }),
        }
    }

    pub fn set_connected(&self, value: bool) {
        self.inner.connected.store(value, Ordering::SeqCst);
    }

    /// Makes the next `connect()` call fail once, then succeed thereafter.
    pub fn fail_next_connect(&self) {
        self.inner.fail_next_connect.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn open_count(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_count(&self) -> u64 {
        self.inner.deletes.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_chart_count(&self) -> usize {
        self.inner.charts.len()
    }

    /// Deliver an `Update` event to the chart currently bound to
    /// `(symbol, timeframe)`. Returns `false` if no chart is bound to that key.
    pub fn push_update(&self, symbol: &str, timeframe: &str, period: RawPeriod) -> bool {
        self.with_chart(symbol, timeframe, |chart| {
            let _ = chart.tx.try_send(ChartEvent::Update(period));
        })
    }

    pub fn push_symbol_loaded(&self, symbol: &str, timeframe: &str) -> bool {
        self.with_chart(symbol, timeframe, |chart| {
            let _ = chart.tx.try_send(ChartEvent::SymbolLoaded);
        })
    }

    pub fn push_error(&self, symbol: &str, timeframe: &str, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        self.with_chart(symbol, timeframe, |chart| {
            let _ = chart.tx.try_send(ChartEvent::Error(reason));
        })
    }

    fn with_chart(&self, symbol: &str, timeframe: &str, f: impl FnOnce(&FakeChart)) -> bool {
        let Some(id) = self
            .inner
            .by_key
            .get(&(symbol.to_string(), timeframe.to_string()))
            .map(|e| *e)
        else {
            return false;
        };
        if let Some(chart) = self.inner.charts.get(&id) {
            f(&chart);
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstreamClient {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.inner.fail_next_connect.swap(false, Ordering::SeqCst) {
            return Err(BrokerError::Driver("fake connect failure".to_string()));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn open_chart(&self) -> Result<OpenedChart, BrokerError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(64);
        self.inner.charts.insert(
            id,
            FakeChart {
                tx,
                binding: Mutex::new(None),
            },
        );
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        Ok(OpenedChart {
            handle: Box::new(FakeChartHandle {
                inner: Arc::clone(&self.inner),
                id,
            }),
            events: rx,
        })
    }

    async fn end(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.charts.clear();
        self.inner.by_key.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct FakeChartHandle {
    inner: Arc<FakeInner>,
    id: u64,
}

#[async_trait]
impl ChartHandle for FakeChartHandle {
    async fn set_market(&self, symbol: &str, timeframe: &str) -> Result<(), BrokerError> {
        if let Some(chart) = self.inner.charts.get(&self.id) {
            *chart.binding.lock() = Some((symbol.to_string(), timeframe.to_string()));
        }
        self.inner
            .by_key
            .insert((symbol.to_string(), timeframe.to_string()), self.id);
        Ok(())
    }

    async fn delete(&self) -> Result<(), BrokerError> {
        if let Some((_, chart)) = self.inner.charts.remove(&self.id) {
            if let Some(key) = chart.binding.lock().clone() {
                self.inner.by_key.remove(&key);
            }
        }
        self.inner.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_chart_requires_connect_first() {
        let client = FakeUpstreamClient::new();
        assert!(matches!(
            client.open_chart().await,
            Err(BrokerError::NotConnected)
        ));
        client.connect().await.unwrap();
        assert!(client.open_chart().await.is_ok());
    }

    #[tokio::test]
    async fn push_update_reaches_the_bound_chart() {
        let client = FakeUpstreamClient::new();
        client.connect().await.unwrap();
        let opened = client.open_chart().await.unwrap();
        opened.handle.set_market("BINANCE:BTCUSDT", "1").await.unwrap();

        let period = RawPeriod {
            time: 1,
            open: 1.0,
            close: 1.0,
            high: None,
            low: None,
            max: None,
            min: None,
            volume: None,
        };
        assert!(client.push_update("BINANCE:BTCUSDT", "1", period));
        assert!(!client.push_update("BINANCE:ETHUSDT", "1", period));
    }

    #[tokio::test]
    async fn delete_unbinds_the_key() {
        let client = FakeUpstreamClient::new();
        client.connect().await.unwrap();
        let opened = client.open_chart().await.unwrap();
        opened.handle.set_market("BINANCE:BTCUSDT", "1").await.unwrap();
        opened.handle.delete().await.unwrap();
        assert_eq!(client.delete_count(), 1);
        assert_eq!(client.live_chart_count(), 0);
    }

    #[tokio::test]
    async fn fail_next_connect_fires_once() {
        let client = FakeUpstreamClient::new();
        client.fail_next_connect();
        assert!(client.connect().await.is_err());
        assert!(client.connect().await.is_ok());
    }
}
