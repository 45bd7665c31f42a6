//! The Subscription Multiplexer: owns the canonical `key → UpstreamSubscription`
//! map and is the only component allowed to talk to the Upstream Driver.

use crate::events::BrokerEvent;
use crate::model::{Bar, SubscriptionKey};
use common::constants::FULL_RECONNECT_SETTLE_MS;
use common::BrokerError;
use driver::{ChartEvent, ChartHandle, RawPeriod, UpstreamClient};
use rustc_hash::FxHashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn to_bar(period: &RawPeriod) -> Bar {
    Bar {
        time: period.time,
        open: period.open,
        high: period.resolved_high(),
        low: period.resolved_low(),
        close: period.close,
        volume: period.resolved_volume(),
    }
}

struct UpstreamSubscription {
    handle: Box<dyn ChartHandle>,
    last_bar_time_ms: Arc<AtomicI64>,
    forward_task: JoinHandle<()>,
}

/// Owns the canonical mapping `key → UpstreamSubscription` and the single
/// upstream session. The inner map is guarded by a `tokio::sync::Mutex`
/// held across each whole `subscribe`/`unsubscribe` operation: a
/// single-writer queue, as permitted by the concurrency discipline this
/// component must uphold. Event emission always happens after the map
/// mutation commits.
pub struct SubscriptionMultiplexer {
    driver: Arc<dyn UpstreamClient>,
    subs: Mutex<FxHashMap<SubscriptionKey, UpstreamSubscription>>,
    bus: broadcast::Sender<BrokerEvent>,
    connected: AtomicBool,
}

impl SubscriptionMultiplexer {
    #[must_use]
    pub fn new(driver: Arc<dyn UpstreamClient>) -> Self {
        Self {
            driver,
            subs: Mutex::new(FxHashMap::default()),
            bus: crate::events::new_bus(),
            connected: AtomicBool::new(false),
        }
    }

    /// A fresh listener for multiplexer events (Health Monitor, Fan-out).
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<BrokerEvent> {
        self.bus.subscribe()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn emit(&self, event: BrokerEvent) {
        let _ = self.bus.send(event);
    }

    /// Opens the upstream session. Resets the driver's own reconnect backoff
    /// counter (owned internal to driver bring-up).
    pub async fn connect(&self) -> Result<(), BrokerError> {
        match self.driver.connect().await {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                self.emit(BrokerEvent::Connect);
                Ok(())
            }
            Err(BrokerError::MaxReconnectAttempts) => {
                self.emit(BrokerEvent::MaxReconnectAttempts);
                Err(BrokerError::MaxReconnectAttempts)
            }
            Err(e) => Err(e),
        }
    }

    /// Returns a snapshot of all currently subscribed keys.
    pub async fn list(&self) -> Vec<SubscriptionKey> {
        self.subs.lock().await.keys().cloned().collect()
    }

    /// Returns a snapshot of `(key, last_bar_time_ms)` for every live
    /// subscription, used by the Health HTTP API's `/status` endpoint.
    pub async fn snapshot_with_last_bar_time(&self) -> Vec<(SubscriptionKey, i64)> {
        self.subs
            .lock()
            .await
            .iter()
            .map(|(k, v)| (k.clone(), v.last_bar_time_ms.load(Ordering::SeqCst)))
            .collect()
    }

    /// Idempotent: returns `true` immediately if already subscribed.
    pub async fn subscribe(&self, key: &SubscriptionKey, reason: &str) -> bool {
        let mut subs = self.subs.lock().await;
        if subs.contains_key(key) {
            return true;
        }
        if !self.is_connected() {
            drop(subs);
            self.emit(BrokerEvent::SubscriptionError {
                key: key.clone(),
                reason: "driver not connected".to_string(),
            });
            return false;
        }

        let opened = match self.driver.open_chart().await {
            Ok(opened) => opened,
            Err(e) => {
                drop(subs);
                warn!(%key, error = %e, reason, "failed to open upstream chart");
                self.emit(BrokerEvent::SubscriptionError {
                    key: key.clone(),
                    reason: e.to_string(),
                });
                return false;
            }
        };

        let last_bar_time_ms = Arc::new(AtomicI64::new(now_ms()));
        let forward_task = spawn_forwarder(
            key.clone(),
            opened.events,
            self.bus.clone(),
            Arc::clone(&last_bar_time_ms),
        );

        if let Err(e) = opened.handle.set_market(&key.symbol, &key.timeframe).await {
            forward_task.abort();
            let _ = opened.handle.delete().await;
            drop(subs);
            warn!(%key, error = %e, reason, "set_market failed, rolling back chart");
            self.emit(BrokerEvent::SubscriptionError {
                key: key.clone(),
                reason: e.to_string(),
            });
            return false;
        }

        subs.insert(
            key.clone(),
            UpstreamSubscription {
                handle: opened.handle,
                last_bar_time_ms,
                forward_task,
            },
        );
        drop(subs);

        metrics::gauge!("active_subscriptions").increment(1.0);
        info!(%key, reason, "subscribed");
        self.emit(BrokerEvent::Subscribed { key: key.clone() });
        true
    }

    /// Tears down the chart for `(symbol, timeframe)`. Teardown errors are
    /// logged but never prevent the map entry from being removed.
    pub async fn unsubscribe(&self, symbol: &str, timeframe: &str) -> bool {
        let key = SubscriptionKey::new(symbol, timeframe);
        let mut subs = self.subs.lock().await;
        let Some(record) = subs.remove(&key) else {
            drop(subs);
            warn!(%key, "unsubscribe requested for unknown key");
            return false;
        };
        drop(subs);

        record.forward_task.abort();
        if let Err(e) = record.handle.delete().await {
            warn!(%key, error = %e, "chart teardown failed (removal proceeds anyway)");
        }

        metrics::gauge!("active_subscriptions").decrement(1.0);
        info!(%key, "unsubscribed");
        self.emit(BrokerEvent::Unsubscribed { key: key.clone() });
        true
    }

    /// Applies `desired` against the current set: removed keys first, then
    /// added, so a symbol re-keyed within one call never collides
    /// driver-side.
    pub async fn update_subscriptions(&self, desired: &HashSet<SubscriptionKey>, reason: &str) {
        let current: HashSet<SubscriptionKey> = self.list().await.into_iter().collect();
        let removed: Vec<_> = current.difference(desired).cloned().collect();
        let added: Vec<_> = desired.difference(&current).cloned().collect();

        for key in &removed {
            self.unsubscribe(&key.symbol, &key.timeframe).await;
        }
        for key in &added {
            self.subscribe(key, reason).await;
        }

        let restored = if reason == "full_reconnect" { added.len() } else { 0 };
        info!(
            removed = removed.len(),
            added = added.len(),
            restored,
            reason,
            "updateSubscriptions applied"
        );
    }

    /// Tears down every chart (best-effort), clears the map, zeroes the gauge.
    pub async fn reset_all(&self) {
        let mut subs = self.subs.lock().await;
        let drained: Vec<_> = subs.drain().collect();
        drop(subs);

        for (key, record) in drained {
            record.forward_task.abort();
            if let Err(e) = record.handle.delete().await {
                warn!(%key, error = %e, "reset_all: teardown failed, ignoring");
            }
        }
        metrics::gauge!("active_subscriptions").set(0.0);
    }

    /// Snapshots current keys, closes and re-opens the driver session, then
    /// re-applies the snapshot. Returns `false` if the close/reopen sequence
    /// itself failed; per-key resubscription failures are reported as
    /// individual `subscription_error` events and do not affect the result.
    pub async fn full_reconnect(&self) -> bool {
        let snapshot: HashSet<SubscriptionKey> = self.list().await.into_iter().collect();

        {
            let mut subs = self.subs.lock().await;
            let drained: Vec<_> = subs.drain().collect();
            drop(subs);
            for (_, record) in drained {
                record.forward_task.abort();
            }
        }
        metrics::gauge!("active_subscriptions").set(0.0);

        if let Err(e) = self.driver.end().await {
            debug!(error = %e, "driver end() during full_reconnect reported an error, continuing");
        }
        self.connected.store(false, Ordering::SeqCst);

        tokio::time::sleep(std::time::Duration::from_millis(FULL_RECONNECT_SETTLE_MS)).await;

        if let Err(e) = self.driver.connect().await {
            warn!(error = %e, "full_reconnect: driver failed to reconnect");
            if matches!(e, BrokerError::MaxReconnectAttempts) {
                self.emit(BrokerEvent::MaxReconnectAttempts);
            }
            return false;
        }
        self.connected.store(true, Ordering::SeqCst);
        self.emit(BrokerEvent::Connect);

        self.update_subscriptions(&snapshot, "full_reconnect").await;
        true
    }

    /// Cancels in-flight bookkeeping, tears down every chart, clears the
    /// map, closes the driver session, and marks the multiplexer disconnected.
    pub async fn close(&self) {
        self.reset_all().await;
        if let Err(e) = self.driver.end().await {
            warn!(error = %e, "driver end() during close reported an error, ignoring");
        }
        self.connected.store(false, Ordering::SeqCst);
        self.emit(BrokerEvent::Disconnect);
    }
}

fn spawn_forwarder(
    key: SubscriptionKey,
    mut events: tokio::sync::mpsc::Receiver<ChartEvent>,
    bus: broadcast::Sender<BrokerEvent>,
    last_bar_time_ms: Arc<AtomicI64>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ChartEvent::Update(period) => {
                    last_bar_time_ms.store(now_ms(), Ordering::SeqCst);
                    let bar = to_bar(&period);
                    let _ = bus.send(BrokerEvent::Bar { key: key.clone(), bar });
                }
                ChartEvent::SymbolLoaded => {
                    debug!(%key, "symbol loaded");
                }
                ChartEvent::Error(message) => {
                    warn!(%key, message, "chart reported an error");
                    let _ = bus.send(BrokerEvent::Error {
                        message: format!("{key}: {message}"),
                    });
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::testing::FakeUpstreamClient;

    fn period(time: i64, close: f64) -> RawPeriod {
        RawPeriod {
            time,
            open: close,
            close,
            high: Some(close + 1.0),
            low: Some(close - 1.0),
            max: None,
            min: None,
            volume: Some(9.0),
        }
    }

    async fn connected_mux() -> (SubscriptionMultiplexer, FakeUpstreamClient) {
        let fake = FakeUpstreamClient::new();
        let mux = SubscriptionMultiplexer::new(Arc::new(fake.clone()));
        mux.connect().await.expect("connect");
        (mux, fake)
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_within_one_session() {
        let (mux, fake) = connected_mux().await;
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");

        assert!(mux.subscribe(&key, "client").await);
        assert!(mux.subscribe(&key, "client").await);
        assert_eq!(fake.open_count(), 1);
        assert_eq!(mux.list().await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_key_returns_false() {
        let (mux, _fake) = connected_mux().await;
        assert!(!mux.unsubscribe("BINANCE:BTCUSDT", "1").await);
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_tears_down_the_chart() {
        let (mux, fake) = connected_mux().await;
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
        assert!(mux.subscribe(&key, "client").await);
        assert!(mux.unsubscribe(&key.symbol, &key.timeframe).await);
        assert_eq!(fake.delete_count(), 1);
        assert!(mux.list().await.is_empty());
    }

    #[tokio::test]
    async fn bar_events_convert_max_min_synonyms() {
        let (mux, fake) = connected_mux().await;
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
        let mut rx = mux.events();
        assert!(mux.subscribe(&key, "client").await);

        let raw = RawPeriod {
            time: 1_700_000_000,
            open: 1.0,
            close: 1.5,
            high: None,
            low: None,
            max: Some(2.0),
            min: Some(0.5),
            volume: Some(10.0),
        };
        assert!(fake.push_update(&key.symbol, &key.timeframe, raw));

        loop {
            match rx.recv().await.expect("event") {
                BrokerEvent::Bar { bar, .. } => {
                    assert_eq!(bar.high, 2.0);
                    assert_eq!(bar.low, 0.5);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn subscribe_fails_when_driver_not_connected() {
        let fake = FakeUpstreamClient::new();
        let mux = SubscriptionMultiplexer::new(Arc::new(fake));
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
        assert!(!mux.subscribe(&key, "client").await);
    }

    #[tokio::test]
    async fn update_subscriptions_removes_then_adds() {
        let (mux, fake) = connected_mux().await;
        let a = SubscriptionKey::new("A", "1");
        let b = SubscriptionKey::new("B", "1");
        mux.subscribe(&a, "seed").await;

        let desired: HashSet<_> = [b.clone()].into_iter().collect();
        mux.update_subscriptions(&desired, "rebalance").await;

        let live = mux.list().await;
        assert_eq!(live, vec![b]);
        assert_eq!(fake.delete_count(), 1);
        assert_eq!(fake.open_count(), 2);
    }

    #[tokio::test]
    async fn full_reconnect_restores_the_snapshot() {
        let (mux, fake) = connected_mux().await;
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
        mux.subscribe(&key, "client").await;

        assert!(mux.full_reconnect().await);
        assert_eq!(mux.list().await, vec![key]);
        assert_eq!(fake.open_count(), 2);
    }

    #[tokio::test]
    async fn close_tears_down_everything_and_marks_disconnected() {
        let (mux, fake) = connected_mux().await;
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "1");
        mux.subscribe(&key, "client").await;

        mux.close().await;
        assert!(!mux.is_connected());
        assert!(mux.list().await.is_empty());
        assert_eq!(fake.delete_count(), 1);
    }
}
