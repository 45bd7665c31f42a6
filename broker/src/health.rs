//! The Health Monitor: detects subscriptions that have gone silent longer
//! than their timeframe justifies and drives targeted recovery, escalating
//! to a full reconnect when too many keys are stale at once.

use crate::events::BrokerEvent;
use crate::model::{timeframe_ms, SubscriptionKey};
use crate::multiplexer::SubscriptionMultiplexer;
use common::constants::RECOVERY_SETTLE_SECS;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Health Monitor knobs, all overridable via `HEALTH_*` environment variables.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval_ms: u64,
    pub stale_threshold_multiplier: f64,
    pub auto_recovery_enabled: bool,
    pub max_recovery_attempts: u32,
    pub full_reconnect_threshold: usize,
    pub full_reconnect_cooldown_ms: i64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 60_000,
            stale_threshold_multiplier: 3.0,
            auto_recovery_enabled: true,
            max_recovery_attempts: 3,
            full_reconnect_threshold: 3,
            full_reconnect_cooldown_ms: 600_000,
        }
    }
}

struct Tasks {
    events: JoinHandle<()>,
    timer: JoinHandle<()>,
}

pub struct HealthMonitor {
    mux: Arc<SubscriptionMultiplexer>,
    config: HealthConfig,
    last_bar_ts: Mutex<FxHashMap<SubscriptionKey, i64>>,
    recovery_attempts: Mutex<FxHashMap<SubscriptionKey, u32>>,
    last_full_reconnect_ts: AtomicI64,
    tasks: Mutex<Option<Tasks>>,
}

impl HealthMonitor {
    #[must_use]
    pub fn new(mux: Arc<SubscriptionMultiplexer>, config: HealthConfig) -> Arc<Self> {
        Arc::new(Self {
            mux,
            config,
            last_bar_ts: Mutex::new(FxHashMap::default()),
            recovery_attempts: Mutex::new(FxHashMap::default()),
            last_full_reconnect_ts: AtomicI64::new(0),
            tasks: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub async fn is_active(&self) -> bool {
        self.tasks.lock().await.is_some()
    }

    /// Starts the event-consuming listener and the scan timer. The timer
    /// loop only *schedules* scans as detached tasks; aborting it (via
    /// `stop`) stops future scheduling without interrupting a scan already
    /// in flight, matching the "in-flight recovery calls are allowed to
    /// complete" shutdown rule.
    pub async fn start(self: &Arc<Self>) {
        let listener = Arc::clone(self);
        let events_task = tokio::spawn(async move {
            let mut rx = listener.mux.events();
            loop {
                match rx.recv().await {
                    Ok(event) => listener.on_event(event).await,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let timer_owner = Arc::clone(self);
        let timer_task = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(timer_owner.config.check_interval_ms)).await;
                let scanner = Arc::clone(&timer_owner);
                tokio::spawn(async move { scanner.scan().await });
            }
        });

        *self.tasks.lock().await = Some(Tasks {
            events: events_task,
            timer: timer_task,
        });
    }

    /// Cancels the scan timer and detaches the event listener immediately.
    pub async fn stop(&self) {
        if let Some(tasks) = self.tasks.lock().await.take() {
            tasks.events.abort();
            tasks.timer.abort();
        }
    }

    async fn on_event(&self, event: BrokerEvent) {
        let now = now_ms();
        match event {
            BrokerEvent::Bar { key, .. } => {
                self.last_bar_ts.lock().await.insert(key.clone(), now);
                self.recovery_attempts.lock().await.remove(&key);
                metrics::gauge!("last_data_received_seconds",
                    "symbol" => key.symbol, "timeframe" => key.timeframe)
                    .set(0.0);
            }
            BrokerEvent::Subscribed { key } => {
                self.last_bar_ts.lock().await.insert(key, now);
            }
            BrokerEvent::Unsubscribed { key } => {
                self.last_bar_ts.lock().await.remove(&key);
                self.recovery_attempts.lock().await.remove(&key);
            }
            BrokerEvent::Connect => {
                let keys = self.mux.list().await;
                let mut lastbar = self.last_bar_ts.lock().await;
                lastbar.clear();
                for key in keys {
                    lastbar.insert(key, now);
                }
                self.recovery_attempts.lock().await.clear();
            }
            BrokerEvent::Disconnect => {
                // Preserve timestamps: they represent last-known data.
            }
            BrokerEvent::Error { .. }
            | BrokerEvent::SubscriptionError { .. }
            | BrokerEvent::MaxReconnectAttempts => {}
        }
    }

    /// Computes the current stale set without mutating any state. Used by
    /// the Health HTTP API.
    pub async fn stale_snapshot(&self) -> Vec<SubscriptionKey> {
        let now = now_ms();
        let keys = self.mux.list().await;
        let lastbar = self.last_bar_ts.lock().await;
        keys.into_iter()
            .filter(|key| is_stale(key, &lastbar, now, self.config.stale_threshold_multiplier))
            .collect()
    }

    /// One scan cycle: §4.3 steps 1-5.
    pub async fn scan(&self) {
        let now = now_ms();
        let keys = self.mux.list().await;

        {
            let mut lastbar = self.last_bar_ts.lock().await;
            for key in &keys {
                lastbar.entry(key.clone()).or_insert(now);
            }
            for key in &keys {
                let ts = *lastbar.get(key).unwrap_or(&now);
                let seconds = (now - ts).max(0) as f64 / 1000.0;
                metrics::gauge!("last_data_received_seconds",
                    "symbol" => key.symbol.clone(), "timeframe" => key.timeframe.clone())
                    .set(seconds);
            }
        }

        let stale: Vec<SubscriptionKey> = {
            let lastbar = self.last_bar_ts.lock().await;
            keys.iter()
                .filter(|key| is_stale(key, &lastbar, now, self.config.stale_threshold_multiplier))
                .cloned()
                .collect()
        };
        metrics::gauge!("stale_subscriptions").set(stale.len() as f64);

        let last_full = self.last_full_reconnect_ts.load(Ordering::SeqCst);
        let cooldown_elapsed = (now - last_full) > self.config.full_reconnect_cooldown_ms;

        if self.config.auto_recovery_enabled
            && stale.len() >= self.config.full_reconnect_threshold
            && cooldown_elapsed
        {
            info!(
                stale = stale.len(),
                threshold = self.config.full_reconnect_threshold,
                "stale threshold reached, triggering full reconnect"
            );
            self.mux.full_reconnect().await;
            self.last_full_reconnect_ts.store(now, Ordering::SeqCst);
            let mut lastbar = self.last_bar_ts.lock().await;
            for key in &keys {
                lastbar.insert(key.clone(), now);
            }
            self.recovery_attempts.lock().await.clear();
            metrics::counter!("full_reconnects_total").increment(1);
            return;
        }

        if self.config.auto_recovery_enabled {
            for key in &stale {
                self.individual_recovery(key).await;
            }
        }
    }

    async fn individual_recovery(&self, key: &SubscriptionKey) {
        {
            let mut attempts = self.recovery_attempts.lock().await;
            let count = attempts.entry(key.clone()).or_insert(0);
            if *count >= self.config.max_recovery_attempts {
                warn!(%key, attempts = *count, "max recovery attempts exhausted, skipping");
                return;
            }
            *count += 1;
        }
        metrics::counter!("recovery_attempts_total").increment(1);

        self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
        tokio::time::sleep(Duration::from_secs(RECOVERY_SETTLE_SECS)).await;
        let recovered = self.mux.subscribe(key, "health_recovery").await;

        if recovered {
            self.last_bar_ts.lock().await.insert(key.clone(), now_ms());
            metrics::counter!("successful_recoveries_total").increment(1);
            info!(%key, "recovery succeeded");
        } else {
            metrics::counter!("failed_recoveries_total").increment(1);
            warn!(%key, "recovery failed");
        }
    }

    /// Drives the same unsub+sleep(1s)+sub sequence as individual recovery,
    /// for the `POST /recovery/subscription` Health HTTP API endpoint. Does
    /// not consult or update the per-key attempt budget — an operator
    /// request is not subject to the automatic backoff.
    pub async fn trigger_manual_recovery(&self, key: &SubscriptionKey) -> bool {
        self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
        tokio::time::sleep(Duration::from_secs(RECOVERY_SETTLE_SECS)).await;
        let recovered = self.mux.subscribe(key, "manual_recovery").await;
        if recovered {
            self.last_bar_ts.lock().await.insert(key.clone(), now_ms());
        }
        recovered
    }

    /// For the `POST /recovery/full-reconnect` Health HTTP API endpoint.
    pub async fn trigger_full_reconnect(&self) -> bool {
        let ok = self.mux.full_reconnect().await;
        if ok {
            let now = now_ms();
            let keys = self.mux.list().await;
            let mut lastbar = self.last_bar_ts.lock().await;
            for key in keys {
                lastbar.insert(key, now);
            }
            self.recovery_attempts.lock().await.clear();
            self.last_full_reconnect_ts.store(now, Ordering::SeqCst);
        }
        ok
    }
}

fn is_stale(key: &SubscriptionKey, lastbar: &FxHashMap<SubscriptionKey, i64>, now: i64, multiplier: f64) -> bool {
    let Some(tf_ms) = timeframe_ms(&key.timeframe) else {
        return false;
    };
    let ts = *lastbar.get(key).unwrap_or(&now);
    (now - ts) as f64 > tf_ms as f64 * multiplier
}
