//! Client Session Registry: per-session interest, the global
//! `InterestIndex`, and the translation of interest transitions (0<->1)
//! into Subscription Multiplexer calls.

use crate::models::{ClientRequest, Pair, PairResult, SubscriptionSnapshotEntry};
use broker::{Bar, SubscriptionKey, SubscriptionMultiplexer};
use dashmap::DashMap;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

pub type ClientId = u64;

/// Capacity of each client's outbound channel. A client that falls behind
/// this many messages silently drops the oldest ones (the broadcast
/// channel's natural lag behavior) instead of delaying fan-out to others —
/// the "(a) per-client bounded outbox with drop-oldest" policy.
const CLIENT_OUTBOX_CAPACITY: usize = 512;

/// One connected downstream client: its outbound channel and its interest set.
pub struct ClientSession {
    pub id: ClientId,
    tx: broadcast::Sender<String>,
    interest: Mutex<HashSet<SubscriptionKey>>,
}

impl ClientSession {
    #[must_use]
    pub fn subscribe_outbox(&self) -> broadcast::Receiver<String> {
        self.tx.subscribe()
    }

    fn send(&self, value: &Value) {
        let _ = self.tx.send(value.to_string());
    }
}

/// Owns the global `key -> interested clients` index, the per-client
/// interest sets, and the set of config-pinned keys exempted from
/// teardown-on-empty-interest.
pub struct ClientRegistry {
    mux: Arc<SubscriptionMultiplexer>,
    interest_index: Mutex<FxHashMap<SubscriptionKey, HashSet<ClientId>>>,
    pinned: HashSet<SubscriptionKey>,
    sessions: DashMap<ClientId, Arc<ClientSession>>,
    next_id: AtomicU64,
}

impl ClientRegistry {
    #[must_use]
    pub fn new(mux: Arc<SubscriptionMultiplexer>, pinned: HashSet<SubscriptionKey>) -> Arc<Self> {
        Arc::new(Self {
            mux,
            interest_index: Mutex::new(FxHashMap::default()),
            pinned,
            sessions: DashMap::new(),
            next_id: AtomicU64::new(0),
        })
    }

    /// Registers a freshly accepted connection and returns its session handle.
    pub fn register(&self) -> Arc<ClientSession> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, _rx) = broadcast::channel(CLIENT_OUTBOX_CAPACITY);
        let session = Arc::new(ClientSession {
            id,
            tx,
            interest: Mutex::new(HashSet::new()),
        });
        self.sessions.insert(id, Arc::clone(&session));
        metrics::counter!("ws_connects_total").increment(1);
        session
    }

    /// Snapshot of every key with non-empty global interest, for `list` and
    /// bulk-operation responses.
    pub async fn subscription_snapshot(&self) -> Vec<SubscriptionSnapshotEntry> {
        self.interest_index
            .lock()
            .await
            .keys()
            .map(|k| SubscriptionSnapshotEntry {
                symbol: k.symbol.clone(),
                timeframe: k.timeframe.clone(),
            })
            .collect()
    }

    /// Parses and dispatches one client frame, returning the JSON response
    /// to send back (with `requestId` echoed when the request carried one).
    pub async fn handle_request(&self, session: &Arc<ClientSession>, text: &str) -> Value {
        let request: ClientRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(_) => {
                return json!({
                    "type": "error",
                    "success": false,
                    "message": "Invalid JSON message",
                });
            }
        };

        let request_id = request.request_id.clone();
        let mut response = match request.action.as_str() {
            "subscribe" => self.handle_subscribe(session, &request).await,
            "unsubscribe" => self.handle_unsubscribe(session, &request).await,
            "subscribe_many" => self.handle_bulk(session, &request, true).await,
            "unsubscribe_many" => self.handle_bulk(session, &request, false).await,
            "list" => self.handle_list().await,
            other => json!({
                "type": "error",
                "success": false,
                "message": format!("Unknown action: {other}"),
            }),
        };

        if let (Some(id), Some(obj)) = (request_id, response.as_object_mut()) {
            obj.insert("requestId".to_string(), json!(id));
        }
        response
    }

    async fn handle_subscribe(&self, session: &Arc<ClientSession>, req: &ClientRequest) -> Value {
        let (Some(symbol), Some(timeframe)) = (req.symbol.as_deref(), req.timeframe.as_deref())
        else {
            return json!({"type": "subscribe", "success": false, "message": "symbol and timeframe required"});
        };
        if symbol.is_empty() || timeframe.is_empty() {
            return json!({"type": "subscribe", "success": false, "message": "symbol and timeframe required"});
        }

        let key = SubscriptionKey::new(symbol, timeframe);
        {
            let mut interest = session.interest.lock().await;
            if interest.contains(&key) {
                return json!({
                    "type": "subscribe", "success": true, "message": "Already subscribed",
                    "symbol": key.symbol, "timeframe": key.timeframe,
                });
            }
            interest.insert(key.clone());
        }

        let message = self.claim_interest(session.id, &key).await;
        json!({
            "type": "subscribe", "success": true, "message": message,
            "symbol": key.symbol, "timeframe": key.timeframe,
        })
    }

    /// Registers `client_id`'s interest in `key` in the global index and, on
    /// the 0->1 transition, calls `Multiplexer.subscribe`.
    async fn claim_interest(&self, client_id: ClientId, key: &SubscriptionKey) -> &'static str {
        let first_listener = {
            let mut index = self.interest_index.lock().await;
            let set = index.entry(key.clone()).or_default();
            set.insert(client_id);
            set.len() == 1
        };
        if first_listener {
            self.mux.subscribe(key, "client").await;
            "Subscription created"
        } else {
            "Subscribed (shared)"
        }
    }

    async fn handle_unsubscribe(&self, session: &Arc<ClientSession>, req: &ClientRequest) -> Value {
        let (Some(symbol), Some(timeframe)) = (req.symbol.as_deref(), req.timeframe.as_deref())
        else {
            return json!({"type": "unsubscribe", "success": false, "message": "symbol and timeframe required"});
        };
        let key = SubscriptionKey::new(symbol, timeframe);
        let message = self.drop_interest(session, &key).await;
        json!({
            "type": "unsubscribe", "success": message.is_some(),
            "message": message.unwrap_or_else(|| "Subscription not found for this client".to_string()),
            "symbol": key.symbol, "timeframe": key.timeframe,
        })
    }

    /// Removes `key` from `session`'s interest and, on the global 1->0
    /// transition, tears it down upstream (unless config-pinned). Returns
    /// `None` if the session was not interested in `key`.
    async fn drop_interest(&self, session: &Arc<ClientSession>, key: &SubscriptionKey) -> Option<String> {
        {
            let mut interest = session.interest.lock().await;
            if !interest.remove(key) {
                return None;
            }
        }

        let last_listener = {
            let mut index = self.interest_index.lock().await;
            let Some(set) = index.get_mut(key) else {
                return Some("Unsubscribed successfully".to_string());
            };
            set.remove(&session.id);
            let empty = set.is_empty();
            if empty {
                index.remove(key);
            }
            empty
        };

        if last_listener {
            if !self.pinned.contains(key) {
                self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
            }
            Some("Unsubscribed successfully".to_string())
        } else {
            Some("Unsubscribed (shared)".to_string())
        }
    }

    async fn handle_bulk(&self, session: &Arc<ClientSession>, req: &ClientRequest, subscribing: bool) -> Value {
        let kind = if subscribing { "subscribe_many" } else { "unsubscribe_many" };
        let Some(pairs) = req.pairs.as_ref().filter(|p| !p.is_empty()) else {
            return json!({"type": kind, "success": false, "message": "pairs must not be empty"});
        };

        let mut results = Vec::with_capacity(pairs.len());
        for pair in pairs {
            results.push(self.bulk_one(session, pair, subscribing).await);
        }

        json!({
            "type": kind,
            "success": true,
            "results": results,
            "subscriptions": self.subscription_snapshot().await,
        })
    }

    async fn bulk_one(&self, session: &Arc<ClientSession>, pair: &Pair, subscribing: bool) -> PairResult {
        if pair.symbol.is_empty() || pair.timeframe.is_empty() {
            return PairResult {
                symbol: pair.symbol.clone(),
                timeframe: pair.timeframe.clone(),
                success: false,
                message: "symbol and timeframe required".to_string(),
            };
        }

        let key = SubscriptionKey::new(&pair.symbol, &pair.timeframe);
        if subscribing {
            let already = {
                let mut interest = session.interest.lock().await;
                if interest.contains(&key) {
                    true
                } else {
                    interest.insert(key.clone());
                    false
                }
            };
            let message = if already {
                "Already subscribed".to_string()
            } else {
                self.claim_interest(session.id, &key).await.to_string()
            };
            PairResult { symbol: key.symbol, timeframe: key.timeframe, success: true, message }
        } else {
            let message = self.drop_interest(session, &key).await;
            PairResult {
                symbol: key.symbol,
                timeframe: key.timeframe,
                success: message.is_some(),
                message: message.unwrap_or_else(|| "Subscription not found for this client".to_string()),
            }
        }
    }

    async fn handle_list(&self) -> Value {
        json!({
            "type": "list", "success": true, "message": "ok",
            "subscriptions": self.subscription_snapshot().await,
        })
    }

    /// Removes `session` from every `InterestIndex` entry it appeared in,
    /// tearing down any key whose interest set becomes empty (and is not
    /// config-pinned).
    pub async fn disconnect(&self, session: &Arc<ClientSession>) {
        self.sessions.remove(&session.id);
        let keys: Vec<SubscriptionKey> = session.interest.lock().await.iter().cloned().collect();
        for key in keys {
            let last_listener = {
                let mut index = self.interest_index.lock().await;
                let Some(set) = index.get_mut(&key) else { continue };
                set.remove(&session.id);
                let empty = set.is_empty();
                if empty {
                    index.remove(&key);
                }
                empty
            };
            if last_listener && !self.pinned.contains(&key) {
                self.mux.unsubscribe(&key.symbol, &key.timeframe).await;
                info!(
                    symbol = %key.symbol, timeframe = %key.timeframe,
                    "Auto-unsubscribed from {}/{} (last client disconnected)", key.symbol, key.timeframe
                );
            }
        }
    }

    /// Broadcasts a bar to every session currently interested in `key`.
    /// Writes to a closed/lagging transport are swallowed — no back-pressure
    /// is exerted on the caller.
    pub async fn broadcast_bar(&self, key: &SubscriptionKey, bar: &Bar) {
        let recipients: Vec<ClientId> = {
            let index = self.interest_index.lock().await;
            index.get(key).map(|s| s.iter().copied().collect()).unwrap_or_default()
        };
        if recipients.is_empty() {
            return;
        }
        let payload = json!({
            "type": "bar",
            "bar": {
                "symbol": key.symbol, "timeframe": key.timeframe,
                "time": bar.time, "open": bar.open, "high": bar.high,
                "low": bar.low, "close": bar.close, "volume": bar.volume,
            },
        });
        for id in recipients {
            if let Some(session) = self.sessions.get(&id) {
                session.send(&payload);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker::SubscriptionMultiplexer;
    use driver::testing::FakeUpstreamClient;
    use serde_json::json;

    async fn registry() -> (Arc<ClientRegistry>, FakeUpstreamClient) {
        let fake = FakeUpstreamClient::new();
        let mux = Arc::new(SubscriptionMultiplexer::new(Arc::new(fake.clone())));
        mux.connect().await.expect("connect");
        (ClientRegistry::new(mux, HashSet::new()), fake)
    }

    #[tokio::test]
    async fn first_subscriber_opens_a_chart_second_shares_it() {
        let (registry, fake) = registry().await;
        let a = registry.register();
        let b = registry.register();

        let r1 = registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"BINANCE:BTCUSDT","timeframe":"1"}"#)
            .await;
        assert_eq!(r1["message"], json!("Subscription created"));

        let r2 = registry
            .handle_request(&b, r#"{"action":"subscribe","symbol":"BINANCE:BTCUSDT","timeframe":"1"}"#)
            .await;
        assert_eq!(r2["message"], json!("Subscribed (shared)"));
        assert_eq!(fake.open_count(), 1);
    }

    #[tokio::test]
    async fn repeating_subscribe_is_idempotent_for_one_client() {
        let (registry, fake) = registry().await;
        let a = registry.register();
        registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        let again = registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        assert_eq!(again["message"], json!("Already subscribed"));
        assert_eq!(fake.open_count(), 1);
    }

    #[tokio::test]
    async fn last_unsubscribe_tears_down_the_chart() {
        let (registry, fake) = registry().await;
        let a = registry.register();
        registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        let resp = registry
            .handle_request(&a, r#"{"action":"unsubscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        assert_eq!(resp["message"], json!("Unsubscribed successfully"));
        assert_eq!(fake.delete_count(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_unknown_to_this_client_fails() {
        let (registry, _fake) = registry().await;
        let a = registry.register();
        let resp = registry
            .handle_request(&a, r#"{"action":"unsubscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        assert_eq!(resp["success"], json!(false));
        assert_eq!(resp["message"], json!("Subscription not found for this client"));
    }

    #[tokio::test]
    async fn disconnect_tears_down_keys_with_no_remaining_listeners() {
        let (registry, fake) = registry().await;
        let a = registry.register();
        registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        registry.disconnect(&a).await;
        assert_eq!(fake.delete_count(), 1);
        assert!(registry.subscription_snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn disconnect_preserves_keys_still_held_by_other_clients() {
        let (registry, fake) = registry().await;
        let a = registry.register();
        let b = registry.register();
        registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        registry
            .handle_request(&b, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        registry.disconnect(&a).await;
        assert_eq!(fake.delete_count(), 0);
        assert_eq!(registry.subscription_snapshot().await.len(), 1);
    }

    #[tokio::test]
    async fn bulk_subscribe_reports_per_pair_results_with_one_required_field_missing() {
        let (registry, _fake) = registry().await;
        let a = registry.register();
        let resp = registry
            .handle_request(
                &a,
                r#"{"action":"subscribe_many","pairs":[{"symbol":"BINANCE:BTCUSDT","timeframe":"1"},{"symbol":"","timeframe":""},{"symbol":"X","timeframe":"5"}]}"#,
            )
            .await;
        assert_eq!(resp["success"], json!(true));
        let results = resp["results"].as_array().expect("results array");
        assert_eq!(results[0]["success"], json!(true));
        assert_eq!(results[1]["success"], json!(false));
        assert_eq!(results[1]["message"], json!("symbol and timeframe required"));
        assert_eq!(results[2]["success"], json!(true));
    }

    #[tokio::test]
    async fn malformed_json_yields_an_invalid_json_error() {
        let (registry, _fake) = registry().await;
        let a = registry.register();
        let resp = registry.handle_request(&a, "not json").await;
        assert_eq!(resp["type"], json!("error"));
        assert_eq!(resp["message"], json!("Invalid JSON message"));
        assert!(resp.get("requestId").is_none());
    }

    #[tokio::test]
    async fn unknown_action_is_reported_by_name() {
        let (registry, _fake) = registry().await;
        let a = registry.register();
        let resp = registry
            .handle_request(&a, r#"{"action":"frobnicate","requestId":"r1"}"#)
            .await;
        assert_eq!(resp["type"], json!("error"));
        assert_eq!(resp["message"], json!("Unknown action: frobnicate"));
        assert_eq!(resp["requestId"], json!("r1"));
    }

    #[tokio::test]
    async fn pinned_keys_survive_disconnect_with_no_listeners() {
        let fake = FakeUpstreamClient::new();
        let mux = Arc::new(SubscriptionMultiplexer::new(Arc::new(fake.clone())));
        mux.connect().await.expect("connect");
        let pinned: HashSet<_> = [SubscriptionKey::new("X", "1")].into_iter().collect();
        mux.subscribe(&SubscriptionKey::new("X", "1"), "startup").await;
        let registry = ClientRegistry::new(Arc::clone(&mux), pinned);

        let a = registry.register();
        registry
            .handle_request(&a, r#"{"action":"subscribe","symbol":"X","timeframe":"1"}"#)
            .await;
        registry.disconnect(&a).await;

        assert_eq!(fake.delete_count(), 0, "pinned key must not be torn down");
        assert_eq!(mux.list().await.len(), 1);
    }
}
