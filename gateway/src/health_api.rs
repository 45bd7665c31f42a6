//! The Health HTTP API (§6): `GET /health`, `GET /status`, and the two
//! `POST /recovery/*` operator endpoints, all backed directly by the
//! Multiplexer and Health Monitor — no separate state, this module is a
//! thin axum front over the two components' existing query/command surface.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use broker::{HealthConfig, HealthMonitor, SubscriptionKey, SubscriptionMultiplexer};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

#[derive(Clone)]
pub struct HealthApiState {
    pub mux: Arc<SubscriptionMultiplexer>,
    pub monitor: Arc<HealthMonitor>,
    pub started_at: Instant,
}

pub fn router(state: HealthApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/recovery/subscription", post(recover_subscription))
        .route("/recovery/full-reconnect", post(recover_full_reconnect))
        .with_state(state)
}

async fn health(State(state): State<HealthApiState>) -> impl IntoResponse {
    let connected = state.mux.is_connected();
    let subscriptions = state.mux.list().await;
    let stale = state.monitor.stale_snapshot().await;

    let body = json!({
        "status": if connected { "ok" } else { "degraded" },
        "uptime": state.started_at.elapsed().as_secs(),
        "tradingview": {
            "connected": connected,
            "subscriptions": subscriptions.len(),
        },
        "health_monitor": {
            "active": state.monitor.is_active().await,
            "stale_subscriptions": stale.len(),
        },
    });

    let status = if connected { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}

async fn status(State(state): State<HealthApiState>) -> impl IntoResponse {
    let connected = state.mux.is_connected();
    let subscriptions = state.mux.snapshot_with_last_bar_time().await;
    let stale = state.monitor.stale_snapshot().await;
    let config = state.monitor.config();

    let subscriptions_json: Vec<_> = subscriptions
        .iter()
        .map(|(key, last_bar_time_ms)| {
            json!({
                "symbol": key.symbol,
                "timeframe": key.timeframe,
                "last_bar_time_ms": last_bar_time_ms,
            })
        })
        .collect();

    Json(json!({
        "status": if connected { "ok" } else { "degraded" },
        "uptime": state.started_at.elapsed().as_secs(),
        "tradingview": {
            "connected": connected,
            "subscriptions": subscriptions_json,
        },
        "health_monitor": {
            "active": state.monitor.is_active().await,
            "stale_subscriptions": stale,
            "config": health_config_json(config),
        },
    }))
}

fn health_config_json(config: &HealthConfig) -> serde_json::Value {
    json!({
        "checkIntervalMs": config.check_interval_ms,
        "staleThresholdMultiplier": config.stale_threshold_multiplier,
        "autoRecoveryEnabled": config.auto_recovery_enabled,
        "maxRecoveryAttempts": config.max_recovery_attempts,
        "fullReconnectThreshold": config.full_reconnect_threshold,
        "fullReconnectCooldownMs": config.full_reconnect_cooldown_ms,
    })
}

#[derive(Debug, Deserialize)]
struct RecoverySubscriptionRequest {
    symbol: String,
    timeframe: String,
}

#[derive(Debug, Serialize)]
struct RecoveryResponse {
    success: bool,
    message: String,
}

async fn recover_subscription(
    State(state): State<HealthApiState>,
    Json(req): Json<RecoverySubscriptionRequest>,
) -> impl IntoResponse {
    if req.symbol.is_empty() || req.timeframe.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(RecoveryResponse {
                success: false,
                message: "symbol and timeframe required".to_string(),
            }),
        );
    }

    let key = SubscriptionKey::new(&req.symbol, &req.timeframe);
    let recovered = state.monitor.trigger_manual_recovery(&key).await;
    let status = if recovered { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (
        status,
        Json(RecoveryResponse {
            success: recovered,
            message: if recovered {
                "recovery completed".to_string()
            } else {
                "recovery failed to resubscribe".to_string()
            },
        }),
    )
}

async fn recover_full_reconnect(State(state): State<HealthApiState>) -> impl IntoResponse {
    let ok = state.monitor.trigger_full_reconnect().await;
    let status = if ok { StatusCode::OK } else { StatusCode::INTERNAL_SERVER_ERROR };
    (
        status,
        Json(RecoveryResponse {
            success: ok,
            message: if ok {
                "full reconnect completed".to_string()
            } else {
                "full reconnect failed".to_string()
            },
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use broker::HealthConfig;
    use driver::testing::FakeUpstreamClient;
    use tower::ServiceExt;

    async fn test_app() -> (Router, Arc<SubscriptionMultiplexer>, FakeUpstreamClient) {
        let fake = FakeUpstreamClient::new();
        let mux = Arc::new(SubscriptionMultiplexer::new(Arc::new(fake.clone())));
        mux.connect().await.expect("connect");
        let monitor = HealthMonitor::new(Arc::clone(&mux), HealthConfig::default());
        let state = HealthApiState {
            mux: Arc::clone(&mux),
            monitor,
            started_at: Instant::now(),
        };
        (router(state), mux, fake)
    }

    #[tokio::test]
    async fn health_reports_200_when_connected() {
        let (app, _mux, _fake) = test_app().await;
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_503_when_disconnected() {
        let fake = FakeUpstreamClient::new();
        let mux = Arc::new(SubscriptionMultiplexer::new(Arc::new(fake)));
        let monitor = HealthMonitor::new(Arc::clone(&mux), HealthConfig::default());
        let state = HealthApiState {
            mux,
            monitor,
            started_at: Instant::now(),
        };
        let app = router(state);
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn recovery_subscription_requires_both_fields() {
        let (app, mux, _fake) = test_app().await;
        let key = SubscriptionKey::new("X", "1");
        mux.subscribe(&key, "seed").await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/recovery/subscription")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"symbol":"","timeframe":"1"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn full_reconnect_endpoint_returns_success() {
        let (app, mux, _fake) = test_app().await;
        let key = SubscriptionKey::new("X", "1");
        mux.subscribe(&key, "seed").await;

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/recovery/full-reconnect")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(mux.list().await, vec![key]);
    }
}
