//! Market-data fan-out broker — gateway binary.
//!
//! Wires the Upstream Driver, Subscription Multiplexer and Health Monitor
//! (the `broker`/`driver` crates) to the client-facing surfaces owned by
//! this crate: the WebSocket front, the Prometheus metrics endpoint and the
//! Health HTTP API. `main` owns all three long-lived components; the
//! Health Monitor and the client front hold only non-owning `Arc`
//! references to the Multiplexer (spec §9).

use anyhow::{Context, Result};
use axum::Router;
use broker::{HealthMonitor, SubscriptionKey, SubscriptionMultiplexer};
use driver::{TradingViewClient, TradingViewConfig};
use gateway::health_api::{self, HealthApiState};
use gateway::push_sink::PushSink;
use gateway::websocket::{self, WebSocketState};
use gateway::{fanout, BrokerConfig, ClientRegistry};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match BrokerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal: invalid configuration: {e:#}");
            std::process::exit(1);
        }
    };

    init_logging(&config);
    info!(
        websocket_port = config.websocket_port,
        metrics_port = config.metrics_port,
        health_port = config.health_port,
        "starting market-data fan-out broker"
    );

    let metrics_handle = gateway::metrics::install();

    let driver = Arc::new(TradingViewClient::new(TradingViewConfig {
        ws_url: common::constants::TRADINGVIEW_WS_URL.to_string(),
        proxy: config.tv_api_proxy.clone(),
        connect_timeout: Duration::from_millis(config.tv_api_timeout_ms),
    }));

    let mux = Arc::new(SubscriptionMultiplexer::new(driver));
    if let Err(e) = mux.connect().await {
        error!(error = %e, "failed to open the initial upstream session, continuing; health monitor and reconnect will retry");
    }

    let pinned: HashSet<SubscriptionKey> = config
        .subscriptions
        .iter()
        .map(|(symbol, timeframe)| SubscriptionKey::new(symbol, timeframe))
        .collect();
    for key in &pinned {
        mux.subscribe(key, "startup").await;
    }

    let monitor = HealthMonitor::new(Arc::clone(&mux), config.health.clone());
    monitor.start().await;

    let registry = ClientRegistry::new(Arc::clone(&mux), pinned);
    let push_sink = PushSink::new(config.backend_endpoint.clone(), config.backend_api_key.clone());
    let debug_prices_tx = if config.debug_prices {
        config
            .prices_log_file
            .clone()
            .map(fanout::spawn_debug_price_writer)
    } else {
        None
    };
    let fanout_task = fanout::spawn(Arc::clone(&mux), Arc::clone(&registry), push_sink, debug_prices_tx);

    let ws_handle = if config.websocket_enabled {
        Some(spawn_websocket_server(config.websocket_port, registry).await?)
    } else {
        info!("WEBSOCKET_ENABLED is false, client front disabled");
        None
    };

    let metrics_handle_task = spawn_metrics_server(config.metrics_port, metrics_handle).await?;
    let health_api_task = spawn_health_api_server(config.health_port, Arc::clone(&mux), Arc::clone(&monitor)).await?;

    shutdown_signal().await;
    info!("shutdown signal received, stopping services");

    if let Some(handle) = ws_handle {
        handle.abort();
    }
    metrics_handle_task.abort();
    health_api_task.abort();
    fanout_task.abort();

    monitor.stop().await;
    mux.close().await;

    info!("shutdown complete");
    Ok(())
}

fn init_logging(config: &BrokerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "gateway={0},broker={0},driver={0}",
            config.log_level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);

    match &config.log_file {
        Some(path) => {
            let directory = std::path::Path::new(path).parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "broker.log".to_string());
            let file_appender = tracing_appender::rolling::never(directory, file_name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            // Leaked deliberately: the guard must outlive `main`, and this
            // process has exactly one logger for its whole lifetime.
            Box::leak(Box::new(guard));
            registry
                .with(tracing_subscriber::fmt::layer())
                .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
        }
        None => {
            registry.with(tracing_subscriber::fmt::layer()).init();
        }
    }
}

async fn spawn_websocket_server(
    port: u16,
    registry: Arc<ClientRegistry>,
) -> Result<tokio::task::JoinHandle<()>> {
    let state = WebSocketState { registry };
    let app = Router::new()
        .route("/", axum::routing::get(websocket::handle_websocket))
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding WebSocket listener on {addr}"))?;
    info!(%addr, "client WebSocket front listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "websocket server exited");
        }
    }))
}

async fn spawn_metrics_server(
    port: u16,
    handle: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    info!(%addr, "metrics endpoint listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "metrics server exited");
        }
    }))
}

async fn spawn_health_api_server(
    port: u16,
    mux: Arc<SubscriptionMultiplexer>,
    monitor: Arc<HealthMonitor>,
) -> Result<tokio::task::JoinHandle<()>> {
    let state = HealthApiState {
        mux,
        monitor,
        started_at: Instant::now(),
    };
    let app = health_api::router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding Health HTTP API listener on {addr}"))?;
    info!(%addr, "health HTTP API listening");

    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "health API server exited");
        }
    }))
}

/// Waits for `SIGINT` or `SIGTERM` (Unix) to initiate orderly shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => error!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}
