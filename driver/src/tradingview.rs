//! Concrete [`UpstreamClient`] backed by a single multiplexed WebSocket
//! session to the streaming OHLCV provider.
//!
//! One socket carries every chart. Each [`TradingViewChartHandle`] registers
//! its own provider-side chart session id and gets its own event channel;
//! the reader task demultiplexes incoming frames by that id. Reconnect
//! backoff lives entirely inside [`TradingViewClient::connect`] — once
//! connected, a lost socket surfaces as an `Error` event on every open chart
//! and the caller (the Subscription Multiplexer / Health Monitor) decides
//! whether to call `connect` again.

use crate::backoff::ReconnectBackoff;
use crate::contract::{ChartEvent, ChartHandle, OpenedChart, RawPeriod, UpstreamClient};
use crate::protocol::{self, ProviderMessage};
use async_trait::async_trait;
use common::BrokerError;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection parameters for the upstream provider socket.
#[derive(Debug, Clone)]
pub struct TradingViewConfig {
    pub ws_url: String,
    /// Proxy URL, if configured. Connecting through it is not yet
    /// implemented; a configured proxy is logged and otherwise ignored.
    pub proxy: Option<String>,
    pub connect_timeout: Duration,
}

struct Inner {
    config: TradingViewConfig,
    connected: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    charts: DashMap<String, mpsc::Sender<ChartEvent>>,
    next_id: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    backoff: Mutex<ReconnectBackoff>,
}

/// A single upstream WebSocket session shared by every open chart.
pub struct TradingViewClient {
    inner: Arc<Inner>,
}

impl TradingViewClient {
    #[must_use]
    pub fn new(config: TradingViewConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connected: AtomicBool::new(false),
                outbound: Mutex::new(None),
                charts: DashMap::new(),
                next_id: AtomicU64::new(0),
                tasks: Mutex::new(Vec::new()),
                backoff: Mutex::new(ReconnectBackoff::new()),
            }),
        }
    }

    async fn try_connect_once(&self) -> Result<(), BrokerError> {
        if let Some(proxy) = &self.inner.config.proxy {
            if !proxy.is_empty() {
                warn!(proxy, "TV_API_PROXY is configured but proxied connect is unsupported; connecting directly");
            }
        }

        let connect = connect_async(&self.inner.config.ws_url);
        let (stream, _response) = tokio::time::timeout(self.inner.config.connect_timeout, connect)
            .await
            .map_err(|_| BrokerError::Driver("connect timed out".to_string()))?
            .map_err(|e| BrokerError::Driver(format!("connect failed: {e}")))?;

        let (mut write, mut read) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let inner = Arc::clone(&self.inner);
        let reply_tx = out_tx.clone();
        let reader = tokio::spawn(async move {
            Self::read_loop(&mut read, &inner, &reply_tx).await;
            inner.connected.store(false, Ordering::SeqCst);
            *inner.outbound.lock() = None;
            for entry in inner.charts.iter() {
                let _ = entry
                    .value()
                    .try_send(ChartEvent::Error("upstream connection closed".to_string()));
            }
        });

        *self.inner.outbound.lock() = Some(out_tx);
        self.inner.connected.store(true, Ordering::SeqCst);
        let mut tasks = self.inner.tasks.lock();
        tasks.push(writer);
        tasks.push(reader);
        Ok(())
    }

    async fn read_loop(
        read: &mut futures_util::stream::SplitStream<WsStream>,
        inner: &Arc<Inner>,
        reply_tx: &mpsc::UnboundedSender<String>,
    ) {
        while let Some(msg) = read.next().await {
            let text = match msg {
                Ok(Message::Text(t)) => t,
                Ok(Message::Ping(_) | Message::Pong(_)) => continue,
                Ok(Message::Close(frame)) => {
                    info!(?frame, "upstream closed the session");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    warn!(error = %e, "upstream socket error");
                    break;
                }
            };

            for frame in protocol::split_frames(&text) {
                if protocol::is_heartbeat(&frame) {
                    let _ = reply_tx.send(protocol::encode_frame(&frame));
                    continue;
                }
                Self::dispatch(&frame, inner);
            }
        }
    }

    fn dispatch(frame: &str, inner: &Arc<Inner>) {
        match protocol::parse_message(frame) {
            ProviderMessage::TimescaleUpdate { chart_session, series } => {
                let Some(period) = extract_latest_period(&series) else {
                    debug!(chart_session, "timescale_update with no usable series point");
                    return;
                };
                if let Some(tx) = inner.charts.get(&chart_session) {
                    let _ = tx.try_send(ChartEvent::Update(period));
                }
            }
            ProviderMessage::SymbolResolved { chart_session } => {
                if let Some(tx) = inner.charts.get(&chart_session) {
                    let _ = tx.try_send(ChartEvent::SymbolLoaded);
                }
            }
            ProviderMessage::SeriesError { chart_session, reason } => match chart_session {
                Some(cs) => {
                    if let Some(tx) = inner.charts.get(&cs) {
                        let _ = tx.try_send(ChartEvent::Error(reason));
                    }
                }
                None => {
                    for entry in inner.charts.iter() {
                        let _ = entry.value().try_send(ChartEvent::Error(reason.clone()));
                    }
                }
            },
            ProviderMessage::Other => {}
        }
    }

    fn send(&self, frame: String) -> Result<(), BrokerError> {
        let guard = self.inner.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(BrokerError::NotConnected);
        };
        tx.send(frame)
            .map_err(|_| BrokerError::Driver("outbound channel closed".to_string()))
    }
}

#[async_trait]
impl UpstreamClient for TradingViewClient {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.inner.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        loop {
            match self.try_connect_once().await {
                Ok(()) => {
                    self.inner.backoff.lock().reset();
                    return Ok(());
                }
                Err(e) => {
                    let delay = self.inner.backoff.lock().next_delay();
                    match delay {
                        Some(d) => {
                            warn!(error = %e, delay_ms = d.as_millis(), "upstream connect failed, retrying");
                            tokio::time::sleep(d).await;
                        }
                        None => return Err(BrokerError::MaxReconnectAttempts),
                    }
                }
            }
        }
    }

    async fn open_chart(&self) -> Result<OpenedChart, BrokerError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let chart_session = format!("cs_{id}");
        let (tx, rx) = mpsc::channel(64);
        self.inner.charts.insert(chart_session.clone(), tx);
        self.send(protocol::chart_create_session(&chart_session))?;

        Ok(OpenedChart {
            handle: Box::new(TradingViewChartHandle {
                inner: Arc::clone(&self.inner),
                chart_session,
                series_created: AtomicBool::new(false),
            }),
            events: rx,
        })
    }

    async fn end(&self) -> Result<(), BrokerError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        *self.inner.outbound.lock() = None;
        self.inner.charts.clear();
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct TradingViewChartHandle {
    inner: Arc<Inner>,
    chart_session: String,
    series_created: AtomicBool,
}

#[async_trait]
impl ChartHandle for TradingViewChartHandle {
    async fn set_market(&self, symbol: &str, timeframe: &str) -> Result<(), BrokerError> {
        let guard = self.inner.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(BrokerError::NotConnected);
        };
        let symbol_id = format!("{}_sym", self.chart_session);
        let send = |frame: String| -> Result<(), BrokerError> {
            tx.send(frame)
                .map_err(|_| BrokerError::Driver("outbound channel closed".to_string()))
        };
        send(protocol::resolve_symbol(&self.chart_session, &symbol_id, symbol))?;
        if self.series_created.swap(true, Ordering::SeqCst) {
            send(protocol::modify_series(&self.chart_session, &symbol_id, timeframe))
        } else {
            send(protocol::create_series(&self.chart_session, &symbol_id, timeframe))
        }
    }

    async fn delete(&self) -> Result<(), BrokerError> {
        self.inner.charts.remove(&self.chart_session);
        let guard = self.inner.outbound.lock();
        if let Some(tx) = guard.as_ref() {
            let _ = tx.send(protocol::chart_delete_session(&self.chart_session));
        }
        Ok(())
    }
}

/// Extract the most recent OHLCV point from a `timescale_update` series payload.
///
/// The provider nests the series under an arbitrary series key (conventionally
/// `s1`) as `{"s1": {"s": [{"i": 0, "v": [time, open, high, low, close, volume]}]}}`.
fn extract_latest_period(series: &serde_json::Value) -> Option<RawPeriod> {
    let point = series
        .as_object()?
        .values()
        .find_map(|v| v.get("s"))?
        .as_array()?
        .last()?
        .get("v")?
        .as_array()?;

    let get = |i: usize| point.get(i).and_then(serde_json::Value::as_f64);
    let time = get(0)?;
    let open = get(1)?;
    let high = get(2);
    let low = get(3);
    let close = get(4)?;
    let volume = get(5);

    Some(RawPeriod {
        time: time as i64,
        open,
        close,
        high,
        low,
        max: None,
        min: None,
        volume,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extracts_latest_point_with_high_low() {
        let series = json!({"s1": {"s": [{"i": 0, "v": [1_700_000_000.0, 10.0, 12.0, 9.0, 11.0, 5.0]}]}});
        let period = extract_latest_period(&series).expect("period");
        assert_eq!(period.time, 1_700_000_000);
        assert_eq!(period.resolved_high(), 12.0);
        assert_eq!(period.resolved_low(), 9.0);
        assert_eq!(period.resolved_volume(), 5.0);
    }

    #[test]
    fn missing_series_yields_none() {
        let series = json!({"s1": {"s": []}});
        assert!(extract_latest_period(&series).is_none());
    }

    #[test]
    fn missing_volume_defaults_to_zero() {
        let series = json!({"s1": {"s": [{"i": 0, "v": [1.0, 2.0, 3.0, 1.0, 2.5]}]}});
        let period = extract_latest_period(&series).expect("period");
        assert_eq!(period.resolved_volume(), 0.0);
    }
}
