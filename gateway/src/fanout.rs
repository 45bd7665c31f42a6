//! Bar Fan-out: every `bar` emitted by the Multiplexer is delivered to (a)
//! all connected client sessions and (b) the optional HTTP push sink and
//! debug price mirror. Runs as a single background task consuming the
//! Multiplexer's event bus, independent of the Health Monitor's own listener.

use crate::push_sink::PushSink;
use crate::registry::ClientRegistry;
use broker::{BrokerEvent, SubscriptionMultiplexer};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawns the fan-out task. Returns its handle so the caller can abort it
/// during shutdown.
pub fn spawn(
    mux: Arc<SubscriptionMultiplexer>,
    registry: Arc<ClientRegistry>,
    push_sink: PushSink,
    debug_prices_file: Option<mpsc::UnboundedSender<String>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = mux.events();
        loop {
            match events.recv().await {
                Ok(BrokerEvent::Bar { key, bar }) => {
                    registry.broadcast_bar(&key, &bar).await;
                    push_sink.push(&key, &bar);
                    if let Some(tx) = &debug_prices_file {
                        let line = serde_json::json!({
                            "symbol": key.symbol, "timeframe": key.timeframe,
                            "time": bar.time, "open": bar.open, "high": bar.high,
                            "low": bar.low, "close": bar.close, "volume": bar.volume,
                        })
                        .to_string();
                        let _ = tx.send(line);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Debug price mirror: a non-blocking writer appending every fanned-out bar
/// as a JSON line to `path`, independent of and never able to block the
/// WebSocket/HTTP sinks.
pub fn spawn_debug_price_writer(path: String) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
        let mut file = match file {
            Ok(f) => f,
            Err(e) => {
                warn!(path, error = %e, "failed to open DEBUG_PRICES file, disabling mirror");
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            if let Err(e) = file.write_all(format!("{line}\n").as_bytes()).await {
                warn!(error = %e, "debug price mirror write failed");
            }
        }
    });
    tx
}
