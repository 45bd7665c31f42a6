//! The client-facing WebSocket front: accepts connections, reads one JSON
//! request per frame, and writes back protocol responses and bar broadcasts.

use crate::registry::ClientRegistry;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

#[derive(Clone)]
pub struct WebSocketState {
    pub registry: Arc<ClientRegistry>,
}

pub async fn handle_websocket(ws: WebSocketUpgrade, State(state): State<WebSocketState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: WebSocketState) {
    let session = state.registry.register();
    let client_id = session.id;
    info!(client_id, "client connected");

    let (sender, mut receiver) = socket.split();
    let sender = Arc::new(Mutex::new(sender));

    let greeting = json!({
        "type": "info", "success": true,
        "message": "Connected to TradingView WebSocket Server",
    });
    {
        let mut guard = sender.lock().await;
        let _ = guard.send(Message::Text(greeting.to_string())).await;
    }

    let mut outbox = session.subscribe_outbox();
    let sender_for_send = Arc::clone(&sender);
    let send_task = tokio::spawn(async move {
        loop {
            match outbox.recv().await {
                Ok(text) => {
                    let mut guard = sender_for_send.lock().await;
                    if guard.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    metrics::counter!("ws_errors_total").increment(1);
                    warn!(client_id, skipped = n, "client outbox overflowed, dropping oldest frames");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                let response = state.registry.handle_request(&session, &text).await;
                let mut guard = sender.lock().await;
                let _ = guard.send(Message::Text(response.to_string())).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => {
                let mut guard = sender.lock().await;
                if guard.send(Message::Pong(data)).await.is_err() {
                    break;
                }
            }
            Ok(Message::Pong(_) | Message::Binary(_)) => {}
            Err(e) => {
                warn!(error = %e, "client websocket error");
                break;
            }
        }
    }

    send_task.abort();
    state.registry.disconnect(&session).await;
    info!(client_id, "client disconnected");
}
