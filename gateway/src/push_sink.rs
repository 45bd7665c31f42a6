//! The optional HTTP push sink: POSTs every bar to a configured webhook,
//! with bounded retries and a fixed backoff. Failures here must never
//! delay or block the WebSocket fan-out — every push runs on its own
//! detached task.

use broker::{Bar, SubscriptionKey};
use serde_json::json;
use std::time::{Duration, Instant};
use tracing::warn;

const DEFAULT_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF_SECS: u64 = 1;

#[derive(Clone)]
pub struct PushSink {
    client: reqwest::Client,
    endpoint: Option<String>,
    api_key: String,
    attempts: u32,
    backoff: Duration,
}

impl PushSink {
    #[must_use]
    pub fn new(endpoint: Option<String>, api_key: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
            attempts: DEFAULT_ATTEMPTS,
            backoff: Duration::from_secs(DEFAULT_BACKOFF_SECS),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Fires the push on a detached task; never awaited by the caller.
    pub fn push(&self, key: &SubscriptionKey, bar: &Bar) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        let client = self.client.clone();
        let api_key = self.api_key.clone();
        let attempts = self.attempts;
        let backoff = self.backoff;
        let payload = json!({
            "symbol": key.symbol, "time": bar.time, "open": bar.open,
            "high": bar.high, "low": bar.low, "close": bar.close,
            "volume": bar.volume, "timeframe": key.timeframe,
        });

        tokio::spawn(async move {
            for attempt in 0..=attempts {
                let started = Instant::now();
                let result = client
                    .post(&endpoint)
                    .header("Content-Type", "application/json")
                    .header("X-Api-Key", &api_key)
                    .json(&payload)
                    .send()
                    .await;
                let elapsed = started.elapsed().as_secs_f64();
                metrics::histogram!("http_push_latency_seconds").record(elapsed);

                match result {
                    Ok(resp) if resp.status().is_success() => {
                        metrics::counter!("bars_pushed_total").increment(1);
                        return;
                    }
                    Ok(resp) => {
                        warn!(status = %resp.status(), attempt, "push sink returned non-success status");
                    }
                    Err(e) => {
                        warn!(error = %e, attempt, "push sink request failed");
                    }
                }

                if attempt < attempts {
                    tokio::time::sleep(backoff).await;
                }
            }
            warn!(endpoint, "push sink exhausted retries, dropping bar");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_without_an_endpoint() {
        let sink = PushSink::new(None, String::new());
        assert!(!sink.is_enabled());
    }

    #[test]
    fn enabled_with_an_endpoint() {
        let sink = PushSink::new(Some("http://localhost:9/webhook".to_string()), "key".to_string());
        assert!(sink.is_enabled());
    }
}
