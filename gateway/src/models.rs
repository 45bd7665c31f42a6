//! Client-facing WebSocket wire protocol: one JSON object per frame, in
//! either direction.

use serde::{Deserialize, Serialize};

/// A `{symbol, timeframe}` pair as used in bulk requests.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Pair {
    #[serde(default)]
    pub symbol: String,
    #[serde(default)]
    pub timeframe: String,
}

/// Inbound client request. `action` drives dispatch; the remaining fields
/// are populated as needed for that action.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientRequest {
    pub action: String,
    pub symbol: Option<String>,
    pub timeframe: Option<String>,
    #[serde(default)]
    pub pairs: Option<Vec<Pair>>,
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

/// One `{symbol, timeframe}` outcome inside a bulk response's `results`.
#[derive(Debug, Clone, Serialize)]
pub struct PairResult {
    pub symbol: String,
    pub timeframe: String,
    pub success: bool,
    pub message: String,
}

/// A subscribed `(symbol, timeframe)` pair as it appears in a `list`/bulk
/// response's subscription snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionSnapshotEntry {
    pub symbol: String,
    pub timeframe: String,
}
