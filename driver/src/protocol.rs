//! Wire framing and message shapes for the upstream provider's socket.
//!
//! The provider multiplexes everything over one socket using a simple
//! length-prefixed envelope (`~m~<len>~m~<payload>`), with each payload a
//! small JSON object carrying a method name `m` and a positional parameter
//! array `p`. This module only knows about framing and the handful of
//! methods the driver needs; it has no opinion on subscription lifecycle.

use serde::Serialize;
use serde_json::Value;

/// Encode one payload into the provider's length-prefixed frame.
#[must_use]
pub fn encode_frame(payload: &str) -> String {
    format!("~m~{}~m~{payload}", payload.len())
}

/// Split a raw socket buffer into individual frame payloads.
///
/// Tolerant of multiple frames arriving concatenated in one text message,
/// which the provider does for heartbeats piggy-backed on data frames.
#[must_use]
pub fn split_frames(raw: &str) -> Vec<String> {
    let mut frames = Vec::new();
    let mut rest = raw;
    while let Some(after_marker) = rest.strip_prefix("~m~") {
        let Some(len_end) = after_marker.find("~m~") else {
            break;
        };
        let Ok(len) = after_marker[..len_end].parse::<usize>() else {
            break;
        };
        let payload_start = len_end + 3;
        if after_marker.len() < payload_start + len {
            break;
        }
        frames.push(after_marker[payload_start..payload_start + len].to_string());
        rest = &after_marker[payload_start + len..];
    }
    frames
}

/// A provider heartbeat frame looks like `~h~<n>` once unwrapped.
#[must_use]
pub fn is_heartbeat(payload: &str) -> bool {
    payload.starts_with("~h~")
}

#[derive(Debug, Serialize)]
struct Envelope<'a> {
    m: &'a str,
    p: Value,
}

/// Build a `chart_create_session` command.
#[must_use]
pub fn chart_create_session(chart_session: &str) -> String {
    envelope("chart_create_session", serde_json::json!([chart_session, ""]))
}

/// Build a `resolve_symbol` command.
#[must_use]
pub fn resolve_symbol(chart_session: &str, symbol_id: &str, symbol: &str) -> String {
    envelope(
        "resolve_symbol",
        serde_json::json!([
            chart_session,
            symbol_id,
            format!("={{\"symbol\":\"{symbol}\",\"adjustment\":\"splits\"}}")
        ]),
    )
}

/// Build a `create_series` command requesting the latest period only.
#[must_use]
pub fn create_series(chart_session: &str, symbol_id: &str, timeframe: &str) -> String {
    envelope(
        "create_series",
        serde_json::json!([chart_session, "s1", "s1", symbol_id, timeframe, 1]),
    )
}

/// Build a `modify_series` command used when a chart changes timeframe in place.
#[must_use]
pub fn modify_series(chart_session: &str, symbol_id: &str, timeframe: &str) -> String {
    envelope(
        "modify_series",
        serde_json::json!([chart_session, "s1", "s1", symbol_id, timeframe, ""]),
    )
}

/// Build a `chart_delete_session` command.
#[must_use]
pub fn chart_delete_session(chart_session: &str) -> String {
    envelope("chart_delete_session", serde_json::json!([chart_session]))
}

fn envelope(method: &str, params: Value) -> String {
    let env = Envelope { m: method, p: params };
    encode_frame(&serde_json::to_string(&env).unwrap_or_default())
}

/// A decoded provider message, before it is matched to a chart session.
#[derive(Debug, Clone)]
pub enum ProviderMessage {
    /// `timescale_update` — carries the chart session id and the series payload.
    TimescaleUpdate { chart_session: String, series: Value },
    /// `symbol_resolved` — the requested symbol loaded successfully.
    SymbolResolved { chart_session: String },
    /// `series_error` / `critical_error` — the chart session hit a driver error.
    SeriesError { chart_session: Option<String>, reason: String },
    /// Anything this driver doesn't act on.
    Other,
}

/// Parse one frame payload into a [`ProviderMessage`].
#[must_use]
pub fn parse_message(payload: &str) -> ProviderMessage {
    let Ok(value) = serde_json::from_str::<Value>(payload) else {
        return ProviderMessage::Other;
    };
    let Some(method) = value.get("m").and_then(Value::as_str) else {
        return ProviderMessage::Other;
    };
    let params = value.get("p").cloned().unwrap_or(Value::Null);
    match method {
        "timescale_update" => {
            let chart_session = params
                .get(0)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let series = params.get(1).cloned().unwrap_or(Value::Null);
            ProviderMessage::TimescaleUpdate { chart_session, series }
        }
        "symbol_resolved" => {
            let chart_session = params
                .get(0)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            ProviderMessage::SymbolResolved { chart_session }
        }
        "series_error" | "critical_error" => {
            let chart_session = params.get(0).and_then(Value::as_str).map(str::to_string);
            let reason = params
                .get(1)
                .and_then(Value::as_str)
                .unwrap_or("unknown provider error")
                .to_string();
            ProviderMessage::SeriesError { chart_session, reason }
        }
        _ => ProviderMessage::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_single_frame() {
        let frame = encode_frame("hello");
        assert_eq!(frame, "~m~5~m~hello");
        assert_eq!(split_frames(&frame), vec!["hello".to_string()]);
    }

    #[test]
    fn splits_concatenated_frames() {
        let raw = format!("{}{}", encode_frame("a"), encode_frame("bb"));
        assert_eq!(split_frames(&raw), vec!["a".to_string(), "bb".to_string()]);
    }

    #[test]
    fn recognises_heartbeat_payloads() {
        assert!(is_heartbeat("~h~42"));
        assert!(!is_heartbeat("{\"m\":\"x\"}"));
    }

    #[test]
    fn parses_timescale_update() {
        let payload = r#"{"m":"timescale_update","p":["cs_1",{"s1":{"s":[]}}]}"#;
        match parse_message(payload) {
            ProviderMessage::TimescaleUpdate { chart_session, .. } => {
                assert_eq!(chart_session, "cs_1");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn parses_series_error_with_missing_session() {
        let payload = r#"{"m":"critical_error","p":[null,"boom"]}"#;
        match parse_message(payload) {
            ProviderMessage::SeriesError { chart_session, reason } => {
                assert_eq!(chart_session, None);
                assert_eq!(reason, "boom");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
