//! The canonical data model: `SubscriptionKey`, `Bar`, and timeframe
//! normalization.

use serde::{Deserialize, Serialize};

/// Canonical identity of a logical stream. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub timeframe: String,
}

impl SubscriptionKey {
    /// Build a key, normalizing `timeframe` at the boundary.
    #[must_use]
    pub fn new(symbol: impl Into<String>, timeframe: &str) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: normalize_timeframe(timeframe),
        }
    }
}

impl std::fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.symbol, self.timeframe)
    }
}

/// One OHLCV sample, already canonicalized (`high`/`low` resolved, `volume`
/// defaulted).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Normalize a timeframe string to its canonical form. Idempotent.
///
/// - trailing `"m"` stripped: `"5m"` → `"5"`
/// - trailing `"h"` converted to minutes: `"1h"` → `"60"`
/// - `"1d"`/`"d"` → `"D"`; `"1w"`/`"w"` → `"W"`; `"1M"`/`"M"` → `"M"`
#[must_use]
pub fn normalize_timeframe(raw: &str) -> String {
    match raw {
        "d" | "D" | "1d" | "1D" => return "D".to_string(),
        "w" | "W" | "1w" | "1W" => return "W".to_string(),
        "M" | "1M" => return "M".to_string(),
        _ => {}
    }

    if let Some(hours) = raw.strip_suffix('h').or_else(|| raw.strip_suffix('H')) {
        if let Ok(n) = hours.parse::<u64>() {
            return (n * 60).to_string();
        }
    }

    if let Some(minutes) = raw.strip_suffix('m') {
        if let Ok(n) = minutes.parse::<u64>() {
            return n.to_string();
        }
    }

    raw.to_string()
}

/// Milliseconds represented by one unit of a normalized timeframe.
///
/// `"D"` → 86 400 000, `"W"` → 604 800 000, `"M"` → 2 592 000 000 (30-day
/// approximation — staleness detection for monthly bars is coarse by
/// design), numeric strings → `minutes * 60_000`. Unparseable input yields
/// `None`.
#[must_use]
pub fn timeframe_ms(normalized: &str) -> Option<u64> {
    match normalized {
        "D" => Some(86_400_000),
        "W" => Some(604_800_000),
        "M" => Some(2_592_000_000),
        numeric => numeric.parse::<u64>().ok().map(|minutes| minutes * 60_000),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_trailing_minute_suffix() {
        assert_eq!(normalize_timeframe("5m"), "5");
    }

    #[test]
    fn converts_hours_to_minutes() {
        assert_eq!(normalize_timeframe("1h"), "60");
        assert_eq!(normalize_timeframe("4h"), "240");
    }

    #[test]
    fn maps_day_week_month_aliases() {
        for input in ["1d", "d", "D"] {
            assert_eq!(normalize_timeframe(input), "D");
        }
        for input in ["1w", "w", "W"] {
            assert_eq!(normalize_timeframe(input), "W");
        }
        for input in ["1M", "M"] {
            assert_eq!(normalize_timeframe(input), "M");
        }
    }

    #[test]
    fn is_idempotent_on_a_spread_of_inputs() {
        for input in [
            "1m", "5m", "1h", "4h", "1d", "d", "1w", "w", "1M", "M", "60", "D",
        ] {
            let once = normalize_timeframe(input);
            let twice = normalize_timeframe(&once);
            assert_eq!(once, twice, "not idempotent for {input}");
        }
    }

    #[test]
    fn passes_through_already_numeric_values() {
        assert_eq!(normalize_timeframe("60"), "60");
    }

    #[test]
    fn derives_timeframe_ms() {
        assert_eq!(timeframe_ms("D"), Some(86_400_000));
        assert_eq!(timeframe_ms("W"), Some(604_800_000));
        assert_eq!(timeframe_ms("M"), Some(2_592_000_000));
        assert_eq!(timeframe_ms("5"), Some(300_000));
        assert_eq!(timeframe_ms("garbage"), None);
    }

    #[test]
    fn key_new_normalizes_timeframe() {
        let key = SubscriptionKey::new("BINANCE:BTCUSDT", "5m");
        assert_eq!(key.timeframe, "5");
    }
}
