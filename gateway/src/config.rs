//! Environment-variable-driven configuration, read once at startup.
//!
//! The teacher's `GatewayConfig` layers a TOML file under `config::Config`
//! with an environment overlay; this broker's configuration surface is a
//! flat set of environment variables (there is no nested document to load),
//! so `BrokerConfig::from_env` reads `std::env` directly instead.

use anyhow::{Context, Result};
use broker::HealthConfig;
use common::constants::{
    DEFAULT_HEALTH_PORT, DEFAULT_METRICS_PORT, DEFAULT_UPSTREAM_TIMEOUT_MS, DEFAULT_WEBSOCKET_PORT,
};
use common::errors::ConfigError;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct SubscriptionSeed {
    symbol: String,
    timeframe: String,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub tv_api_proxy: Option<String>,
    pub tv_api_timeout_ms: u64,
    pub subscriptions: Vec<(String, String)>,
    pub backend_endpoint: Option<String>,
    pub backend_api_key: String,
    pub websocket_port: u16,
    pub websocket_enabled: bool,
    pub metrics_port: u16,
    pub health_port: u16,
    pub log_level: String,
    pub log_file: Option<String>,
    pub debug_prices: bool,
    pub prices_log_file: Option<String>,
    pub health: HealthConfig,
}

fn env_opt(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(var: &'static str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env_opt(var) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|e| {
            ConfigError::InvalidValue {
                var,
                source: e.to_string(),
            }
            .into()
        }),
    }
}

impl BrokerConfig {
    pub fn from_env() -> Result<Self> {
        let subscriptions = match env_opt("SUBSCRIPTIONS") {
            None => Vec::new(),
            Some(raw) => {
                let seeds: Vec<SubscriptionSeed> = serde_json::from_str(&raw)
                    .map_err(|e| ConfigError::MalformedSubscriptions(e.to_string()))
                    .context("parsing SUBSCRIPTIONS")?;
                seeds.into_iter().map(|s| (s.symbol, s.timeframe)).collect()
            }
        };

        let health = HealthConfig {
            check_interval_ms: env_parse("HEALTH_CHECK_INTERVAL_MS", 60_000)?,
            stale_threshold_multiplier: env_parse("HEALTH_STALE_THRESHOLD_MULTIPLIER", 3.0)?,
            auto_recovery_enabled: env_parse("HEALTH_AUTO_RECOVERY_ENABLED", true)?,
            max_recovery_attempts: env_parse("HEALTH_MAX_RECOVERY_ATTEMPTS", 3)?,
            full_reconnect_threshold: env_parse("HEALTH_FULL_RECONNECT_THRESHOLD", 3)?,
            full_reconnect_cooldown_ms: env_parse("HEALTH_FULL_RECONNECT_COOLDOWN_MS", 600_000)?,
        };

        Ok(Self {
            tv_api_proxy: env_opt("TV_API_PROXY"),
            tv_api_timeout_ms: env_parse("TV_API_TIMEOUT_MS", DEFAULT_UPSTREAM_TIMEOUT_MS)?,
            subscriptions,
            backend_endpoint: env_opt("BACKEND_ENDPOINT"),
            backend_api_key: env_opt("BACKEND_API_KEY").unwrap_or_default(),
            websocket_port: env_parse("WEBSOCKET_PORT", DEFAULT_WEBSOCKET_PORT)?,
            websocket_enabled: env_parse("WEBSOCKET_ENABLED", true)?,
            metrics_port: env_parse("METRICS_PORT", DEFAULT_METRICS_PORT)?,
            health_port: env_parse("HEALTH_PORT", DEFAULT_HEALTH_PORT)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_file: env_opt("LOG_FILE"),
            debug_prices: env_parse("DEBUG_PRICES", false)?,
            prices_log_file: env_opt("PRICES_LOG_FILE"),
            health,
        })
    }
}
