// =============================================================================
// Runtime Configuration — relay settings loaded from JSON + environment
// =============================================================================
//
// Every field carries `#[serde(default)]` so that a partial (or absent)
// config file still yields a complete configuration. Environment variables
// are applied on top of the file so deployments can override secrets and
// addresses without editing JSON.
// =============================================================================

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbols() -> Vec<String> {
    ["AAPL", "AMZN", "TSLA", "GOOGL", "NFLX", "PYPL"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_feed_url() -> String {
    "wss://ws.finnhub.io".to_string()
}

fn default_database_url() -> String {
    "sqlite://candles.db".to_string()
}

fn default_bucket_secs() -> u64 {
    60
}

fn default_delivery_interval_ms() -> u64 {
    500
}

fn default_retention_mins() -> u64 {
    20
}

fn default_prune_interval_secs() -> u64 {
    5
}

fn default_subscriber_queue() -> usize {
    256
}

fn default_reconnect_base_secs() -> u64 {
    1
}

fn default_reconnect_max_secs() -> u64 {
    30
}

// =============================================================================
// RuntimeConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Market data --------------------------------------------------------

    /// Symbols subscribed on the upstream feed.
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,

    /// Trade feed WebSocket endpoint (the API key is appended as `?token=`).
    #[serde(default = "default_feed_url")]
    pub feed_url: String,

    /// Feed API key. Usually supplied through the environment.
    #[serde(default)]
    pub api_key: String,

    // --- Aggregation & delivery ---------------------------------------------

    /// Candle bucket length in seconds.
    #[serde(default = "default_bucket_secs")]
    pub bucket_secs: u64,

    /// How often pending live updates are flushed to subscribers.
    #[serde(default = "default_delivery_interval_ms")]
    pub delivery_interval_ms: u64,

    /// Outbound queue depth per subscriber. A full queue drops the subscriber.
    #[serde(default = "default_subscriber_queue")]
    pub subscriber_queue: usize,

    // --- Persistence --------------------------------------------------------

    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Closed candles older than this many minutes are pruned.
    #[serde(default = "default_retention_mins")]
    pub retention_mins: u64,

    /// Minimum gap between two prune requests.
    #[serde(default = "default_prune_interval_secs")]
    pub prune_interval_secs: u64,

    // --- Network ------------------------------------------------------------

    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// First reconnect delay after the feed drops; doubles up to the max.
    #[serde(default = "default_reconnect_base_secs")]
    pub reconnect_base_secs: u64,

    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            feed_url: default_feed_url(),
            api_key: String::new(),
            bucket_secs: default_bucket_secs(),
            delivery_interval_ms: default_delivery_interval_ms(),
            subscriber_queue: default_subscriber_queue(),
            database_url: default_database_url(),
            retention_mins: default_retention_mins(),
            prune_interval_secs: default_prune_interval_secs(),
            bind_addr: default_bind_addr(),
            reconnect_base_secs: default_reconnect_base_secs(),
            reconnect_max_secs: default_reconnect_max_secs(),
        }
    }
}

/// Upper bounds that keep every derived duration representable.
const MAX_BUCKET_SECS: u64 = 7 * 24 * 3600;
const MAX_RETENTION_MINS: u64 = 366 * 24 * 60;
const MAX_PRUNE_INTERVAL_SECS: u64 = 24 * 3600;
const MAX_DELIVERY_INTERVAL_MS: u64 = 60_000;
const MAX_RECONNECT_SECS: u64 = 3600;
const MAX_SUBSCRIBER_QUEUE: usize = 65_536;

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read relay config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse relay config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbols = ?config.symbols,
            "relay config loaded"
        );

        Ok(config)
    }

    /// Apply environment overrides through `lookup` (normally
    /// `std::env::var(..).ok()`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(syms) = lookup("RELAY_SYMBOLS") {
            self.symbols = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(addr) = lookup("RELAY_BIND_ADDR") {
            self.bind_addr = addr;
        } else if let Some(port) = lookup("SERVER_PORT") {
            self.bind_addr = format!("0.0.0.0:{}", port.trim());
        }
        if let Some(key) = lookup("FINNHUB_API_KEY").or_else(|| lookup("API_KEY")) {
            self.api_key = key;
        }
        if let Some(url) = lookup("RELAY_FEED_URL") {
            self.feed_url = url;
        }
        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = url;
        }
    }

    /// Reject settings that would stall or break the pipeline.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("at least one symbol must be configured");
        }
        if self.bucket_secs == 0 || self.bucket_secs > MAX_BUCKET_SECS {
            bail!("bucket_secs must be in 1..={MAX_BUCKET_SECS}");
        }
        if self.retention_mins == 0 || self.retention_mins > MAX_RETENTION_MINS {
            bail!("retention_mins must be in 1..={MAX_RETENTION_MINS}");
        }
        if self.prune_interval_secs == 0 || self.prune_interval_secs > MAX_PRUNE_INTERVAL_SECS {
            bail!("prune_interval_secs must be in 1..={MAX_PRUNE_INTERVAL_SECS}");
        }
        if self.delivery_interval_ms == 0 || self.delivery_interval_ms > MAX_DELIVERY_INTERVAL_MS {
            bail!("delivery_interval_ms must be in 1..={MAX_DELIVERY_INTERVAL_MS}");
        }
        if self.subscriber_queue == 0 || self.subscriber_queue > MAX_SUBSCRIBER_QUEUE {
            bail!("subscriber_queue must be in 1..={MAX_SUBSCRIBER_QUEUE}");
        }
        if self.reconnect_base_secs == 0
            || self.reconnect_max_secs < self.reconnect_base_secs
            || self.reconnect_max_secs > MAX_RECONNECT_SECS
        {
            bail!("reconnect delays must satisfy 0 < base <= max <= {MAX_RECONNECT_SECS}");
        }
        Ok(())
    }

    pub fn bucket_len(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.bucket_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.retention_mins as i64)
    }

    pub fn prune_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.prune_interval_secs as i64)
    }

    pub fn delivery_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.delivery_interval_ms)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.symbols.len(), 6);
        assert_eq!(cfg.symbols[0], "AAPL");
        assert_eq!(cfg.symbols[5], "PYPL");
        assert_eq!(cfg.bucket_secs, 60);
        assert_eq!(cfg.delivery_interval_ms, 500);
        assert_eq!(cfg.retention_mins, 20);
        assert_eq!(cfg.retention(), chrono::Duration::minutes(20));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.feed_url, "wss://ws.finnhub.io");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080");
        assert_eq!(cfg.subscriber_queue, 256);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbols": ["NFLX"], "bucket_secs": 300 }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbols, vec!["NFLX"]);
        assert_eq!(cfg.bucket_len(), chrono::Duration::minutes(5));
        assert_eq!(cfg.delivery_interval_ms, 500);
    }

    #[test]
    fn env_overrides_take_precedence() {
        let env: HashMap<&str, &str> = [
            ("RELAY_SYMBOLS", " aapl, msft ,,"),
            ("SERVER_PORT", "9000"),
            ("API_KEY", "secret"),
            ("DATABASE_URL", "sqlite::memory:"),
        ]
        .into_iter()
        .collect();

        let mut cfg = RuntimeConfig::default();
        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(cfg.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(cfg.bind_addr, "0.0.0.0:9000");
        assert_eq!(cfg.api_key, "secret");
        assert_eq!(cfg.database_url, "sqlite::memory:");
    }

    #[test]
    fn validate_rejects_degenerate_settings() {
        let mut cfg = RuntimeConfig::default();
        cfg.delivery_interval_ms = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.symbols.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.reconnect_max_secs = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.retention_mins = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_oversized_durations() {
        let mut cfg = RuntimeConfig::default();
        cfg.bucket_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.retention_mins = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.prune_interval_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.reconnect_max_secs = u64::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.subscriber_queue = usize::MAX;
        assert!(cfg.validate().is_err());

        let mut cfg = RuntimeConfig::default();
        cfg.bucket_secs = MAX_BUCKET_SECS;
        cfg.retention_mins = MAX_RETENTION_MINS;
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.bucket_len(), chrono::Duration::days(7));
        assert_eq!(cfg.retention(), chrono::Duration::minutes(MAX_RETENTION_MINS as i64));
    }

    #[test]
    fn load_missing_file_is_an_error() {
        assert!(RuntimeConfig::load("/nonexistent/relay_config.json").is_err());
    }
}
