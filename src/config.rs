//! Bot configuration
//!
//! Loaded from an optional TOML file; every field falls back to a default so
//! an empty file (or no file at all) yields a runnable BTCUSDT setup.
//! API credentials are never read from the file, only from the environment.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{BotError, BotResult};

/// WebSocket endpoints
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    pub public: String,
    pub private: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            public: "wss://ws.bitget.com/v2/ws/public".to_string(),
            private: "wss://ws.bitget.com/v2/ws/private".to_string(),
        }
    }
}

/// Outbound command batching
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Exchange cap on messages per flush
    pub max_batch_size: usize,
    pub batch_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 49,
            batch_interval_ms: 1001,
        }
    }
}

/// Strategy timers
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub update_interval_ms: u64,
    /// Delay between a sell fill and the reconciliation it triggers
    pub sell_fill_settle_ms: u64,
    pub status_log_interval_secs: u64,
    pub processed_retention_secs: u64,
    pub processed_sweep_interval_secs: u64,
    /// Re-send a cancel that has not been confirmed after this long
    pub cancel_retry_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            update_interval_ms: 1000,
            sell_fill_settle_ms: 100,
            status_log_interval_secs: 60,
            processed_retention_secs: 24 * 60 * 60,
            processed_sweep_interval_secs: 60 * 60,
            cancel_retry_ms: 10_000,
        }
    }
}

/// Per-channel transport tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// TCP + WebSocket handshake budget per connect attempt
    pub connect_timeout_ms: u64,
    pub ping_interval_ms: u64,
    pub pong_timeout_ms: u64,
    /// Scheduled full reconnect, ahead of the exchange's 24h session expiry
    pub reconnect_interval_ms: u64,
    pub rotation_settle_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_cooldown_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            ping_interval_ms: 29_000,
            pong_timeout_ms: 5_000,
            reconnect_interval_ms: 85_800_000,
            rotation_settle_ms: 3_000,
            backoff_base_ms: 1_000,
            backoff_max_ms: 30_000,
            max_reconnect_attempts: 5,
            reconnect_cooldown_ms: 60_000,
        }
    }
}

/// API credentials, environment only
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub secret_key: String,
    pub passphrase: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var("BITGET_API_KEY").unwrap_or_default(),
            secret_key: std::env::var("BITGET_SECRET_KEY").unwrap_or_default(),
            passphrase: std::env::var("BITGET_PASSPHRASE").unwrap_or_default(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.secret_key.is_empty() && !self.passphrase.is_empty()
    }
}

/// First `visible` characters of a key, for logs
pub(crate) fn mask_key(key: &str, visible: usize) -> String {
    let shown: String = key.chars().take(visible).collect();
    format!("{}...", shown)
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &mask_key(&self.api_key, 6))
            .finish()
    }
}

/// Full bot configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub symbol: String,
    pub inst_type: String,
    /// Order budget: resting buys + sells
    pub max_orders: usize,
    pub price_step: f64,
    /// Fixed notional per ladder rung
    pub order_amount_usdt: f64,
    pub price_precision: u32,
    pub size_precision: u32,
    pub ws_endpoints: Endpoints,
    pub batch: BatchConfig,
    pub strategy: StrategyConfig,
    pub transport: TransportConfig,
    #[serde(skip)]
    pub credentials: Credentials,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            inst_type: "SPOT".to_string(),
            max_orders: 10,
            price_step: 10.0,
            order_amount_usdt: 2.0,
            price_precision: 2,
            size_precision: 6,
            ws_endpoints: Endpoints::default(),
            batch: BatchConfig::default(),
            strategy: StrategyConfig::default(),
            transport: TransportConfig::default(),
            credentials: Credentials::default(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document; credentials are left empty
    pub fn from_toml_str(text: &str) -> BotResult<Self> {
        toml::from_str(text).map_err(|e| BotError::InvalidConfig(e.to_string()))
    }

    /// Load from an optional file, then pull credentials from the environment
    /// (a `.env` file is honoured)
    pub fn load(path: Option<&Path>) -> BotResult<Self> {
        let _ = dotenvy::dotenv();

        let mut config = match path {
            Some(p) => {
                let text = std::fs::read_to_string(p).map_err(|e| {
                    BotError::InvalidConfig(format!("cannot read {}: {}", p.display(), e))
                })?;
                Self::from_toml_str(&text)?
            }
            None => Self::default(),
        };
        config.credentials = Credentials::from_env();
        Ok(config)
    }

    pub fn validate(&self) -> BotResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(BotError::InvalidConfig("symbol is empty".into()));
        }
        if !(self.price_step > 0.0) {
            return Err(BotError::InvalidConfig(format!(
                "price_step must be positive, got {}",
                self.price_step
            )));
        }
        if !(self.order_amount_usdt > 0.0) {
            return Err(BotError::InvalidConfig(format!(
                "order_amount_usdt must be positive, got {}",
                self.order_amount_usdt
            )));
        }
        if self.max_orders == 0 {
            return Err(BotError::InvalidConfig("max_orders must be at least 1".into()));
        }
        if self.batch.max_batch_size == 0 {
            return Err(BotError::InvalidConfig("batch.max_batch_size must be at least 1".into()));
        }
        if self.batch.batch_interval_ms == 0 || self.strategy.update_interval_ms == 0 {
            return Err(BotError::InvalidConfig("timer intervals must be non-zero".into()));
        }
        if self.transport.ping_interval_ms == 0 || self.transport.connect_timeout_ms == 0 {
            return Err(BotError::InvalidConfig(
                "transport ping and connect timers must be non-zero".into(),
            ));
        }
        if !self.credentials.is_complete() {
            return Err(BotError::InvalidConfig(
                "BITGET_API_KEY, BITGET_SECRET_KEY and BITGET_PASSPHRASE must be set".into(),
            ));
        }
        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_millis(self.batch.batch_interval_ms)
    }
}
