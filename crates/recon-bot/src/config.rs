//! Application configuration.

use crate::error::{AppError, AppResult};
use recon_broker::RestBrokerConfig;
use recon_core::{AssetClass, Backoff};
use recon_position::EngineConfig;
use recon_ws::ConnectionConfig;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "RECON_CONFIG";
/// Default config file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";
/// Overrides `broker.key_id` and both feeds' key.
pub const KEY_ID_ENV: &str = "RECON_KEY_ID";
/// Overrides `broker.secret_key` and both feeds' secret.
pub const SECRET_KEY_ENV: &str = "RECON_SECRET_KEY";

/// Broker REST settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub rest_url: String,
    pub key_id: String,
    pub secret_key: String,
    /// Notional value of each opening order.
    pub order_notional: Decimal,
    /// Query retries after the first attempt.
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://paper-api.alpaca.markets".to_string(),
            key_id: String::new(),
            secret_key: String::new(),
            order_notional: Decimal::from(1000),
            max_retries: 3,
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 5000,
        }
    }
}

impl BrokerConfig {
    pub fn rest(&self) -> RestBrokerConfig {
        RestBrokerConfig {
            base_url: self.rest_url.clone(),
            key_id: self.key_id.clone(),
            secret_key: self.secret_key.clone(),
            order_notional: self.order_notional,
            max_retries: self.max_retries,
            retry_backoff: Backoff::new(self.retry_base_delay_ms, self.retry_max_delay_ms),
        }
    }
}

/// One streaming feed: URL plus connection lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub url: String,
    /// Maximum consecutive reconnection attempts (0 = unlimited).
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    /// Market feed only: also subscribe to trades.
    pub trades: bool,
}

impl FeedConfig {
    fn with_url(url: &str) -> Self {
        let defaults = ConnectionConfig::default();
        Self {
            url: url.to_string(),
            max_reconnect_attempts: defaults.max_reconnect_attempts,
            reconnect_base_delay_ms: defaults.reconnect_base_delay_ms,
            reconnect_max_delay_ms: defaults.reconnect_max_delay_ms,
            heartbeat_interval_ms: defaults.heartbeat_interval_ms,
            heartbeat_timeout_ms: defaults.heartbeat_timeout_ms,
            handshake_timeout_ms: defaults.handshake_timeout_ms,
            trades: true,
        }
    }

    fn default_market() -> Self {
        Self::with_url("wss://stream.data.alpaca.markets/v2/iex")
    }

    fn default_account() -> Self {
        Self::with_url("wss://paper-api.alpaca.markets/stream")
    }
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self::with_url("")
    }
}

impl From<&FeedConfig> for ConnectionConfig {
    fn from(cfg: &FeedConfig) -> Self {
        Self {
            url: cfg.url.clone(),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            heartbeat_timeout_ms: cfg.heartbeat_timeout_ms,
            handshake_timeout_ms: cfg.handshake_timeout_ms,
        }
    }
}

fn default_market_feed() -> FeedConfig {
    FeedConfig::default_market()
}

fn default_account_feed() -> FeedConfig {
    FeedConfig::default_account()
}

/// One traded symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetConfig {
    pub symbol: String,
    pub asset_class: AssetClass,
}

/// Engine limits plus the market worker count.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    pub window_size: usize,
    pub max_price_age_ms: u64,
    pub max_decision_age_ms: u64,
    /// Market worker shards. 0 means one per asset.
    pub market_workers: usize,
}

impl Default for EngineSection {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            window_size: engine.window_size,
            max_price_age_ms: engine.max_price_age_ms,
            max_decision_age_ms: engine.max_decision_age_ms,
            market_workers: 4,
        }
    }
}

impl EngineSection {
    pub fn engine(&self) -> EngineConfig {
        EngineConfig {
            window_size: self.window_size,
            max_price_age_ms: self.max_price_age_ms,
            max_decision_age_ms: self.max_decision_age_ms,
        }
    }
}

/// Persistence configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory for the daily trade logs.
    pub data_dir: String,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "./data/trades".to_string(),
            retry_base_delay_ms: 500,
            retry_max_delay_ms: 30_000,
        }
    }
}

/// Liquidation attempts made on the way down after a fatal error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LiquidationConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay_ms: 2000,
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset.
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default = "default_market_feed")]
    pub market_feed: FeedConfig,
    #[serde(default = "default_account_feed")]
    pub account_feed: FeedConfig,
    #[serde(default)]
    pub assets: Vec<AssetConfig>,
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            market_feed: FeedConfig::default_market(),
            account_feed: FeedConfig::default_account(),
            assets: Vec::new(),
            engine: EngineSection::default(),
            persistence: PersistenceConfig::default(),
            liquidation: LiquidationConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl AppConfig {
    /// Resolve the config path: CLI argument > `RECON_CONFIG` > default.
    pub fn resolve_path(cli: Option<String>) -> String {
        cli.or_else(|| std::env::var(CONFIG_ENV).ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
    }

    /// Load from `path`, apply credential overrides from the environment and
    /// validate.
    pub fn load(path: &str) -> AppResult<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!(path, "Config file not found, using defaults");
            Self::default()
        };
        config.apply_env_overrides(
            std::env::var(KEY_ID_ENV).ok(),
            std::env::var(SECRET_KEY_ENV).ok(),
        );
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        toml::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn apply_env_overrides(&mut self, key_id: Option<String>, secret_key: Option<String>) {
        if let Some(key_id) = key_id.filter(|k| !k.is_empty()) {
            self.broker.key_id = key_id;
        }
        if let Some(secret_key) = secret_key.filter(|s| !s.is_empty()) {
            self.broker.secret_key = secret_key;
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.assets.is_empty() {
            return Err(AppError::Config("no assets configured".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for asset in &self.assets {
            if !seen.insert(asset.symbol.as_str()) {
                return Err(AppError::Config(format!(
                    "asset {} configured twice",
                    asset.symbol
                )));
            }
        }
        if self.engine.window_size == 0 {
            return Err(AppError::Config("engine.window_size must be > 0".to_string()));
        }
        if self.market_feed.url.is_empty() || self.account_feed.url.is_empty() {
            return Err(AppError::Config("feed url missing".to_string()));
        }
        if self.broker.order_notional <= Decimal::ZERO {
            return Err(AppError::Config(
                "broker.order_notional must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn symbols(&self) -> Vec<String> {
        self.assets.iter().map(|a| a.symbol.clone()).collect()
    }

    /// Worker shard count, never more than one per asset.
    pub fn market_workers(&self) -> usize {
        let assets = self.assets.len().max(1);
        match self.engine.market_workers {
            0 => assets,
            n => n.min(assets),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SAMPLE: &str = r#"
        [broker]
        key_id = "file-key"
        secret_key = "file-secret"
        order_notional = "250"

        [market_feed]
        url = "ws://127.0.0.1:9001"
        max_reconnect_attempts = 3

        [[assets]]
        symbol = "AAPL"
        asset_class = "us_equity"

        [[assets]]
        symbol = "BTC/USD"
        asset_class = "crypto"

        [engine]
        window_size = 120
    "#;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert!(config.assets.is_empty());
        assert!(config.validate().is_err());
        assert_eq!(config.liquidation.max_attempts, 5);
        assert!(config.account_feed.url.ends_with("/stream"));
    }

    #[test]
    fn test_parse_sample() {
        let config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.broker.order_notional, dec!(250));
        assert_eq!(config.market_feed.max_reconnect_attempts, 3);
        assert_eq!(config.market_feed.heartbeat_interval_ms, 30000);
        // Missing section keeps its own default URL.
        assert_eq!(config.account_feed.url, "wss://paper-api.alpaca.markets/stream");
        assert_eq!(config.assets[1].asset_class, AssetClass::Crypto);
        assert_eq!(config.engine.window_size, 120);
        assert_eq!(config.engine.max_price_age_ms, 90_000);
        assert_eq!(config.engine.engine().window_size, 120);
        assert_eq!(config.market_workers(), 2);

        let conn = ConnectionConfig::from(&config.market_feed);
        assert_eq!(conn.url, "ws://127.0.0.1:9001");
        assert_eq!(conn.max_reconnect_attempts, 3);
    }

    #[test]
    fn test_env_overrides_credentials() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.apply_env_overrides(Some("env-key".into()), None);
        assert_eq!(config.broker.key_id, "env-key");
        assert_eq!(config.broker.secret_key, "file-secret");
        config.apply_env_overrides(Some(String::new()), Some("env-secret".into()));
        assert_eq!(config.broker.key_id, "env-key");
        assert_eq!(config.broker.secret_key, "env-secret");
    }

    #[test]
    fn test_duplicate_asset_rejected() {
        let mut config: AppConfig = toml::from_str(SAMPLE).unwrap();
        config.assets.push(config.assets[0].clone());
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_resolve_path_prefers_cli() {
        assert_eq!(
            AppConfig::resolve_path(Some("custom.toml".into())),
            "custom.toml"
        );
    }
}
