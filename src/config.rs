//! TOML configuration with `${ENV_VAR}` substitution.
//!
//! The file is read as text, environment references are expanded, and the
//! result is deserialized with serde. Unknown variables are left verbatim
//! so that validation fails loudly on the consuming side (e.g. an API key
//! that still reads `${BFX_API_KEY}` will fail the startup preflight).

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(String),
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub bitfinex: BitfinexConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub thresholds: ThresholdsConfig,
    /// Manually pinned risk weights by symbol; absent symbols are computed
    /// from volatility.
    #[serde(default)]
    pub risk_weights: HashMap<String, f64>,
    /// Liquidation priority by symbol (lower closes first). The "default"
    /// entry covers unlisted symbols.
    #[serde(default)]
    pub position_priority: HashMap<String, i64>,
    #[serde(default)]
    pub liquidation: LiquidationConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BitfinexConfig {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TelegramConfig {
    #[serde(default)]
    pub bot_token: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_poll_interval_sec")]
    pub poll_interval_sec: u64,
    #[serde(default = "default_volatility_update_hours")]
    pub volatility_update_hours: u64,
    /// Refresh window while a recent price spike is in effect.
    #[serde(default = "default_spike_refresh_minutes")]
    pub spike_refresh_minutes: u64,
    #[serde(default = "default_volatility_lookback_days")]
    pub volatility_lookback_days: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_sec: default_poll_interval_sec(),
            volatility_update_hours: default_volatility_update_hours(),
            spike_refresh_minutes: default_spike_refresh_minutes(),
            volatility_lookback_days: default_volatility_lookback_days(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ThresholdsConfig {
    /// Adjustments smaller than this are dropped outright (USDt).
    #[serde(default = "default_min_adjustment_usdt")]
    pub min_adjustment_usdt: f64,
    /// Adjustments below this share of current margin are dropped (percent).
    #[serde(default = "default_min_deviation_pct")]
    pub min_deviation_pct: f64,
    /// Per-position margin rate below which the emergency path fires (percent).
    #[serde(default = "default_emergency_margin_rate")]
    pub emergency_margin_rate: f64,
    /// Price change between consecutive observations counted as a spike (percent).
    #[serde(default = "default_price_spike_pct")]
    pub price_spike_pct: f64,
    /// Account-wide equity/margin ratio warning level (percent).
    #[serde(default = "default_account_margin_rate_warning")]
    pub account_margin_rate_warning: f64,
}

impl Default for ThresholdsConfig {
    fn default() -> Self {
        Self {
            min_adjustment_usdt: default_min_adjustment_usdt(),
            min_deviation_pct: default_min_deviation_pct(),
            emergency_margin_rate: default_emergency_margin_rate(),
            price_spike_pct: default_price_spike_pct(),
            account_margin_rate_warning: default_account_margin_rate_warning(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LiquidationConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub dry_run: bool,
    /// Largest share of a single position closed in one pass (percent).
    #[serde(default = "default_max_single_close_pct")]
    pub max_single_close_pct: f64,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
    /// Multiplier over the maintenance margin that defines "safe".
    #[serde(default = "default_safety_margin_multiplier")]
    pub safety_margin_multiplier: f64,
    /// Exchange maintenance margin rate, carried as config because the
    /// documented value can vary by instrument.
    #[serde(default = "default_maintenance_margin_rate")]
    pub maintenance_margin_rate: f64,
}

impl Default for LiquidationConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            dry_run: default_true(),
            max_single_close_pct: default_max_single_close_pct(),
            cooldown_seconds: default_cooldown_seconds(),
            safety_margin_multiplier: default_safety_margin_multiplier(),
            maintenance_margin_rate: default_maintenance_margin_rate(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.bitfinex.com".to_string()
}

fn default_ws_url() -> String {
    "wss://api-pub.bitfinex.com/ws/2".to_string()
}

fn default_poll_interval_sec() -> u64 {
    60
}

fn default_volatility_update_hours() -> u64 {
    1
}

fn default_spike_refresh_minutes() -> u64 {
    10
}

fn default_volatility_lookback_days() -> u32 {
    7
}

fn default_min_adjustment_usdt() -> f64 {
    50.0
}

fn default_min_deviation_pct() -> f64 {
    5.0
}

fn default_emergency_margin_rate() -> f64 {
    2.0
}

fn default_price_spike_pct() -> f64 {
    3.0
}

fn default_account_margin_rate_warning() -> f64 {
    3.0
}

fn default_true() -> bool {
    true
}

fn default_max_single_close_pct() -> f64 {
    25.0
}

fn default_cooldown_seconds() -> u64 {
    30
}

fn default_safety_margin_multiplier() -> f64 {
    3.0
}

fn default_maintenance_margin_rate() -> f64 {
    0.005
}

fn default_database_path() -> String {
    "data/margind.db".to_string()
}

impl Config {
    /// Load a config file, expand `${ENV_VAR}` references, and validate.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)?;
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::from_toml_str(&raw, &env)
    }

    /// Parse from raw TOML text with the given environment map.
    pub fn from_toml_str(
        raw: &str,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let expanded = substitute_env_vars(raw, env);
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.monitor.poll_interval_sec == 0 {
            return Err(ConfigError::InvalidValue(
                "monitor.poll_interval_sec",
                "must be positive".to_string(),
            ));
        }
        if self.monitor.volatility_lookback_days < 2 {
            return Err(ConfigError::InvalidValue(
                "monitor.volatility_lookback_days",
                "needs at least 2 days to compute returns".to_string(),
            ));
        }
        if !(0.0..=100.0).contains(&self.liquidation.max_single_close_pct) {
            return Err(ConfigError::InvalidValue(
                "liquidation.max_single_close_pct",
                "must be within 0..=100".to_string(),
            ));
        }
        if self.liquidation.maintenance_margin_rate <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "liquidation.maintenance_margin_rate",
                "must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Pinned risk weight for a symbol, if configured.
    pub fn risk_weight(&self, symbol: &str) -> Option<f64> {
        self.risk_weights.get(symbol).copied()
    }

    /// Liquidation priority for a symbol; the "default" entry (or 50)
    /// covers unlisted symbols.
    pub fn position_priority(&self, symbol: &str) -> i64 {
        self.position_priority
            .get(symbol)
            .or_else(|| self.position_priority.get("default"))
            .copied()
            .unwrap_or(50)
    }
}

/// Replace every `${NAME}` with the value of `NAME` from `env`.
///
/// Unknown names are kept as-is.
fn substitute_env_vars(raw: &str, env: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match env.get(name) {
                    Some(value) => out.push_str(value),
                    None => out.push_str(&rest[start..start + 3 + end]),
                }
                rest = &rest[start + 3 + end..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}
