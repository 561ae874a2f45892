//! Layered configuration: built-in defaults, optional TOML file, then
//! `TRADEGUARD__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::GuardError;
use crate::models::Timeframe;

pub const DEFAULT_CONFIG_PATH: &str = "tradeguard.toml";
const ENV_PREFIX: &str = "TRADEGUARD";
/// Settings that accept a comma-separated list from the environment
const ENV_LIST_KEYS: [&str; 2] = ["cache.symbols", "cache.timeframes"];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub broker: BrokerConfig,
    pub exchange: ExchangeConfig,
    pub redis: RedisConfig,
    pub cache: CacheConfig,
    pub feed: FeedConfig,
    pub volatility: VolatilityConfig,
    pub exit: ExitConfig,
    pub oco: OcoConfig,
    pub notify: NotifyConfig,
}

impl Settings {
    /// Load settings; a missing file is not an error
    pub fn load(path: Option<&str>) -> Result<Self, GuardError> {
        Self::load_with_env(path, environment())
    }

    fn load_with_env(path: Option<&str>, env: config::Environment) -> Result<Self, GuardError> {
        let path = path.unwrap_or(DEFAULT_CONFIG_PATH);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(env)
            .build()?
            .try_deserialize()?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        self.exit.default_profile.validate()?;
        for (tag, profile) in &self.exit.strategy_profiles {
            profile
                .validate()
                .map_err(|e| GuardError::Config(format!("profile {}: {}", tag, e)))?;
        }
        if !(0.0..=1.0).contains(&self.feed.ewma_alpha) || self.feed.ewma_alpha == 0.0 {
            return Err(GuardError::Config(format!(
                "feed.ewma_alpha must be in (0, 1], got {}",
                self.feed.ewma_alpha
            )));
        }
        if self.feed.max_consecutive_outliers == 0 {
            return Err(GuardError::Config(
                "feed.max_consecutive_outliers must be > 0".into(),
            ));
        }
        if self.volatility.atr_period == 0 {
            return Err(GuardError::Config("volatility.atr_period must be > 0".into()));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    ENV_LIST_KEYS.iter().fold(
        config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(","),
        |env, key| env.with_list_parse_key(key),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_ms: u64,
    pub rate_limit_per_sec: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Cadence of the broker quote pump feeding the synchronizer
    pub quote_poll_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8710".to_string(),
            api_key: None,
            request_timeout_ms: 5_000,
            rate_limit_per_sec: 20,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            quote_poll_ms: 1_000,
        }
    }
}

impl BrokerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Ticker endpoint; `{symbol}` is replaced by the mapped exchange symbol.
    /// No URL disables the exchange feed.
    pub ticker_url: Option<String>,
    /// Broker symbol -> exchange symbol
    pub symbol_map: HashMap<String, String>,
    pub poll_interval_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            ticker_url: None,
            symbol_map: HashMap::new(),
            poll_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub symbols: Vec<String>,
    pub timeframes: Vec<Timeframe>,
    /// Per-timeframe capacity overrides keyed by timeframe name ("M1", "H4"...)
    pub capacities: HashMap<String, usize>,
    /// Delay after a bar boundary before polling, so the bar has closed upstream
    pub settle_delay_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            symbols: Vec::new(),
            timeframes: vec![Timeframe::M1, Timeframe::M15, Timeframe::H1, Timeframe::H4],
            capacities: HashMap::new(),
            settle_delay_secs: 2,
        }
    }
}

impl CacheConfig {
    pub fn capacity_for(&self, timeframe: Timeframe) -> usize {
        self.capacities
            .get(timeframe.as_str())
            .copied()
            .unwrap_or_else(|| timeframe.default_capacity())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Max distance between a broker and an exchange tick to form a pair
    pub pair_window_ms: i64,
    /// A feed with no tick newer than this is stale
    pub stale_after_ms: i64,
    pub ewma_alpha: f64,
    /// Reject a pair whose offset is more than k standard deviations away
    pub outlier_k: f64,
    pub outlier_window: usize,
    /// Samples required before the offset counts as calibrated
    pub min_samples: u32,
    /// Lower bound on the stddev used for outlier checks, as a fraction of price
    pub outlier_floor_fraction: f64,
    /// Consecutive rejected pairs that mean the offset itself moved; the
    /// estimate is then discarded and re-seeded from the next pair
    pub max_consecutive_outliers: u32,
    pub confidence_half_life_secs: f64,
    pub healthy_confidence: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            pair_window_ms: 2_000,
            stale_after_ms: 10_000,
            ewma_alpha: 0.2,
            outlier_k: 4.0,
            outlier_window: 50,
            min_samples: 5,
            outlier_floor_fraction: 0.00005,
            max_consecutive_outliers: 8,
            confidence_half_life_secs: 30.0,
            healthy_confidence: 0.6,
        }
    }
}

/// One timeframe's contribution to the blended stop distance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeframeWeight {
    pub timeframe: Timeframe,
    pub weight: f64,
    /// ATR multiple for this timeframe
    pub multiplier: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityConfig {
    pub atr_period: usize,
    pub timeframes: Vec<TimeframeWeight>,
    pub scalar_min: f64,
    pub scalar_max: f64,
}

impl Default for VolatilityConfig {
    fn default() -> Self {
        Self {
            atr_period: 14,
            timeframes: vec![
                TimeframeWeight {
                    timeframe: Timeframe::M1,
                    weight: 0.5,
                    multiplier: 3.0,
                },
                TimeframeWeight {
                    timeframe: Timeframe::M15,
                    weight: 0.3,
                    multiplier: 1.5,
                },
                TimeframeWeight {
                    timeframe: Timeframe::H1,
                    weight: 0.2,
                    multiplier: 1.0,
                },
            ],
            scalar_min: 0.5,
            scalar_max: 3.0,
        }
    }
}

impl VolatilityConfig {
    pub fn timeframe_set(&self) -> Vec<Timeframe> {
        self.timeframes.iter().map(|w| w.timeframe).collect()
    }
}

/// Thresholds driving one controller's stage machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExitProfile {
    /// Fraction of planned distance that triggers breakeven
    pub breakeven_trigger: f64,
    /// Fraction of planned distance that triggers partial close / trailing
    pub partial_trigger: f64,
    /// Share of volume closed at the partial trigger
    pub partial_close_fraction: f64,
    /// Breakeven buffer beyond spread, as a fraction of entry price
    pub breakeven_buffer_fraction: f64,
    /// Reward multiple of initial risk when the position has no take profit
    pub fallback_reward_ratio: f64,
}

impl Default for ExitProfile {
    fn default() -> Self {
        Self {
            breakeven_trigger: 0.3,
            partial_trigger: 0.6,
            partial_close_fraction: 0.5,
            breakeven_buffer_fraction: 0.0005,
            fallback_reward_ratio: 2.0,
        }
    }
}

impl ExitProfile {
    pub fn validate(&self) -> Result<(), GuardError> {
        if !(self.breakeven_trigger > 0.0 && self.breakeven_trigger < self.partial_trigger) {
            return Err(GuardError::Config(format!(
                "breakeven_trigger ({}) must be positive and below partial_trigger ({})",
                self.breakeven_trigger, self.partial_trigger
            )));
        }
        if !(self.partial_close_fraction > 0.0 && self.partial_close_fraction < 1.0) {
            return Err(GuardError::Config(format!(
                "partial_close_fraction must be in (0, 1), got {}",
                self.partial_close_fraction
            )));
        }
        if self.breakeven_buffer_fraction < 0.0 {
            return Err(GuardError::Config(
                "breakeven_buffer_fraction must not be negative".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub default_profile: ExitProfile,
    /// Profiles run by the strategy-specific controller, keyed by strategy tag
    pub strategy_profiles: HashMap<String, ExitProfile>,
    /// Consecutive broker failures on one ticket before alerting
    pub failure_alert_threshold: u32,
    pub urgent_interval_secs: u64,
    pub relaxed_interval_secs: u64,
    /// Per-symbol minimum remaining volume after a partial close;
    /// the broker's min volume applies when absent
    pub dust_thresholds: HashMap<String, f64>,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            default_profile: ExitProfile::default(),
            strategy_profiles: HashMap::new(),
            failure_alert_threshold: 3,
            urgent_interval_secs: 15,
            relaxed_interval_secs: 60,
            dust_thresholds: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcoConfig {
    pub poll_interval_secs: u64,
}

impl Default for OcoConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    /// Identical notifications within this window are dropped
    pub throttle_secs: u64,
    pub queue_size: usize,
    pub delivery_timeout_ms: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            throttle_secs: 300,
            queue_size: 256,
            delivery_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.exit.failure_alert_threshold, 3);
        assert_eq!(settings.oco.poll_interval_secs, 3);
        assert_eq!(settings.cache.capacity_for(Timeframe::M1), 1440);
        assert_eq!(settings.cache.capacity_for(Timeframe::H4), 50);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let settings = Settings::load(Some("/nonexistent/tradeguard-test")).unwrap();
        assert_eq!(settings.feed.pair_window_ms, 2_000);
        assert_eq!(settings.exit.default_profile, ExitProfile::default());
    }

    #[test]
    fn test_load_from_toml() {
        let path = std::env::temp_dir().join(format!("tradeguard-{}.toml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[cache]
symbols = ["XAUUSD"]
timeframes = ["M1", "H4"]

[cache.capacities]
M1 = 720

[exit.default_profile]
breakeven_trigger = 0.25

[exit.strategy_profiles.scalper]
breakeven_trigger = 0.2
partial_trigger = 0.5

[exit.dust_thresholds]
XAUUSD = 0.02
"#
        )
        .unwrap();

        let settings = Settings::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.cache.symbols, vec!["XAUUSD".to_string()]);
        assert_eq!(settings.cache.capacity_for(Timeframe::M1), 720);
        assert_eq!(settings.cache.capacity_for(Timeframe::H4), 50);
        assert_eq!(settings.exit.default_profile.breakeven_trigger, 0.25);
        assert_eq!(settings.exit.default_profile.partial_trigger, 0.6);
        assert_eq!(settings.exit.strategy_profiles["scalper"].partial_trigger, 0.5);
        assert_eq!(settings.exit.dust_thresholds["XAUUSD"], 0.02);
    }

    #[test]
    fn test_env_lists_are_split() {
        let mut vars = config::Map::new();
        vars.insert("TRADEGUARD__CACHE__SYMBOLS".to_string(), "XAUUSD,EURUSD".to_string());
        vars.insert("TRADEGUARD__CACHE__TIMEFRAMES".to_string(), "M1,H1".to_string());
        vars.insert("TRADEGUARD__FEED__MIN_SAMPLES".to_string(), "7".to_string());

        let settings = Settings::load_with_env(
            Some("/nonexistent/tradeguard-test"),
            environment().source(Some(vars)),
        )
        .unwrap();

        assert_eq!(settings.cache.symbols, vec!["XAUUSD".to_string(), "EURUSD".to_string()]);
        assert_eq!(settings.cache.timeframes, vec![Timeframe::M1, Timeframe::H1]);
        assert_eq!(settings.feed.min_samples, 7);
    }

    #[test]
    fn test_rejects_inverted_triggers() {
        let profile = ExitProfile {
            breakeven_trigger: 0.7,
            partial_trigger: 0.6,
            ..Default::default()
        };
        assert!(profile.validate().is_err());
    }
}
