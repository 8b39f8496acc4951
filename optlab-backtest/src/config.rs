//! Engine settings and the run configuration file.
//!
//! A run file is TOML with three tables:
//! - `[settings]`: market conventions (lot size, strike step, rates, calendar)
//! - `[strategy]`: a preset kind with a width, or explicit legs
//! - `[backtest]`: window, capital, entry cadence and exit rule
//!
//! After the file is read, `OPTLAB_*` environment variables (optionally from
//! a `.env` file) override individual settings.

use std::path::Path;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backtest::BacktestConfig;
use crate::calendar::ExpiryCalendar;
use crate::pricing::BlackScholes;
use crate::strategy::StrategyDefinition;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {key}: {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Market conventions shared by every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Contract multiplier applied to per-unit premiums.
    pub lot_size: u32,

    /// Strike increment; strikes are rounded to a multiple of this.
    pub strike_step: Decimal,

    /// Risk-free rate used for pricing (annual, continuous).
    pub risk_free_rate: f64,

    /// Dividend yield used for pricing.
    pub dividend_yield: f64,

    /// Decimal places for theoretical prices (exchange tick).
    pub price_precision: u32,

    /// Annual risk-free rate subtracted in Sharpe and Sortino.
    pub metrics_risk_free_rate: f64,

    /// Expiry convention and holidays.
    pub calendar: ExpiryCalendar,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            lot_size: 50,
            strike_step: Decimal::from(50),
            risk_free_rate: 0.065,
            dividend_yield: 0.0,
            price_precision: 2,
            metrics_risk_free_rate: 0.0,
            calendar: ExpiryCalendar::default(),
        }
    }
}

impl EngineSettings {
    pub fn pricer(&self) -> BlackScholes {
        BlackScholes::new(self.risk_free_rate, self.dividend_yield)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.lot_size == 0 {
            return Err(ConfigError::Invalid("lot_size must be positive".to_string()));
        }
        if self.strike_step <= Decimal::ZERO {
            return Err(ConfigError::Invalid("strike_step must be positive".to_string()));
        }
        if !self.risk_free_rate.is_finite() || !self.dividend_yield.is_finite() {
            return Err(ConfigError::Invalid("rates must be finite".to_string()));
        }
        if !self.metrics_risk_free_rate.is_finite() {
            return Err(ConfigError::Invalid(
                "metrics_risk_free_rate must be finite".to_string(),
            ));
        }
        if self.price_precision > 8 {
            return Err(ConfigError::Invalid(
                "price_precision must be at most 8".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply `OPTLAB_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        dotenvy::dotenv().ok();
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from any key lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = parse_var(&lookup, "OPTLAB_LOT_SIZE")? {
            self.lot_size = v;
        }
        if let Some(v) = parse_var(&lookup, "OPTLAB_STRIKE_STEP")? {
            self.strike_step = v;
        }
        if let Some(v) = parse_var(&lookup, "OPTLAB_RISK_FREE_RATE")? {
            self.risk_free_rate = v;
        }
        if let Some(v) = parse_var(&lookup, "OPTLAB_DIVIDEND_YIELD")? {
            self.dividend_yield = v;
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                key: key.to_string(),
                value: raw,
            }),
    }
}

/// One backtest run as read from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub settings: EngineSettings,
    pub strategy: StrategyDefinition,
    pub backtest: BacktestConfig,
}

impl AppConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.settings.validate()?;
        Ok(config)
    }

    /// Read a run file and apply environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let mut config: Self = toml::from_str(&content)?;
        config.settings.apply_env()?;
        config.settings.validate()?;
        Ok(config)
    }

    /// Settings shared by a set of run files. Batch runs use one set of
    /// market conventions, so files that disagree are rejected.
    pub fn shared_settings(configs: &[AppConfig]) -> Result<EngineSettings, ConfigError> {
        let Some((first, rest)) = configs.split_first() else {
            return Ok(EngineSettings::default());
        };
        if let Some(other) = rest.iter().find(|c| c.settings != first.settings) {
            return Err(ConfigError::Invalid(format!(
                "settings of {} differ from {}",
                other.backtest.name, first.backtest.name
            )));
        }
        Ok(first.settings.clone())
    }
}
