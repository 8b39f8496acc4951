//! Backtest run configuration.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::engine::BacktestError;

/// Which trading dates open a new trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryCadence {
    /// Only the start date.
    #[default]
    OnDate,
    /// Every trading date.
    Daily,
    /// First trading date of each ISO week.
    Weekly,
    /// First trading date of each calendar month.
    Monthly,
}

/// The exit rule a run is configured around.
///
/// Every threshold that is set is active; this names the one that must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitRule {
    #[default]
    OnExpiry,
    StopLoss,
    Target,
    MaxDays,
}

/// Configuration for one backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestConfig {
    /// Stored strategy this run trades.
    #[serde(default)]
    pub strategy_id: u64,

    #[serde(default)]
    pub name: String,

    /// Underlying symbol.
    #[serde(default = "default_underlying")]
    pub underlying: String,

    pub start_date: NaiveDate,

    pub end_date: NaiveDate,

    /// Capital base for return percentages.
    pub initial_capital: Decimal,

    #[serde(default)]
    pub entry: EntryCadence,

    #[serde(default)]
    pub exit_rule: ExitRule,

    /// Exit when unrealized loss reaches this percent of entry premium.
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,

    /// Exit when unrealized gain reaches this percent of entry premium.
    #[serde(default)]
    pub target_pct: Option<f64>,

    /// Exit after this many calendar days.
    #[serde(default)]
    pub max_holding_days: Option<u32>,
}

fn default_underlying() -> String {
    "NIFTY".to_string()
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            strategy_id: 0,
            name: String::new(),
            underlying: default_underlying(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default(),
            initial_capital: Decimal::from(100_000),
            entry: EntryCadence::OnDate,
            exit_rule: ExitRule::OnExpiry,
            stop_loss_pct: None,
            target_pct: None,
            max_holding_days: None,
        }
    }
}

impl BacktestConfig {
    pub fn validate(&self) -> Result<(), BacktestError> {
        if self.end_date < self.start_date {
            return Err(BacktestError::InvalidConfig(format!(
                "end date {} is before start date {}",
                self.end_date, self.start_date
            )));
        }
        if self.initial_capital <= Decimal::ZERO {
            return Err(BacktestError::InvalidConfig(
                "initial capital must be positive".to_string(),
            ));
        }

        check_pct("stop_loss_pct", self.stop_loss_pct)?;
        check_pct("target_pct", self.target_pct)?;
        if self.max_holding_days == Some(0) {
            return Err(BacktestError::InvalidConfig(
                "max_holding_days must be positive".to_string(),
            ));
        }

        let required = match self.exit_rule {
            ExitRule::OnExpiry => None,
            ExitRule::StopLoss => self.stop_loss_pct.is_none().then_some("stop_loss_pct"),
            ExitRule::Target => self.target_pct.is_none().then_some("target_pct"),
            ExitRule::MaxDays => self.max_holding_days.is_none().then_some("max_holding_days"),
        };
        if let Some(field) = required {
            return Err(BacktestError::InvalidConfig(format!(
                "exit rule {:?} requires {}",
                self.exit_rule, field
            )));
        }

        Ok(())
    }
}

fn check_pct(field: &str, value: Option<f64>) -> Result<(), BacktestError> {
    match value {
        Some(v) if !(v.is_finite() && v > 0.0) => Err(BacktestError::InvalidConfig(format!(
            "{} must be positive, got {}",
            field, v
        ))),
        _ => Ok(()),
    }
}
