//! Core market data types.
//!
//! The engine consumes a daily underlying series (one bar per trading day)
//! and, optionally, option chain quotes keyed by contract.

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Option type (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionType {
    Call,
    Put,
}

impl OptionType {
    /// Parse exchange or long-form notation (`CE`/`PE`, `C`/`P`, `call`/`put`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "C" | "CE" | "CALL" => Some(Self::Call),
            "P" | "PE" | "PUT" => Some(Self::Put),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Call => "CE",
            Self::Put => "PE",
        }
    }
}

/// Greeks for an option contract.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeks {
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub rho: f64,
}

/// Daily bar for the underlying.
///
/// `close` is the spot used for strike selection and marking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpotBar {
    pub date: NaiveDate,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    #[serde(default)]
    pub volume: i64,
    /// Annualised historical volatility (0.15 = 15%)
    #[serde(default)]
    pub historical_volatility: Option<f64>,
}

impl SpotBar {
    /// Bar with open/high/low/close all at `close`.
    pub fn flat(date: NaiveDate, close: Decimal, historical_volatility: Option<f64>) -> Self {
        Self {
            date,
            open: close,
            high: close,
            low: close,
            close,
            volume: 0,
            historical_volatility,
        }
    }
}

/// Observed price for one option contract on one trading day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainQuote {
    pub trade_date: NaiveDate,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub option_type: OptionType,
    /// Settlement or last traded price
    pub price: Decimal,
    /// Implied volatility published with the quote, if any
    #[serde(default)]
    pub implied_vol: Option<f64>,
}
