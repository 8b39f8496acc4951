//! Trades and their legs.
//!
//! Premiums are signed per-unit cash flows:
//! - entry: sells receive (+), buys pay (-)
//! - exit: buys-to-open are sold (+), sells-to-open are bought back (-)
//!
//! Trade P&L is `(entry_premium + exit_premium) * lot_size`, which equals the
//! sum of leg P&L times the lot size.

use chrono::NaiveDate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::data::{Greeks, OptionType};
use crate::strategy::{Action, ConcreteLeg};

/// Reason for closing a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    /// Nearest leg expiry reached.
    Expiry,
    StopLoss,
    Target,
    MaxDays,
    /// Market data ran out before any other exit.
    EndOfPeriod,
}

/// Status of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// One leg of a trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeLeg {
    pub leg_order: u32,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub option_type: OptionType,
    pub action: Action,
    pub quantity: u32,
    pub entry_price: Decimal,
    /// Last mark while open; settlement price once closed.
    pub exit_price: Decimal,
    pub entry_volatility: f64,
    pub exit_volatility: f64,
    pub entry_greeks: Greeks,
    /// Per-unit P&L, quantity weighted.
    pub pnl: Decimal,
}

impl TradeLeg {
    pub fn from_concrete(leg: &ConcreteLeg) -> Self {
        Self {
            leg_order: leg.leg_order,
            strike: leg.strike,
            expiry: leg.expiry,
            option_type: leg.option_type,
            action: leg.action,
            quantity: leg.quantity,
            entry_price: leg.price,
            exit_price: leg.price,
            entry_volatility: leg.volatility,
            exit_volatility: leg.volatility,
            entry_greeks: leg.greeks,
            pnl: Decimal::ZERO,
        }
    }

    /// Signed cash flow at entry.
    pub fn entry_cash(&self) -> Decimal {
        self.action.open_sign() * self.entry_price * Decimal::from(self.quantity)
    }

    /// Signed cash flow to close at the current mark.
    pub fn exit_cash(&self) -> Decimal {
        self.action.close_sign() * self.exit_price * Decimal::from(self.quantity)
    }

    /// Record a new mark and refresh P&L.
    pub fn update_mark(&mut self, price: Decimal, volatility: f64) {
        self.exit_price = price;
        self.exit_volatility = volatility;
        self.pnl = self.action.direction() * (self.exit_price - self.entry_price)
            * Decimal::from(self.quantity);
    }
}

/// A multi-leg trade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    /// 1-based, sequential within a backtest.
    pub trade_number: u32,
    pub entry_date: NaiveDate,
    pub exit_date: Option<NaiveDate>,
    /// Nearest leg expiry.
    pub expiry_date: NaiveDate,
    pub entry_spot: Decimal,
    /// Spot at the last mark.
    pub exit_spot: Decimal,
    pub entry_premium: Decimal,
    /// Cash flow to close at the last mark.
    pub exit_premium: Decimal,
    pub pnl: Decimal,
    /// P&L relative to the entry premium.
    pub pnl_pct: f64,
    /// P&L relative to initial capital.
    pub return_on_capital_pct: f64,
    pub status: TradeStatus,
    pub exit_reason: Option<ExitReason>,
    pub holding_days: i64,
    /// Date of the last mark.
    pub marked_at: NaiveDate,
    pub legs: Vec<TradeLeg>,
}

impl Trade {
    /// Open a trade from freshly instantiated legs.
    pub fn open(
        trade_number: u32,
        date: NaiveDate,
        spot: Decimal,
        legs: &[ConcreteLeg],
        lot_size: u32,
        capital: Decimal,
    ) -> Self {
        let mut legs: Vec<TradeLeg> = legs.iter().map(TradeLeg::from_concrete).collect();
        legs.sort_by_key(|l| l.leg_order);

        let expiry_date = legs.iter().map(|l| l.expiry).min().unwrap_or(date);
        let entry_premium: Decimal = legs.iter().map(|l| l.entry_cash()).sum();

        let mut trade = Self {
            trade_number,
            entry_date: date,
            exit_date: None,
            expiry_date,
            entry_spot: spot,
            exit_spot: spot,
            entry_premium,
            exit_premium: Decimal::ZERO,
            pnl: Decimal::ZERO,
            pnl_pct: 0.0,
            return_on_capital_pct: 0.0,
            status: TradeStatus::Open,
            exit_reason: None,
            holding_days: 0,
            marked_at: date,
            legs,
        };
        trade.revalue(date, spot, lot_size, capital);
        trade
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn is_winner(&self) -> bool {
        self.pnl > Decimal::ZERO
    }

    pub fn is_loser(&self) -> bool {
        self.pnl < Decimal::ZERO
    }

    /// Recompute premium and P&L from the current leg marks.
    pub fn revalue(&mut self, date: NaiveDate, spot: Decimal, lot_size: u32, capital: Decimal) {
        let lot = Decimal::from(lot_size);

        self.marked_at = date;
        self.exit_spot = spot;
        self.holding_days = (date - self.entry_date).num_days();
        self.exit_premium = self.legs.iter().map(|l| l.exit_cash()).sum();
        self.pnl = (self.entry_premium + self.exit_premium) * lot;

        let basis = self.entry_premium.abs() * lot;
        self.pnl_pct = percent_of(self.pnl, basis);
        self.return_on_capital_pct = percent_of(self.pnl, capital);
    }

    /// Close at the last mark.
    pub fn close(&mut self, reason: ExitReason) {
        self.status = TradeStatus::Closed;
        self.exit_date = Some(self.marked_at);
        self.exit_reason = Some(reason);
    }

    /// Sum of leg P&L (per unit).
    pub fn legs_pnl(&self) -> Decimal {
        self.legs.iter().map(|l| l.pnl).sum()
    }
}

fn percent_of(value: Decimal, basis: Decimal) -> f64 {
    if basis.is_zero() {
        return 0.0;
    }
    (value / basis * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
}
