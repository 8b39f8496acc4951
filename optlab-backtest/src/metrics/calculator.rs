//! Performance metrics calculator.
//!
//! Aggregates closed trades into risk and return statistics. The calculation
//! is a pure function of the trade list: the same trades always give the
//! same metrics.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::backtest::{ExitReason, Trade};
use crate::pricing::DAYS_PER_YEAR;

/// Trade-level performance metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    // Counts
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    /// Trades with exactly zero P&L.
    pub breakeven_trades: usize,
    /// Percent of trades with positive P&L.
    pub win_rate: f64,

    // P&L
    pub total_pnl: Decimal,
    pub avg_pnl_per_trade: Decimal,
    pub max_profit: Decimal,
    pub max_loss: Decimal,
    pub gross_profit: Decimal,
    /// Positive magnitude.
    pub gross_loss: Decimal,
    pub profit_factor: Option<f64>,
    pub avg_winner: Decimal,
    /// Average P&L of losing trades (negative).
    pub avg_loser: Decimal,

    // Capital
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    pub total_return_pct: f64,

    // Risk
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: Option<f64>,
    pub sortino_ratio: Option<f64>,

    pub avg_holding_days: f64,

    // Breakdowns
    pub exit_reasons: Vec<ExitReasonStats>,
    pub monthly_returns: Vec<MonthlyReturn>,
    pub drawdown: DrawdownAnalysis,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            breakeven_trades: 0,
            win_rate: 0.0,
            total_pnl: Decimal::ZERO,
            avg_pnl_per_trade: Decimal::ZERO,
            max_profit: Decimal::ZERO,
            max_loss: Decimal::ZERO,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            profit_factor: None,
            avg_winner: Decimal::ZERO,
            avg_loser: Decimal::ZERO,
            initial_capital: Decimal::ZERO,
            final_capital: Decimal::ZERO,
            total_return_pct: 0.0,
            max_drawdown: Decimal::ZERO,
            max_drawdown_pct: 0.0,
            sharpe_ratio: None,
            sortino_ratio: None,
            avg_holding_days: 0.0,
            exit_reasons: Vec::new(),
            monthly_returns: Vec::new(),
            drawdown: DrawdownAnalysis::default(),
        }
    }
}

impl PerformanceMetrics {
    /// Generate a summary report.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Performance Summary\n\
             ====================\n\
             \n\
             Trades: {} (W: {}, L: {}, B/E: {})\n\
             Win Rate: {:.1}%\n\
             Profit Factor: {}\n\
             \n\
             Total P&L: {:.2}\n\
             Avg Trade: {:.2}\n\
             Avg Winner: {:.2}\n\
             Avg Loser: {:.2}\n\
             Max Profit: {:.2}\n\
             Max Loss: {:.2}\n\
             \n\
             Initial Capital: {:.2}\n\
             Final Capital: {:.2}\n\
             Total Return: {:.2}%\n\
             \n\
             Max Drawdown: {:.2} ({:.2}%)\n\
             Sharpe Ratio: {}\n\
             Sortino Ratio: {}\n\
             \n\
             Avg Holding Days: {:.1}",
            self.total_trades,
            self.winning_trades,
            self.losing_trades,
            self.breakeven_trades,
            self.win_rate,
            fmt_ratio(self.profit_factor),
            self.total_pnl,
            self.avg_pnl_per_trade,
            self.avg_winner,
            self.avg_loser,
            self.max_profit,
            self.max_loss,
            self.initial_capital,
            self.final_capital,
            self.total_return_pct,
            self.max_drawdown,
            self.max_drawdown_pct,
            fmt_ratio(self.sharpe_ratio),
            fmt_ratio(self.sortino_ratio),
            self.avg_holding_days,
        );

        if !self.exit_reasons.is_empty() {
            out.push_str("\n\nExit Reasons:");
            for stats in &self.exit_reasons {
                out.push_str(&format!(
                    "\n  {:?}: {} trades, P&L {:.2}, avg {:.1} days",
                    stats.reason, stats.count, stats.total_pnl, stats.avg_holding_days
                ));
            }
        }

        out
    }
}

fn fmt_ratio(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}", v))
}

/// Drawdown analysis over the trade equity curve.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DrawdownAnalysis {
    pub max_drawdown: Decimal,
    pub max_drawdown_pct: f64,
    /// Date of the peak preceding the largest drawdown (None = initial capital).
    pub peak_date: Option<NaiveDate>,
    pub trough_date: Option<NaiveDate>,
    /// First date equity regained that peak.
    pub recovery_date: Option<NaiveDate>,
    pub drawdown_periods: usize,
}

/// P&L aggregated by exit month.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyReturn {
    pub year: i32,
    pub month: u32,
    pub pnl: Decimal,
    /// Relative to initial capital.
    pub return_pct: f64,
    pub trades: usize,
    pub win_rate: f64,
}

/// Trades grouped by exit reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitReasonStats {
    pub reason: ExitReason,
    pub count: usize,
    pub total_pnl: Decimal,
    pub avg_holding_days: f64,
}

/// Metrics calculator.
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Calculate all metrics from the closed trades of one backtest.
    ///
    /// Open trades are ignored. `risk_free_rate` is annual.
    pub fn calculate(
        trades: &[Trade],
        initial_capital: Decimal,
        risk_free_rate: f64,
    ) -> PerformanceMetrics {
        let trades = Self::ordered_closed(trades);

        let total_trades = trades.len();
        let winning_trades = trades.iter().filter(|t| t.is_winner()).count();
        let losing_trades = trades.iter().filter(|t| t.is_loser()).count();
        let breakeven_trades = total_trades - winning_trades - losing_trades;
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64 * 100.0
        } else {
            0.0
        };

        let total_pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
        let gross_profit: Decimal = trades
            .iter()
            .filter(|t| t.is_winner())
            .map(|t| t.pnl)
            .sum();
        let gross_loss: Decimal = -trades
            .iter()
            .filter(|t| t.is_loser())
            .map(|t| t.pnl)
            .sum::<Decimal>();
        let profit_factor = Self::calculate_profit_factor(gross_profit, gross_loss);

        let avg_pnl_per_trade = average(total_pnl, total_trades);
        let avg_winner = average(gross_profit, winning_trades);
        let avg_loser = -average(gross_loss, losing_trades);

        let max_profit = trades.iter().map(|t| t.pnl).max().unwrap_or(Decimal::ZERO);
        let max_loss = trades.iter().map(|t| t.pnl).min().unwrap_or(Decimal::ZERO);

        let final_capital = initial_capital + total_pnl;
        let total_return_pct = pct(total_pnl, initial_capital);

        let drawdown = Self::analyze_drawdown(&trades, initial_capital);
        let (sharpe_ratio, sortino_ratio) =
            Self::risk_adjusted(&trades, initial_capital, risk_free_rate);

        let avg_holding_days = if total_trades > 0 {
            trades.iter().map(|t| t.holding_days as f64).sum::<f64>() / total_trades as f64
        } else {
            0.0
        };

        PerformanceMetrics {
            total_trades,
            winning_trades,
            losing_trades,
            breakeven_trades,
            win_rate,
            total_pnl,
            avg_pnl_per_trade,
            max_profit,
            max_loss,
            gross_profit,
            gross_loss,
            profit_factor,
            avg_winner,
            avg_loser,
            initial_capital,
            final_capital,
            total_return_pct,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_pct: drawdown.max_drawdown_pct,
            sharpe_ratio,
            sortino_ratio,
            avg_holding_days,
            exit_reasons: Self::exit_reason_breakdown(&trades),
            monthly_returns: Self::monthly_returns(&trades, initial_capital),
            drawdown,
        }
    }

    /// Closed trades by entry date, then trade number.
    fn ordered_closed(trades: &[Trade]) -> Vec<&Trade> {
        let mut closed: Vec<&Trade> = trades.iter().filter(|t| !t.is_open()).collect();
        closed.sort_by_key(|t| (t.entry_date, t.trade_number));
        closed
    }

    /// Profit factor, undefined without losses.
    fn calculate_profit_factor(gross_profit: Decimal, gross_loss: Decimal) -> Option<f64> {
        if gross_loss.is_zero() {
            return None;
        }
        (gross_profit / gross_loss.abs()).to_f64()
    }

    /// Sharpe and Sortino over per-trade returns, annualised by trade frequency.
    fn risk_adjusted(
        trades: &[&Trade],
        initial_capital: Decimal,
        risk_free_rate: f64,
    ) -> (Option<f64>, Option<f64>) {
        let n = trades.len();
        if n < 2 || initial_capital.is_zero() {
            return (None, None);
        }

        let returns: Vec<f64> = trades
            .iter()
            .map(|t| (t.pnl / initial_capital).to_f64().unwrap_or(0.0))
            .collect();

        let first_entry = trades.iter().map(|t| t.entry_date).min();
        let last_exit = trades.iter().map(exit_date).max();
        let span_days = match (first_entry, last_exit) {
            (Some(first), Some(last)) => (last - first).num_days().max(1),
            _ => 1,
        };
        let years = span_days as f64 / DAYS_PER_YEAR;
        let periods_per_year = n as f64 / years;
        let rf_per_trade = risk_free_rate / periods_per_year;

        let mean = statrs::statistics::Statistics::mean(returns.iter());
        let std_dev = statrs::statistics::Statistics::std_dev(returns.iter());
        let excess = mean - rf_per_trade;

        let sharpe = (std_dev.is_finite() && std_dev > 0.0)
            .then(|| excess / std_dev * periods_per_year.sqrt())
            .filter(|v| v.is_finite());

        let downside = (returns
            .iter()
            .map(|r| (r - rf_per_trade).min(0.0).powi(2))
            .sum::<f64>()
            / n as f64)
            .sqrt();
        let sortino = (downside > 0.0)
            .then(|| excess / downside * periods_per_year.sqrt())
            .filter(|v| v.is_finite());

        (sharpe, sortino)
    }

    /// Analyze drawdown of the equity curve built from trade P&L.
    fn analyze_drawdown(trades: &[&Trade], initial_capital: Decimal) -> DrawdownAnalysis {
        let mut analysis = DrawdownAnalysis::default();

        let mut equity = initial_capital;
        let mut peak = initial_capital;
        let mut peak_date: Option<NaiveDate> = None;
        let mut in_drawdown = false;
        let mut awaiting_recovery = false;

        for trade in trades {
            let date = exit_date(trade);
            equity += trade.pnl;

            if equity >= peak {
                if in_drawdown {
                    analysis.drawdown_periods += 1;
                    in_drawdown = false;
                    if awaiting_recovery {
                        analysis.recovery_date = Some(date);
                        awaiting_recovery = false;
                    }
                }
                peak = equity;
                peak_date = Some(date);
            } else {
                in_drawdown = true;
                let drawdown = peak - equity;
                if drawdown > analysis.max_drawdown {
                    analysis.max_drawdown = drawdown;
                    analysis.max_drawdown_pct = pct(drawdown, peak);
                    analysis.peak_date = peak_date;
                    analysis.trough_date = Some(date);
                    analysis.recovery_date = None;
                    awaiting_recovery = true;
                }
            }
        }

        if in_drawdown {
            analysis.drawdown_periods += 1;
        }

        analysis
    }

    /// Calculate monthly returns by exit month.
    pub fn monthly_returns(trades: &[&Trade], initial_capital: Decimal) -> Vec<MonthlyReturn> {
        let mut monthly: BTreeMap<(i32, u32), Vec<&Trade>> = BTreeMap::new();

        for trade in trades {
            let date = exit_date(trade);
            monthly
                .entry((date.year(), date.month()))
                .or_default()
                .push(trade);
        }

        monthly
            .into_iter()
            .map(|((year, month), trades)| {
                let pnl: Decimal = trades.iter().map(|t| t.pnl).sum();
                let winners = trades.iter().filter(|t| t.is_winner()).count();

                MonthlyReturn {
                    year,
                    month,
                    pnl,
                    return_pct: pct(pnl, initial_capital),
                    trades: trades.len(),
                    win_rate: winners as f64 / trades.len() as f64 * 100.0,
                }
            })
            .collect()
    }

    fn exit_reason_breakdown(trades: &[&Trade]) -> Vec<ExitReasonStats> {
        let mut by_reason: BTreeMap<ExitReason, Vec<&Trade>> = BTreeMap::new();
        for trade in trades {
            if let Some(reason) = trade.exit_reason {
                by_reason.entry(reason).or_default().push(trade);
            }
        }

        by_reason
            .into_iter()
            .map(|(reason, trades)| ExitReasonStats {
                reason,
                count: trades.len(),
                total_pnl: trades.iter().map(|t| t.pnl).sum(),
                avg_holding_days: trades.iter().map(|t| t.holding_days as f64).sum::<f64>()
                    / trades.len() as f64,
            })
            .collect()
    }
}

fn exit_date(trade: &&Trade) -> NaiveDate {
    trade.exit_date.unwrap_or(trade.marked_at)
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        total / Decimal::from(count as u64)
    }
}

fn pct(value: Decimal, basis: Decimal) -> f64 {
    if basis.is_zero() {
        return 0.0;
    }
    (value / basis * Decimal::ONE_HUNDRED).to_f64().unwrap_or(0.0)
}
