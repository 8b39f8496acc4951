//! Performance metrics module.
//!
//! Aggregates closed trades into:
//! - Win rate, profit factor
//! - Sharpe ratio, Sortino ratio
//! - Maximum drawdown
//! - Monthly returns and exit-reason breakdown

pub mod calculator;

pub use calculator::{
    DrawdownAnalysis, ExitReasonStats, MetricsCalculator, MonthlyReturn, PerformanceMetrics,
};
