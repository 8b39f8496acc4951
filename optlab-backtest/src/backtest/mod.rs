//! Backtesting engine for options strategies.
//!
//! This module provides the backtest execution framework:
//! - Run configuration (window, capital, entry cadence, exit thresholds)
//! - Trade lifecycle management (entry, daily marks, exits)
//! - Signed premium and P&L accounting per leg
//! - Parallel batch runs

pub mod batch;
pub mod config;
pub mod engine;
pub mod schedule;
pub mod trade;

pub use batch::{run_batch, BatchJob, BatchOutcome};
pub use config::{BacktestConfig, EntryCadence, ExitRule};
pub use engine::{BacktestEngine, BacktestError, BacktestResult, CancelFlag};
pub use schedule::EntrySchedule;
pub use trade::{ExitReason, Trade, TradeLeg, TradeStatus};
