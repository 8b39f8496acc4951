//! Backtest records and their lifecycle.
//!
//! `Pending -> Running -> Completed | Failed`. Terminal states are final.

pub mod runner;
pub mod store;

pub use runner::BacktestService;
pub use store::{BacktestRecord, BacktestStatus, BacktestStore};
