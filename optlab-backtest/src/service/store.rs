//! In-memory backtest store.
//!
//! Layout:
//! - strategies by id
//! - backtests by id, each pointing at a strategy id
//! - trades keyed by (backtest id, trade number), legs ordered inside the trade
//! - metrics one-to-one with backtests

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtest::{BacktestConfig, Trade};
use crate::metrics::PerformanceMetrics;
use crate::strategy::StrategyTemplate;

/// Lifecycle state of a backtest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BacktestStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl BacktestStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BacktestStatus::Completed | BacktestStatus::Failed)
    }
}

/// A stored backtest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestRecord {
    pub id: u64,
    pub config: BacktestConfig,
    pub status: BacktestStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct StoreInner {
    last_strategy_id: u64,
    last_backtest_id: u64,
    strategies: BTreeMap<u64, StrategyTemplate>,
    backtests: BTreeMap<u64, BacktestRecord>,
    trades: BTreeMap<(u64, u32), Trade>,
    metrics: HashMap<u64, PerformanceMetrics>,
}

/// Thread-safe store shared by the service and its background runs.
#[derive(Default)]
pub struct BacktestStore {
    inner: RwLock<StoreInner>,
}

impl BacktestStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a template under a fresh id.
    pub fn insert_strategy(&self, mut template: StrategyTemplate) -> StrategyTemplate {
        let mut inner = self.write();
        inner.last_strategy_id += 1;
        template.id = inner.last_strategy_id;
        inner.strategies.insert(template.id, template.clone());
        template
    }

    pub fn strategy(&self, id: u64) -> Option<StrategyTemplate> {
        self.read().strategies.get(&id).cloned()
    }

    /// Store a new pending backtest.
    pub fn insert_backtest(&self, config: BacktestConfig) -> BacktestRecord {
        let mut inner = self.write();
        inner.last_backtest_id += 1;
        let record = BacktestRecord {
            id: inner.last_backtest_id,
            config,
            status: BacktestStatus::Pending,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        inner.backtests.insert(record.id, record.clone());
        record
    }

    pub fn backtest(&self, id: u64) -> Option<BacktestRecord> {
        self.read().backtests.get(&id).cloned()
    }

    /// Move a pending backtest to running. `None` unless it was pending.
    pub fn begin(&self, id: u64) -> Option<BacktestRecord> {
        let mut inner = self.write();
        let record = inner.backtests.get_mut(&id)?;
        if record.status != BacktestStatus::Pending {
            return None;
        }
        record.status = BacktestStatus::Running;
        record.started_at = Some(Utc::now());
        Some(record.clone())
    }

    /// Record a successful run.
    pub fn complete(&self, id: u64, trades: Vec<Trade>, metrics: PerformanceMetrics) -> bool {
        let mut inner = self.write();
        match inner.backtests.get_mut(&id) {
            Some(record) if record.status == BacktestStatus::Running => {
                record.status = BacktestStatus::Completed;
                record.completed_at = Some(Utc::now());
            }
            _ => return false,
        }
        replace_trades(&mut inner, id, trades);
        inner.metrics.insert(id, metrics);
        true
    }

    /// Record a failed run, keeping the trades it produced.
    pub fn fail(&self, id: u64, message: impl Into<String>, trades: Vec<Trade>) -> bool {
        let mut inner = self.write();
        match inner.backtests.get_mut(&id) {
            Some(record) if !record.status.is_terminal() => {
                record.status = BacktestStatus::Failed;
                record.error_message = Some(message.into());
                record.completed_at = Some(Utc::now());
            }
            _ => return false,
        }
        replace_trades(&mut inner, id, trades);
        true
    }

    /// Trades of a backtest, ordered by trade number.
    pub fn trades(&self, id: u64) -> Vec<Trade> {
        self.read()
            .trades
            .range((id, 0)..=(id, u32::MAX))
            .map(|(_, trade)| trade.clone())
            .collect()
    }

    pub fn metrics(&self, id: u64) -> Option<PerformanceMetrics> {
        self.read().metrics.get(&id).cloned()
    }

    /// Replace the metrics of a backtest wholesale.
    pub fn set_metrics(&self, id: u64, metrics: PerformanceMetrics) {
        self.write().metrics.insert(id, metrics);
    }
}

fn replace_trades(inner: &mut StoreInner, id: u64, trades: Vec<Trade>) {
    let keys: Vec<(u64, u32)> = inner
        .trades
        .range((id, 0)..=(id, u32::MAX))
        .map(|(key, _)| *key)
        .collect();
    for key in keys {
        inner.trades.remove(&key);
    }

    for mut trade in trades {
        trade.legs.sort_by_key(|leg| leg.leg_order);
        inner.trades.insert((id, trade.trade_number), trade);
    }
}
