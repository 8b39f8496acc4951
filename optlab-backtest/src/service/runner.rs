//! Backtest service.
//!
//! Owns the store and the market data provider, validates requests and runs
//! backtests either on the caller's thread or on Tokio's blocking pool.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backtest::{BacktestConfig, BacktestEngine, BacktestError, CancelFlag, Trade};
use crate::config::EngineSettings;
use crate::data::MarketDataProvider;
use crate::metrics::{MetricsCalculator, PerformanceMetrics};
use crate::strategy::StrategyTemplate;

use super::store::{BacktestRecord, BacktestStatus, BacktestStore};

/// Entry point for an outer API layer.
#[derive(Clone)]
pub struct BacktestService {
    settings: Arc<EngineSettings>,
    store: Arc<BacktestStore>,
    provider: Arc<dyn MarketDataProvider>,
    running: Arc<Mutex<HashMap<u64, CancelFlag>>>,
}

impl BacktestService {
    pub fn new(settings: EngineSettings, provider: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            settings: Arc::new(settings),
            store: Arc::new(BacktestStore::new()),
            provider,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn create_strategy(
        &self,
        template: StrategyTemplate,
    ) -> Result<StrategyTemplate, BacktestError> {
        template
            .validate()
            .map_err(|e| BacktestError::InvalidConfig(e.to_string()))?;
        Ok(self.store.insert_strategy(template))
    }

    pub fn get_strategy(&self, id: u64) -> Option<StrategyTemplate> {
        self.store.strategy(id)
    }

    /// Validate and store a backtest in `Pending` state.
    pub fn create_backtest(&self, config: BacktestConfig) -> Result<BacktestRecord, BacktestError> {
        config.validate()?;
        if self.store.strategy(config.strategy_id).is_none() {
            return Err(BacktestError::NotFound(format!(
                "strategy {}",
                config.strategy_id
            )));
        }
        let record = self.store.insert_backtest(config);
        info!("Created backtest {} ({})", record.id, record.config.name);
        Ok(record)
    }

    /// Start a pending backtest on the blocking pool.
    ///
    /// Returns `None` when the backtest is missing or not pending. Must be
    /// called from within a Tokio runtime.
    pub fn run_backtest(&self, id: u64) -> Option<JoinHandle<BacktestRecord>> {
        let record = self.begin(id)?;
        let service = self.clone();
        Some(tokio::task::spawn_blocking(move || service.execute(record)))
    }

    /// Run a pending backtest on the current thread.
    pub fn run_backtest_blocking(&self, id: u64) -> Option<BacktestRecord> {
        let record = self.begin(id)?;
        Some(self.execute(record))
    }

    /// Request cancellation. A pending backtest fails immediately; a running
    /// one stops at its next date.
    pub fn cancel_backtest(&self, id: u64) -> bool {
        // Held across the pending check so `begin` cannot start the run
        // in between.
        let running = self.lock_running();
        if let Some(flag) = running.get(&id) {
            flag.cancel();
            info!("Cancellation requested for backtest {}", id);
            return true;
        }

        match self.store.backtest(id) {
            Some(record) if record.status == BacktestStatus::Pending => {
                self.store
                    .fail(id, BacktestError::Cancelled.to_string(), Vec::new())
            }
            _ => false,
        }
    }

    pub fn get_backtest(&self, id: u64) -> Option<BacktestRecord> {
        self.store.backtest(id)
    }

    pub fn get_trades(&self, id: u64) -> Vec<Trade> {
        self.store.trades(id)
    }

    pub fn get_metrics(&self, id: u64) -> Option<PerformanceMetrics> {
        self.store.metrics(id)
    }

    /// Rebuild metrics from the stored trades and replace the stored copy.
    pub fn recompute_metrics(&self, id: u64) -> Result<PerformanceMetrics, BacktestError> {
        let record = self
            .store
            .backtest(id)
            .ok_or_else(|| BacktestError::NotFound(format!("backtest {}", id)))?;

        let metrics = MetricsCalculator::calculate(
            &self.store.trades(id),
            record.config.initial_capital,
            self.settings.metrics_risk_free_rate,
        );
        self.store.set_metrics(id, metrics.clone());
        Ok(metrics)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<u64, CancelFlag>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the backtest running and register its cancel flag in one step.
    fn begin(&self, id: u64) -> Option<BacktestRecord> {
        let mut running = self.lock_running();
        let record = self.store.begin(id)?;
        running.insert(id, CancelFlag::new());
        Some(record)
    }

    fn execute(&self, record: BacktestRecord) -> BacktestRecord {
        let id = record.id;
        let cancel = self
            .lock_running()
            .get(&id)
            .cloned()
            .unwrap_or_default();

        match self.store.strategy(record.config.strategy_id) {
            Some(template) => {
                let mut engine = BacktestEngine::new(
                    (*self.settings).clone(),
                    record.config.clone(),
                    template,
                    Arc::clone(&self.provider),
                )
                .with_cancel_flag(cancel);

                let outcome = panic::catch_unwind(AssertUnwindSafe(|| engine.run()));
                match outcome {
                    Ok(Ok(result)) => {
                        self.store.complete(id, result.trades, result.metrics);
                    }
                    Ok(Err(e)) => {
                        warn!("Backtest {} failed: {}", id, e);
                        self.store.fail(id, e.to_string(), engine.trades());
                    }
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        warn!("Backtest {} panicked: {}", id, message);
                        self.store.fail(id, message, engine.trades());
                    }
                }
            }
            None => {
                let e = BacktestError::NotFound(format!("strategy {}", record.config.strategy_id));
                warn!("Backtest {} failed: {}", id, e);
                self.store.fail(id, e.to_string(), Vec::new());
            }
        }

        self.lock_running().remove(&id);
        self.store.backtest(id).unwrap_or(record)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "backtest panicked".to_string())
}
