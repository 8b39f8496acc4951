//! Core backtesting engine.
//!
//! Runs the simulation loop over the trading dates of the window:
//! 1. Look up the day's volatility (cached per run)
//! 2. Mark open trades and check exit conditions
//! 3. Enter a new trade when the entry cadence is due
//!
//! Trades still open at the end of the window keep being monitored on later
//! data until they expire; if the data runs out first they close at the
//! last mark.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::EngineSettings;
use crate::data::{DataError, MarketDataProvider, SpotBar};
use crate::metrics::{MetricsCalculator, PerformanceMetrics};
use crate::pricing::PricingError;
use crate::strategy::{MarketContext, StrategyError, StrategyResolver, StrategyTemplate};

use super::config::BacktestConfig;
use super::schedule::EntrySchedule;
use super::trade::{ExitReason, Trade};

#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("no data between {start} and {end}")]
    NoDataInRange { start: NaiveDate, end: NaiveDate },

    #[error("cancelled")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("Strategy error: {0}")]
    Strategy(#[from] StrategyError),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),
}

/// Shared cancellation signal, checked once per date.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of a completed backtest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    /// Configuration used.
    pub config: BacktestConfig,

    /// Strategy traded.
    pub strategy: String,

    pub start_date: NaiveDate,

    pub end_date: NaiveDate,

    /// Trading dates inside the window.
    pub trading_days: usize,

    /// All trades, ordered by trade number.
    pub trades: Vec<Trade>,

    pub metrics: PerformanceMetrics,
}

impl BacktestResult {
    /// Generate summary string.
    pub fn summary(&self) -> String {
        format!(
            "Backtest: {} ({} to {}, {} trading days)\n\
             ----------------------------------------\n\
             {}",
            self.strategy,
            self.start_date,
            self.end_date,
            self.trading_days,
            self.metrics.summary()
        )
    }
}

/// The main backtesting engine.
pub struct BacktestEngine {
    settings: EngineSettings,
    config: BacktestConfig,
    template: StrategyTemplate,
    provider: Arc<dyn MarketDataProvider>,
    resolver: StrategyResolver,
    cancel: CancelFlag,
    open_trades: Vec<Trade>,
    closed_trades: Vec<Trade>,
    next_trade_number: u32,
    trading_days: usize,
    vol_cache: HashMap<NaiveDate, Option<f64>>,
}

impl BacktestEngine {
    /// Create a new backtest engine.
    pub fn new(
        settings: EngineSettings,
        config: BacktestConfig,
        template: StrategyTemplate,
        provider: Arc<dyn MarketDataProvider>,
    ) -> Self {
        let resolver = StrategyResolver::from_settings(&settings);
        Self {
            settings,
            config,
            template,
            provider,
            resolver,
            cancel: CancelFlag::default(),
            open_trades: Vec::new(),
            closed_trades: Vec::new(),
            next_trade_number: 1,
            trading_days: 0,
            vol_cache: HashMap::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    /// Run the backtest.
    ///
    /// On error the trades recorded so far stay available through
    /// [`BacktestEngine::trades`].
    pub fn run(&mut self) -> Result<BacktestResult, BacktestError> {
        self.reset();

        self.settings
            .validate()
            .map_err(|e| BacktestError::InvalidConfig(e.to_string()))?;
        self.config.validate()?;
        self.template
            .validate()
            .map_err(|e| BacktestError::InvalidConfig(e.to_string()))?;

        let start = self.config.start_date;
        let end = self.config.end_date;

        let bars = self
            .provider
            .get_spot_series(start, end)
            .map_err(|e| match e {
                DataError::NoDataInRange { start, end } => {
                    BacktestError::NoDataInRange { start, end }
                }
                other => BacktestError::Data(other),
            })?;

        info!(
            "Running {} on {} from {} to {} ({} bars)",
            self.template.name,
            self.config.underlying,
            start,
            end,
            bars.len()
        );

        let mut schedule = EntrySchedule::new(self.config.entry, start);
        for bar in bars.iter().filter(|b| b.date >= start && b.date <= end) {
            self.check_cancelled()?;
            self.process_day(bar, &mut schedule)?;
            self.trading_days += 1;
        }

        self.settle_after_end(end)?;

        let result = self.build_result();
        info!(
            "Backtest {} complete: {} trades, total P&L {}",
            result.strategy, result.metrics.total_trades, result.metrics.total_pnl
        );
        Ok(result)
    }

    /// Closed and still-open trades, ordered by trade number.
    pub fn trades(&self) -> Vec<Trade> {
        let mut trades: Vec<Trade> = self
            .closed_trades
            .iter()
            .chain(self.open_trades.iter())
            .cloned()
            .collect();
        trades.sort_by_key(|t| t.trade_number);
        trades
    }

    fn reset(&mut self) {
        self.open_trades.clear();
        self.closed_trades.clear();
        self.next_trade_number = 1;
        self.trading_days = 0;
        self.vol_cache.clear();
    }

    fn check_cancelled(&self) -> Result<(), BacktestError> {
        if self.cancel.is_cancelled() {
            info!(
                "Backtest {} cancelled with {} trades recorded",
                self.template.name,
                self.closed_trades.len() + self.open_trades.len()
            );
            return Err(BacktestError::Cancelled);
        }
        Ok(())
    }

    /// Process a single trading day.
    fn process_day(
        &mut self,
        bar: &SpotBar,
        schedule: &mut EntrySchedule,
    ) -> Result<(), BacktestError> {
        let vol = self.volatility(bar.date)?;

        self.check_exits(bar, vol)?;

        if schedule.is_due(bar.date) && self.try_enter(bar, vol)? {
            schedule.mark_entered(bar.date);
        }

        Ok(())
    }

    /// Volatility for `date`, `None` when the provider has none.
    fn volatility(&mut self, date: NaiveDate) -> Result<Option<f64>, BacktestError> {
        if let Some(cached) = self.vol_cache.get(&date) {
            return Ok(*cached);
        }

        let vol = match self.provider.get_volatility(date) {
            Ok(v) => Some(v),
            Err(DataError::MissingMarketData(_)) => None,
            Err(e) => return Err(e.into()),
        };
        self.vol_cache.insert(date, vol);
        Ok(vol)
    }

    /// Mark open trades and close those hitting an exit condition.
    fn check_exits(&mut self, bar: &SpotBar, vol: Option<f64>) -> Result<(), BacktestError> {
        if self.open_trades.is_empty() {
            return Ok(());
        }

        let provider = Arc::clone(&self.provider);
        let mut ctx = MarketContext::new(bar.date, &self.settings.calendar)
            .with_spot(bar.close)
            .with_quotes(provider.quote_source());
        if let Some(v) = vol {
            ctx = ctx.with_volatility(v);
        }

        let lot_size = self.settings.lot_size;
        let capital = self.config.initial_capital;

        let mut i = 0;
        while i < self.open_trades.len() {
            let trade = &mut self.open_trades[i];
            mark_trade(&self.resolver, &ctx, trade, lot_size, capital)?;

            match exit_reason(&self.config, trade, bar.date) {
                Some(reason) => {
                    let mut trade = self.open_trades.remove(i);
                    trade.close(reason);
                    debug!(
                        "Closed trade #{} on {} ({:?}): P&L {}",
                        trade.trade_number, bar.date, reason, trade.pnl
                    );
                    self.closed_trades.push(trade);
                }
                None => i += 1,
            }
        }

        Ok(())
    }

    /// Open a trade on `bar`. Returns false when the date lacks market data.
    fn try_enter(&mut self, bar: &SpotBar, vol: Option<f64>) -> Result<bool, BacktestError> {
        let provider = Arc::clone(&self.provider);
        let mut ctx = MarketContext::new(bar.date, &self.settings.calendar)
            .with_spot(bar.close)
            .with_quotes(provider.quote_source());
        if let Some(v) = vol {
            ctx = ctx.with_volatility(v);
        }

        let legs = match self.resolver.instantiate(&self.template, &ctx) {
            Ok(legs) => legs,
            Err(StrategyError::MissingMarketData(date)) => {
                debug!("Skipping entry on {}: missing market data", date);
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let trade = Trade::open(
            self.next_trade_number,
            bar.date,
            bar.close,
            &legs,
            self.settings.lot_size,
            self.config.initial_capital,
        );
        debug!(
            "Opened trade #{} on {} at spot {}: premium {}",
            trade.trade_number, bar.date, bar.close, trade.entry_premium
        );

        self.next_trade_number += 1;
        self.open_trades.push(trade);
        Ok(true)
    }

    /// Monitor trades still open after `end` on later data until they
    /// close, then close whatever remains at the last mark.
    fn settle_after_end(&mut self, end: NaiveDate) -> Result<(), BacktestError> {
        let from = end.succ_opt().filter(|_| !self.open_trades.is_empty());
        if let Some(from) = from {
            let bars = match self.provider.get_spot_series(from, NaiveDate::MAX) {
                Ok(bars) => bars,
                Err(DataError::NoDataInRange { .. }) => Vec::new(),
                Err(e) => return Err(e.into()),
            };

            for bar in &bars {
                if self.open_trades.is_empty() {
                    break;
                }
                self.check_cancelled()?;
                let vol = self.volatility(bar.date)?;
                self.check_exits(bar, vol)?;
            }
        }

        for mut trade in self.open_trades.drain(..) {
            trade.close(ExitReason::EndOfPeriod);
            debug!(
                "Closed trade #{} at end of data ({}): P&L {}",
                trade.trade_number, trade.marked_at, trade.pnl
            );
            self.closed_trades.push(trade);
        }

        Ok(())
    }

    /// Build the final backtest result.
    fn build_result(&self) -> BacktestResult {
        let trades = self.trades();
        let metrics = MetricsCalculator::calculate(
            &trades,
            self.config.initial_capital,
            self.settings.metrics_risk_free_rate,
        );

        BacktestResult {
            config: self.config.clone(),
            strategy: self.template.name.clone(),
            start_date: self.config.start_date,
            end_date: self.config.end_date,
            trading_days: self.trading_days,
            trades,
            metrics,
        }
    }
}

/// Reprice every leg and refresh trade P&L.
///
/// Legs fall back to their last volatility when the date has none.
fn mark_trade(
    resolver: &StrategyResolver,
    ctx: &MarketContext<'_>,
    trade: &mut Trade,
    lot_size: u32,
    capital: Decimal,
) -> Result<(), BacktestError> {
    let spot = ctx.spot.ok_or(StrategyError::MissingMarketData(ctx.date))?;

    for leg in &mut trade.legs {
        let vol = ctx.volatility.unwrap_or(leg.exit_volatility);
        let leg_ctx = ctx.with_volatility(vol);
        let price = resolver.mark(&leg_ctx, leg.option_type, leg.strike, leg.expiry)?;
        leg.update_mark(price, vol);
    }

    trade.revalue(ctx.date, spot, lot_size, capital);
    Ok(())
}

/// Exit precedence: expiry, stop loss, target, max holding days.
fn exit_reason(config: &BacktestConfig, trade: &Trade, date: NaiveDate) -> Option<ExitReason> {
    if date >= trade.expiry_date {
        return Some(ExitReason::Expiry);
    }

    if let Some(stop_loss) = config.stop_loss_pct {
        if trade.pnl_pct <= -stop_loss {
            return Some(ExitReason::StopLoss);
        }
    }

    if let Some(target) = config.target_pct {
        if trade.pnl_pct >= target {
            return Some(ExitReason::Target);
        }
    }

    if let Some(max_days) = config.max_holding_days {
        if trade.holding_days >= i64::from(max_days) {
            return Some(ExitReason::MaxDays);
        }
    }

    None
}
