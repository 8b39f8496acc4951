mod common;

use std::sync::{Arc, OnceLock};

use approx::assert_relative_eq;
use chrono::NaiveDate;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;

use optlab_backtest::backtest::{
    BacktestConfig, BacktestEngine, EntryCadence, ExitReason, ExitRule, TradeStatus,
};
use optlab_backtest::config::{AppConfig, EngineSettings};
use optlab_backtest::data::{
    ChainQuote, DataError, InMemoryProvider, MarketDataProvider, OptionType, SeriesLoader, SpotBar,
};
use optlab_backtest::metrics::MetricsCalculator;
use optlab_backtest::service::{BacktestService, BacktestStatus};
use optlab_backtest::strategy::{StrategyKind, StrategyTemplate};

use common::*;

fn preset(kind: StrategyKind, width: i64) -> StrategyTemplate {
    StrategyTemplate::preset(kind, width).unwrap()
}

fn run(
    bars: Vec<SpotBar>,
    config: BacktestConfig,
    template: StrategyTemplate,
) -> optlab_backtest::BacktestResult {
    BacktestEngine::new(
        EngineSettings::default(),
        config,
        template,
        Arc::new(provider(bars)),
    )
    .run()
    .unwrap()
}

fn tick(value: f64) -> Decimal {
    Decimal::from_f64(value)
        .unwrap()
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[test]
fn long_straddle_held_to_expiry() {
    let bars = jump_bars(date(1, 1), date(1, 31), dec!(21500), date(1, 25), dec!(22300));
    let config = config(date(1, 1), date(1, 31), EntryCadence::OnDate);
    let result = run(bars, config, preset(StrategyKind::LongStraddle, 0));

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.entry_date, date(1, 1));
    assert_eq!(trade.expiry_date, date(1, 25));
    assert_eq!(trade.exit_date, Some(date(1, 25)));
    assert_eq!(trade.exit_reason, Some(ExitReason::Expiry));
    assert_eq!(trade.holding_days, 24);

    // Entry at the model price, rounded to two decimals
    let pricer = EngineSettings::default().pricer();
    let t = 24.0 / 365.0;
    let call = tick(pricer.price(21500.0, 21500.0, t, VOL, OptionType::Call).unwrap().price);
    let put = tick(pricer.price(21500.0, 21500.0, t, VOL, OptionType::Put).unwrap().price);
    assert_eq!(trade.legs[0].strike, dec!(21500));
    assert_eq!(trade.legs[0].entry_price, call);
    assert_eq!(trade.legs[1].entry_price, put);
    assert_eq!(trade.entry_premium, -(call + put));

    // Settlement at intrinsic on 22300
    assert_eq!(trade.legs[0].exit_price, dec!(800));
    assert_eq!(trade.legs[1].exit_price, Decimal::ZERO);
    assert_eq!(trade.exit_premium, dec!(800));
    assert_eq!(trade.pnl, (dec!(800) - call - put) * dec!(50));
    assert_eq!(trade.legs_pnl() * dec!(50), trade.pnl);

    let m = &result.metrics;
    assert_eq!(m.total_trades, 1);
    assert_eq!(m.total_pnl, trade.pnl);
    assert_eq!(m.final_capital, dec!(500_000) + trade.pnl);
}

#[test]
fn short_strangle_stopped_out_before_expiry() {
    let bars = jump_bars(date(1, 1), date(1, 31), dec!(21500), date(1, 10), dec!(22500));
    let config = BacktestConfig {
        exit_rule: ExitRule::StopLoss,
        stop_loss_pct: Some(20.0),
        ..config(date(1, 1), date(1, 31), EntryCadence::OnDate)
    };
    let result = run(bars, config, preset(StrategyKind::ShortStrangle, 200));

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert!(trade.entry_premium > Decimal::ZERO);
    assert_eq!(trade.legs[0].strike, dec!(21700));
    assert_eq!(trade.legs[1].strike, dec!(21300));

    assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
    assert_eq!(trade.exit_date, Some(date(1, 10)));
    assert!(trade.exit_date.unwrap() < trade.expiry_date);
    assert!(trade.pnl < Decimal::ZERO);
    assert!(trade.pnl_pct <= -20.0);
    assert_eq!(trade.legs_pnl() * dec!(50), trade.pnl);
}

#[test]
fn weekly_entries_over_four_weeks() {
    let bars = flat_bars(date(1, 1), date(1, 31), dec!(21500));
    let config = config(date(1, 1), date(1, 28), EntryCadence::Weekly);
    let result = run(bars, config, preset(StrategyKind::LongStraddle, 0));

    let entries: Vec<NaiveDate> = result.trades.iter().map(|t| t.entry_date).collect();
    assert_eq!(entries, vec![date(1, 1), date(1, 8), date(1, 15), date(1, 22)]);

    let numbers: Vec<u32> = result.trades.iter().map(|t| t.trade_number).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4]);

    for trade in &result.trades {
        assert_eq!(trade.exit_date, Some(date(1, 25)));
        assert_eq!(trade.exit_reason, Some(ExitReason::Expiry));
    }
    assert_eq!(result.metrics.total_trades, 4);
}

#[test]
fn accounting_invariants_hold_across_a_busy_run() {
    let bars = noisy_bars(date(1, 1), date(3, 31), dec!(21500));
    let config = BacktestConfig {
        exit_rule: ExitRule::Target,
        target_pct: Some(50.0),
        stop_loss_pct: Some(100.0),
        max_holding_days: Some(10),
        ..config(date(1, 1), date(2, 29), EntryCadence::Daily)
    };
    let result = run(bars, config, preset(StrategyKind::IronCondor, 100));
    let m = &result.metrics;

    assert!(!result.trades.is_empty());
    for (i, trade) in result.trades.iter().enumerate() {
        assert_eq!(trade.trade_number as usize, i + 1);
        assert_eq!(trade.status, TradeStatus::Closed);
        assert_eq!(trade.legs.len(), 4);
        assert_eq!(trade.legs_pnl() * dec!(50), trade.pnl);
        assert_eq!(trade.pnl, (trade.entry_premium + trade.exit_premium) * dec!(50));
        assert!(trade.exit_date.unwrap() >= trade.entry_date);
        assert!(trade.exit_date.unwrap() <= trade.expiry_date);
    }

    assert_eq!(m.total_trades, result.trades.len());
    assert_eq!(m.winning_trades + m.losing_trades + m.breakeven_trades, m.total_trades);
    assert_eq!(m.final_capital, m.initial_capital + m.total_pnl);

    let summed: f64 = result.trades.iter().map(|t| t.return_on_capital_pct).sum();
    assert_relative_eq!(summed, m.total_return_pct, epsilon = 1e-9);

    let again = MetricsCalculator::calculate(&result.trades, dec!(500_000), 0.0);
    assert_eq!(&again, m);
}

#[test]
fn calendar_spread_uses_quotes_and_later_expiry() {
    let mut provider = provider(flat_bars(date(1, 1), date(2, 29), dec!(21500)));
    provider.insert_quote(ChainQuote {
        trade_date: date(1, 1),
        expiry: date(1, 25),
        strike: dec!(21500),
        option_type: OptionType::Call,
        price: dec!(310),
        implied_vol: Some(0.14),
    });

    let config = config(date(1, 1), date(1, 31), EntryCadence::OnDate);
    let result = BacktestEngine::new(
        EngineSettings::default(),
        config,
        preset(StrategyKind::LongCalendarSpread, 0),
        Arc::new(provider),
    )
    .run()
    .unwrap();

    let trade = &result.trades[0];
    let (near, far) = (&trade.legs[0], &trade.legs[1]);
    assert_eq!(near.expiry, date(1, 25));
    assert_eq!(far.expiry, date(2, 29));
    assert_eq!(near.entry_price, dec!(310));
    assert_eq!(near.entry_volatility, 0.14);
    assert_eq!(far.entry_volatility, VOL);

    // Closes with the near leg; the far leg is marked at model value
    assert_eq!(trade.expiry_date, date(1, 25));
    assert_eq!(trade.exit_reason, Some(ExitReason::Expiry));
    assert_eq!(near.exit_price, Decimal::ZERO);
    assert!(far.exit_price > Decimal::ZERO);
    assert_eq!(trade.legs_pnl() * dec!(50), trade.pnl);
}

#[test]
fn csv_series_matches_in_memory_run() {
    let bars = flat_bars(date(1, 1), date(1, 31), dec!(21500));
    let mut csv = String::from("date,close,historical_volatility\n");
    for bar in &bars {
        csv.push_str(&format!("{},{},{}\n", bar.date, bar.close, VOL));
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nifty.csv");
    std::fs::write(&path, csv).unwrap();
    let loaded = SeriesLoader::new(&path).load().unwrap();

    let config = config(date(1, 1), date(1, 31), EntryCadence::Weekly);
    let template = preset(StrategyKind::IronButterfly, 200);
    let from_file = BacktestEngine::new(
        EngineSettings::default(),
        config.clone(),
        template.clone(),
        Arc::new(loaded),
    )
    .run()
    .unwrap();
    let in_memory = run(bars, config, template);

    assert_eq!(from_file.trades, in_memory.trades);
    assert_eq!(from_file.metrics, in_memory.metrics);
}

#[test]
fn run_file_drives_a_backtest() {
    let app = AppConfig::from_toml_str(
        r#"
        [strategy]
        kind = "bull_call_spread"
        width = 100

        [backtest]
        start_date = "2024-01-01"
        end_date = "2024-01-31"
        initial_capital = "200000"
        entry = "monthly"
        "#,
    )
    .unwrap();

    let template = app.strategy.into_template().unwrap();
    let result = BacktestEngine::new(
        app.settings,
        app.backtest,
        template,
        Arc::new(provider(flat_bars(date(1, 1), date(1, 31), dec!(21500)))),
    )
    .run()
    .unwrap();

    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].legs[1].strike, dec!(21600));
}

fn straddle_service(bars: Vec<SpotBar>) -> (BacktestService, u64) {
    let service = BacktestService::new(EngineSettings::default(), Arc::new(provider(bars)));
    let strategy = service
        .create_strategy(preset(StrategyKind::LongStraddle, 0))
        .unwrap();
    (service, strategy.id)
}

#[test]
fn empty_window_fails_with_no_data() {
    let (service, strategy_id) = straddle_service(flat_bars(date(1, 1), date(1, 31), dec!(21500)));
    let record = service
        .create_backtest(BacktestConfig {
            strategy_id,
            ..config(date(3, 1), date(3, 31), EntryCadence::Daily)
        })
        .unwrap();

    let done = service.run_backtest_blocking(record.id).unwrap();
    assert_eq!(done.status, BacktestStatus::Failed);
    assert!(done.error_message.unwrap().contains("no data"));
    assert!(service.get_trades(record.id).is_empty());
    assert!(service.get_metrics(record.id).is_none());
}

/// Provider that fires a callback when the engine asks for one date.
struct HookProvider {
    inner: InMemoryProvider,
    trigger: NaiveDate,
    hook: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl MarketDataProvider for HookProvider {
    fn get_spot_series(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<SpotBar>, DataError> {
        self.inner.get_spot_series(start, end)
    }

    fn get_volatility(&self, date: NaiveDate) -> Result<f64, DataError> {
        if date == self.trigger {
            if let Some(hook) = self.hook.get() {
                hook();
            }
        }
        self.inner.get_volatility(date)
    }
}

#[test]
fn cancellation_keeps_recorded_trades() {
    let provider = Arc::new(HookProvider {
        inner: provider(flat_bars(date(1, 1), date(1, 31), dec!(21500))),
        trigger: date(1, 10),
        hook: OnceLock::new(),
    });
    let service = BacktestService::new(EngineSettings::default(), provider.clone());
    let strategy = service
        .create_strategy(preset(StrategyKind::LongStraddle, 0))
        .unwrap();
    let record = service
        .create_backtest(BacktestConfig {
            strategy_id: strategy.id,
            ..config(date(1, 1), date(1, 31), EntryCadence::Daily)
        })
        .unwrap();

    let canceller = service.clone();
    let id = record.id;
    let installed = provider.hook.set(Box::new(move || {
        canceller.cancel_backtest(id);
    }));
    assert!(installed.is_ok());

    let done = service.run_backtest_blocking(record.id).unwrap();
    assert_eq!(done.status, BacktestStatus::Failed);
    assert_eq!(done.error_message.as_deref(), Some("cancelled"));

    // Jan 1 through Jan 10 each opened a trade before the run stopped
    let trades = service.get_trades(record.id);
    assert_eq!(trades.len(), 8);
    assert!(trades.iter().all(|t| t.status == TradeStatus::Open));
    assert!(service.get_metrics(record.id).is_none());
}

#[tokio::test]
async fn background_run_is_idempotent() {
    let (service, strategy_id) = straddle_service(flat_bars(date(1, 1), date(1, 31), dec!(21500)));
    let record = service
        .create_backtest(BacktestConfig {
            strategy_id,
            ..config(date(1, 1), date(1, 31), EntryCadence::Weekly)
        })
        .unwrap();

    let handle = service.run_backtest(record.id).unwrap();
    assert!(service.run_backtest(record.id).is_none());

    let done = handle.await.unwrap();
    assert_eq!(done.status, BacktestStatus::Completed);
    assert!(service.run_backtest(record.id).is_none());

    let trades = service.get_trades(record.id);
    let metrics = service.get_metrics(record.id).unwrap();
    assert_eq!(metrics.total_trades, trades.len());
    assert_eq!(service.recompute_metrics(record.id).unwrap(), metrics);
    assert_eq!(service.get_backtest(record.id).unwrap().status, BacktestStatus::Completed);
}
