#![allow(dead_code)]

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;

use optlab_backtest::backtest::{BacktestConfig, EntryCadence};
use optlab_backtest::data::{InMemoryProvider, SpotBar};

pub const VOL: f64 = 0.15;

pub fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, m, d).unwrap()
}

/// Monday to Friday dates in `[from, to]`.
pub fn weekdays(from: NaiveDate, to: NaiveDate) -> Vec<NaiveDate> {
    from.iter_days()
        .take_while(|d| *d <= to)
        .filter(|d| d.weekday().num_days_from_monday() < 5)
        .collect()
}

/// Flat bars at `spot` with constant volatility.
pub fn flat_bars(from: NaiveDate, to: NaiveDate, spot: Decimal) -> Vec<SpotBar> {
    weekdays(from, to)
        .into_iter()
        .map(|d| SpotBar::flat(d, spot, Some(VOL)))
        .collect()
}

/// Flat at `before` until `jump_on`, then flat at `after`.
pub fn jump_bars(
    from: NaiveDate,
    to: NaiveDate,
    before: Decimal,
    jump_on: NaiveDate,
    after: Decimal,
) -> Vec<SpotBar> {
    weekdays(from, to)
        .into_iter()
        .map(|d| {
            let spot = if d < jump_on { before } else { after };
            SpotBar::flat(d, spot, Some(VOL))
        })
        .collect()
}

/// Deterministic zig-zag around `base` with a slowly varying volatility.
pub fn noisy_bars(from: NaiveDate, to: NaiveDate, base: Decimal) -> Vec<SpotBar> {
    weekdays(from, to)
        .into_iter()
        .enumerate()
        .map(|(i, d)| {
            let swing = ((i as i64 * 37) % 17 - 8) * 45;
            let vol = 0.12 + ((i % 7) as f64) * 0.01;
            SpotBar::flat(d, base + Decimal::from(swing), Some(vol))
        })
        .collect()
}

pub fn provider(bars: Vec<SpotBar>) -> InMemoryProvider {
    InMemoryProvider::with_bars(bars)
}

pub fn config(start: NaiveDate, end: NaiveDate, entry: EntryCadence) -> BacktestConfig {
    BacktestConfig {
        name: "scenario".to_string(),
        start_date: start,
        end_date: end,
        initial_capital: Decimal::from(500_000),
        entry,
        ..Default::default()
    }
}
