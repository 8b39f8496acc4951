//! Parallel batch runs.
//!
//! Each job gets its own engine; the provider is the only shared state and
//! is read-only.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rayon::prelude::*;
use tracing::info;

use crate::config::EngineSettings;
use crate::data::MarketDataProvider;
use crate::strategy::StrategyTemplate;

use super::config::BacktestConfig;
use super::engine::{BacktestEngine, BacktestError, BacktestResult};

/// One backtest in a batch.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub config: BacktestConfig,
    pub template: StrategyTemplate,
}

/// Outcome of one job, in submission order.
#[derive(Debug)]
pub struct BatchOutcome {
    pub name: String,
    pub result: Result<BacktestResult, BacktestError>,
}

/// Run independent backtests in parallel.
pub fn run_batch(
    settings: &EngineSettings,
    jobs: Vec<BatchJob>,
    provider: Arc<dyn MarketDataProvider>,
) -> Vec<BatchOutcome> {
    let total = jobs.len();
    let progress = AtomicUsize::new(0);
    info!("Running {} backtests in parallel", total);

    jobs.into_par_iter()
        .map(|job| {
            let name = if job.config.name.is_empty() {
                job.template.name.clone()
            } else {
                job.config.name.clone()
            };

            let mut engine = BacktestEngine::new(
                settings.clone(),
                job.config,
                job.template,
                Arc::clone(&provider),
            );
            let result = engine.run();

            let done = progress.fetch_add(1, Ordering::Relaxed) + 1;
            if done % (total / 10).max(1) == 0 || done == total {
                info!(
                    "  {:.0}% ({}/{} backtests)",
                    done as f64 / total as f64 * 100.0,
                    done,
                    total
                );
            }

            BatchOutcome { name, result }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backtest::EntryCadence;
    use crate::data::{InMemoryProvider, SpotBar};
    use crate::strategy::StrategyKind;
    use chrono::{Datelike, NaiveDate};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn provider() -> Arc<dyn MarketDataProvider> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let bars = start
            .iter_days()
            .take_while(|d| *d <= end)
            .filter(|d| d.weekday().num_days_from_monday() < 5)
            .enumerate()
            .map(|(i, d)| {
                let drift = Decimal::from(i as i64 * 7 % 300);
                SpotBar::flat(d, dec!(21500) + drift, Some(0.14))
            });
        Arc::new(InMemoryProvider::with_bars(bars))
    }

    fn job(kind: StrategyKind, entry: EntryCadence) -> BatchJob {
        BatchJob {
            config: BacktestConfig {
                start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                end_date: NaiveDate::from_ymd_opt(2024, 2, 29).unwrap(),
                entry,
                ..Default::default()
            },
            template: StrategyTemplate::preset(kind, 100).unwrap(),
        }
    }

    #[test]
    fn test_batch_matches_sequential_runs() {
        let provider = provider();
        let settings = EngineSettings::default();
        let jobs = vec![
            job(StrategyKind::LongStraddle, EntryCadence::Weekly),
            job(StrategyKind::ShortStrangle, EntryCadence::Monthly),
            job(StrategyKind::IronCondor, EntryCadence::Daily),
        ];

        let outcomes = run_batch(&settings, jobs.clone(), Arc::clone(&provider));
        assert_eq!(outcomes.len(), 3);

        for (outcome, job) in outcomes.iter().zip(jobs) {
            assert_eq!(outcome.name, job.template.name);
            let expected = BacktestEngine::new(
                settings.clone(),
                job.config,
                job.template,
                Arc::clone(&provider),
            )
            .run()
            .unwrap();
            let actual = outcome.result.as_ref().unwrap();
            assert_eq!(actual.trades, expected.trades);
            assert_eq!(actual.metrics, expected.metrics);
        }
    }

    #[test]
    fn test_batch_isolates_failures() {
        let mut bad = job(StrategyKind::LongStraddle, EntryCadence::OnDate);
        bad.config.initial_capital = Decimal::ZERO;
        let outcomes = run_batch(
            &EngineSettings::default(),
            vec![bad, job(StrategyKind::LongStraddle, EntryCadence::OnDate)],
            provider(),
        );

        assert!(matches!(outcomes[0].result, Err(BacktestError::InvalidConfig(_))));
        assert!(outcomes[1].result.is_ok());
    }
}
