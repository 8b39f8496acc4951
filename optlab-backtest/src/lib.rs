pub mod backtest;
pub mod calendar;
pub mod config;
pub mod data;
pub mod metrics;
pub mod pricing;
pub mod service;
pub mod strategy;

// Re-export commonly used types
pub use backtest::{
    run_batch, BacktestConfig, BacktestEngine, BacktestError, BacktestResult, CancelFlag,
    EntryCadence, ExitReason, ExitRule, Trade,
};
pub use calendar::{ExpiryCalendar, ExpiryCycle};
pub use config::{AppConfig, EngineSettings};
pub use data::{InMemoryProvider, MarketDataProvider, OptionType, SeriesLoader, SpotBar};
pub use metrics::{MetricsCalculator, PerformanceMetrics};
pub use pricing::{BlackScholes, OptionPricing};
pub use service::{BacktestService, BacktestStatus};
pub use strategy::{LegTemplate, StrategyKind, StrategyResolver, StrategyTemplate};
