//! Market data: core types, the provider seam and file loading.

pub mod loader;
pub mod provider;
pub mod types;

pub use loader::{load_quotes, SeriesLoader};
pub use provider::{DataError, InMemoryProvider, MarketDataProvider, QuoteSource};
pub use types::{ChainQuote, Greeks, OptionType, SpotBar};
