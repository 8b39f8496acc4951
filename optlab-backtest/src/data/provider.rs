//! Market data seam between the engine and its data source.
//!
//! Providers are read-only and shared across threads; the engine calls them
//! once per run for the spot series and once per date for volatility.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use polars::prelude::PolarsError;
use rust_decimal::Decimal;
use thiserror::Error;

use super::types::{ChainQuote, OptionType, SpotBar};

#[derive(Error, Debug)]
pub enum DataError {
    #[error("Missing market data for {0}")]
    MissingMarketData(NaiveDate),

    #[error("No data between {start} and {end}")]
    NoDataInRange { start: NaiveDate, end: NaiveDate },

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Polars error: {0}")]
    Polars(#[from] PolarsError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lookup of observed option prices.
pub trait QuoteSource: Send + Sync {
    fn quote(
        &self,
        date: NaiveDate,
        strike: Decimal,
        option_type: OptionType,
        expiry: NaiveDate,
    ) -> Option<ChainQuote>;
}

/// Source of underlying prices and volatility for one symbol.
pub trait MarketDataProvider: Send + Sync {
    /// Bars in `[start, end]`, ordered by date.
    ///
    /// Returns `NoDataInRange` when the window holds no bars.
    fn get_spot_series(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<SpotBar>, DataError>;

    /// Annualised volatility for `date`, read from the bar by default.
    fn get_volatility(&self, date: NaiveDate) -> Result<f64, DataError> {
        let bars = match self.get_spot_series(date, date) {
            Ok(bars) => bars,
            Err(DataError::NoDataInRange { .. }) => {
                return Err(DataError::MissingMarketData(date))
            }
            Err(e) => return Err(e),
        };
        bars.iter()
            .find(|b| b.date == date)
            .and_then(|b| b.historical_volatility)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or(DataError::MissingMarketData(date))
    }

    /// Option chain quotes, when the provider carries them.
    fn quote_source(&self) -> Option<&dyn QuoteSource> {
        None
    }

    fn quote(
        &self,
        date: NaiveDate,
        strike: Decimal,
        option_type: OptionType,
        expiry: NaiveDate,
    ) -> Option<ChainQuote> {
        self.quote_source()
            .and_then(|q| q.quote(date, strike, option_type, expiry))
    }
}

type QuoteKey = (NaiveDate, NaiveDate, Decimal, OptionType);

/// Provider backed by in-memory maps.
#[derive(Debug, Clone, Default)]
pub struct InMemoryProvider {
    bars: BTreeMap<NaiveDate, SpotBar>,
    quotes: BTreeMap<QuoteKey, ChainQuote>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from bars; a later bar for the same date replaces an earlier one.
    pub fn with_bars(bars: impl IntoIterator<Item = SpotBar>) -> Self {
        let mut provider = Self::new();
        for bar in bars {
            provider.insert_bar(bar);
        }
        provider
    }

    pub fn insert_bar(&mut self, bar: SpotBar) {
        self.bars.insert(bar.date, bar);
    }

    pub fn insert_quote(&mut self, quote: ChainQuote) {
        let key = (
            quote.trade_date,
            quote.expiry,
            quote.strike.normalize(),
            quote.option_type,
        );
        self.quotes.insert(key, quote);
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn quote_count(&self) -> usize {
        self.quotes.len()
    }

    /// First and last bar dates.
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let first = self.bars.keys().next()?;
        let last = self.bars.keys().next_back()?;
        Some((*first, *last))
    }
}

impl MarketDataProvider for InMemoryProvider {
    fn get_spot_series(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<SpotBar>, DataError> {
        if end < start {
            return Err(DataError::NoDataInRange { start, end });
        }
        let bars: Vec<SpotBar> = self.bars.range(start..=end).map(|(_, b)| b.clone()).collect();
        if bars.is_empty() {
            return Err(DataError::NoDataInRange { start, end });
        }
        Ok(bars)
    }

    fn get_volatility(&self, date: NaiveDate) -> Result<f64, DataError> {
        self.bars
            .get(&date)
            .and_then(|b| b.historical_volatility)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .ok_or(DataError::MissingMarketData(date))
    }

    fn quote_source(&self) -> Option<&dyn QuoteSource> {
        if self.quotes.is_empty() {
            None
        } else {
            Some(self)
        }
    }
}

impl QuoteSource for InMemoryProvider {
    fn quote(
        &self,
        date: NaiveDate,
        strike: Decimal,
        option_type: OptionType,
        expiry: NaiveDate,
    ) -> Option<ChainQuote> {
        self.quotes
            .get(&(date, expiry, strike.normalize(), option_type))
            .cloned()
    }
}
