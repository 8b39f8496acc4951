//! File loader for underlying series and option chain quotes.
//!
//! Reads parquet or CSV (chosen by file extension) into an
//! [`InMemoryProvider`].
//!
//! Spot files carry one row per trading day:
//! - required: `date`, `close`
//! - optional: `open`, `high`, `low`, `volume`, `historical_volatility`
//!
//! Quote files carry one row per contract per day:
//! - required: `trade_date`, `expiry`, `strike`, `option_type`, `price`
//! - optional: `implied_vol`

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use polars::prelude::*;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::info;

use super::provider::{DataError, InMemoryProvider};
use super::types::{ChainQuote, OptionType, SpotBar};

/// Required columns in a spot file.
pub const SPOT_COLUMNS: &[&str] = &["date", "close"];

/// Required columns in a quotes file.
pub const QUOTE_COLUMNS: &[&str] = &["trade_date", "expiry", "strike", "option_type", "price"];

/// Loader for a spot series file and an optional quotes file.
#[derive(Debug, Clone)]
pub struct SeriesLoader {
    spot_path: PathBuf,
    quotes_path: Option<PathBuf>,
}

impl SeriesLoader {
    pub fn new(spot_path: impl AsRef<Path>) -> Self {
        Self {
            spot_path: spot_path.as_ref().to_path_buf(),
            quotes_path: None,
        }
    }

    /// Also load option chain quotes from `path`.
    pub fn with_quotes(mut self, path: impl AsRef<Path>) -> Self {
        self.quotes_path = Some(path.as_ref().to_path_buf());
        self
    }

    /// Load everything into a provider.
    pub fn load(&self) -> Result<InMemoryProvider, DataError> {
        let bars = self.load_bars()?;
        let mut provider = InMemoryProvider::with_bars(bars);

        if let Some(path) = &self.quotes_path {
            for quote in load_quotes(path)? {
                provider.insert_quote(quote);
            }
        }

        info!(
            "Loaded {} bars and {} quotes from {}",
            provider.len(),
            provider.quote_count(),
            self.spot_path.display()
        );
        Ok(provider)
    }

    /// Load the spot series, sorted by date.
    pub fn load_bars(&self) -> Result<Vec<SpotBar>, DataError> {
        let mut lf = scan(&self.spot_path)?;
        let schema = lf.collect_schema()?;
        check_columns(&schema, SPOT_COLUMNS, &self.spot_path)?;

        let has = |name: &str| schema.get(name).is_some();
        let mut exprs = vec![
            col("date").cast(DataType::String),
            col("close").cast(DataType::Float64),
        ];
        for name in ["open", "high", "low", "historical_volatility"] {
            if has(name) {
                exprs.push(col(name).cast(DataType::Float64));
            }
        }
        if has("volume") {
            exprs.push(col("volume").cast(DataType::Int64));
        }

        let df = lf.select(exprs).collect()?;
        let dates = date_column(&df, "date")?;
        let closes = f64_column(&df, "close")?;
        let open = optional_f64_column(&df, "open")?;
        let high = optional_f64_column(&df, "high")?;
        let low = optional_f64_column(&df, "low")?;
        let hv = optional_f64_column(&df, "historical_volatility")?;
        let volume: Option<Vec<Option<i64>>> = match df.column("volume") {
            Ok(c) => Some(c.i64()?.into_iter().collect()),
            Err(_) => None,
        };

        let mut bars = Vec::with_capacity(df.height());
        for idx in 0..df.height() {
            let date = dates[idx];
            let close = closes[idx]
                .ok_or_else(|| DataError::InvalidData(format!("missing close on {}", date)))
                .and_then(to_decimal)?;
            let price_or_close = |column: &Option<Vec<Option<f64>>>| -> Result<Decimal, DataError> {
                match column.as_ref().and_then(|c| c[idx]) {
                    Some(v) => to_decimal(v),
                    None => Ok(close),
                }
            };

            bars.push(SpotBar {
                date,
                open: price_or_close(&open)?,
                high: price_or_close(&high)?,
                low: price_or_close(&low)?,
                close,
                volume: volume.as_ref().and_then(|v| v[idx]).unwrap_or(0),
                historical_volatility: hv.as_ref().and_then(|v| v[idx]),
            });
        }

        bars.sort_by_key(|b| b.date);
        Ok(bars)
    }
}

/// Load option chain quotes from a parquet or CSV file.
pub fn load_quotes(path: &Path) -> Result<Vec<ChainQuote>, DataError> {
    let mut lf = scan(path)?;
    let schema = lf.collect_schema()?;
    check_columns(&schema, QUOTE_COLUMNS, path)?;

    let mut exprs = vec![
        col("trade_date").cast(DataType::String),
        col("expiry").cast(DataType::String),
        col("strike").cast(DataType::Float64),
        col("option_type").cast(DataType::String),
        col("price").cast(DataType::Float64),
    ];
    if schema.get("implied_vol").is_some() {
        exprs.push(col("implied_vol").cast(DataType::Float64));
    }

    let df = lf.select(exprs).collect()?;
    let trade_dates = date_column(&df, "trade_date")?;
    let expiries = date_column(&df, "expiry")?;
    let strikes = f64_column(&df, "strike")?;
    let prices = f64_column(&df, "price")?;
    let ivs = optional_f64_column(&df, "implied_vol")?;
    let types: Vec<Option<String>> = df
        .column("option_type")?
        .str()?
        .into_iter()
        .map(|s| s.map(str::to_string))
        .collect();

    let mut quotes = Vec::with_capacity(df.height());
    for idx in 0..df.height() {
        let option_type = types[idx]
            .as_deref()
            .and_then(OptionType::parse)
            .ok_or_else(|| {
                DataError::InvalidData(format!("bad option_type in row {}", idx))
            })?;
        let (Some(strike), Some(price)) = (strikes[idx], prices[idx]) else {
            return Err(DataError::InvalidData(format!(
                "missing strike or price in row {}",
                idx
            )));
        };

        quotes.push(ChainQuote {
            trade_date: trade_dates[idx],
            expiry: expiries[idx],
            strike: to_decimal(strike)?,
            option_type,
            price: to_decimal(price)?,
            implied_vol: ivs.as_ref().and_then(|v| v[idx]),
        });
    }

    Ok(quotes)
}

fn scan(path: &Path) -> Result<LazyFrame, DataError> {
    if !path.exists() {
        return Err(DataError::FileNotFound(path.display().to_string()));
    }

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase());

    match ext.as_deref() {
        Some("parquet") => Ok(LazyFrame::scan_parquet(path, ScanArgsParquet::default())?),
        Some("csv") => Ok(LazyCsvReader::new(path).with_has_header(true).finish()?),
        _ => Err(DataError::InvalidData(format!(
            "unsupported file type: {}",
            path.display()
        ))),
    }
}

fn check_columns(schema: &Schema, required: &[&str], path: &Path) -> Result<(), DataError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|name| schema.get(name).is_none())
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DataError::InvalidData(format!(
            "{} is missing columns: {}",
            path.display(),
            missing.join(", ")
        )))
    }
}

fn date_column(df: &DataFrame, name: &str) -> Result<Vec<NaiveDate>, DataError> {
    df.column(name)?
        .str()?
        .into_iter()
        .enumerate()
        .map(|(idx, s)| {
            s.and_then(|s| NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok())
                .ok_or_else(|| DataError::InvalidData(format!("bad {} in row {}", name, idx)))
        })
        .collect()
}

fn f64_column(df: &DataFrame, name: &str) -> Result<Vec<Option<f64>>, DataError> {
    Ok(df.column(name)?.f64()?.into_iter().collect())
}

fn optional_f64_column(df: &DataFrame, name: &str) -> Result<Option<Vec<Option<f64>>>, DataError> {
    match df.column(name) {
        Ok(c) => Ok(Some(c.f64()?.into_iter().collect())),
        Err(_) => Ok(None),
    }
}

fn to_decimal(value: f64) -> Result<Decimal, DataError> {
    Decimal::from_f64(value)
        .map(|d| d.round_dp(6).normalize())
        .ok_or_else(|| DataError::InvalidData(format!("not a finite number: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::MarketDataProvider;
    use rust_decimal_macros::dec;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_load_csv_series() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(
            &dir,
            "nifty.csv",
            "date,open,high,low,close,volume,historical_volatility\n\
             2024-01-03,21600,21650,21550,21620.5,1000,0.16\n\
             2024-01-02,21500,21580,21480,21550,900,0.15\n",
        );

        let bars = SeriesLoader::new(&path).load_bars().unwrap();
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(bars[0].close, dec!(21550));
        assert_eq!(bars[1].close, dec!(21620.5));
        assert_eq!(bars[1].volume, 1000);
        assert_eq!(bars[1].historical_volatility, Some(0.16));
    }

    #[test]
    fn test_optional_columns_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "spot.csv", "date,close\n2024-01-02,21500\n");

        let bars = SeriesLoader::new(&path).load_bars().unwrap();
        assert_eq!(bars[0].open, dec!(21500));
        assert_eq!(bars[0].volume, 0);
        assert_eq!(bars[0].historical_volatility, None);
    }

    #[test]
    fn test_load_with_quotes() {
        let dir = tempfile::tempdir().unwrap();
        let spot = write_file(
            &dir,
            "spot.csv",
            "date,close,historical_volatility\n2024-01-02,21500,0.15\n",
        );
        let quotes = write_file(
            &dir,
            "quotes.csv",
            "trade_date,expiry,strike,option_type,price,implied_vol\n\
             2024-01-02,2024-01-25,21500,CE,320.5,0.14\n\
             2024-01-02,2024-01-25,21500,PE,280,\n",
        );

        let provider = SeriesLoader::new(&spot).with_quotes(&quotes).load().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let expiry = NaiveDate::from_ymd_opt(2024, 1, 25).unwrap();

        let call = provider
            .quote(day, dec!(21500), OptionType::Call, expiry)
            .unwrap();
        assert_eq!(call.price, dec!(320.5));
        assert_eq!(call.implied_vol, Some(0.14));

        let put = provider.quote(day, dec!(21500), OptionType::Put, expiry).unwrap();
        assert_eq!(put.implied_vol, None);
        assert_eq!(provider.get_volatility(day).unwrap(), 0.15);
    }

    #[test]
    fn test_missing_file_and_columns() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.csv");
        assert!(matches!(
            SeriesLoader::new(&missing).load_bars(),
            Err(DataError::FileNotFound(_))
        ));

        let path = write_file(&dir, "bad.csv", "date,open\n2024-01-02,1\n");
        assert!(matches!(
            SeriesLoader::new(&path).load_bars(),
            Err(DataError::InvalidData(msg)) if msg.contains("close")
        ));

        let txt = write_file(&dir, "spot.txt", "date,close\n");
        assert!(matches!(
            SeriesLoader::new(&txt).load_bars(),
            Err(DataError::InvalidData(_))
        ));
    }
}
