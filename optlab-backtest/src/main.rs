//! optlab-backtest CLI
//!
//! # Run a single backtest
//! optlab-backtest run --config runs/straddle.toml --data data/nifty.csv
//!
//! # Run several configurations in parallel over the same data
//! optlab-backtest batch --config runs/straddle.toml --config runs/condor.toml --data data/nifty.csv
//!
//! # Price a single option
//! optlab-backtest price --spot 21500 --strike 21600 --days 14 --vol 0.15 --option-type CE

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use optlab_backtest::backtest::BatchJob;
use optlab_backtest::pricing::DAYS_PER_YEAR;
use optlab_backtest::{
    run_batch, AppConfig, BacktestService, BacktestStatus, BlackScholes, EngineSettings,
    MarketDataProvider, OptionType, SeriesLoader,
};

#[derive(Parser)]
#[command(name = "optlab-backtest")]
#[command(about = "Multi-leg options strategy backtesting engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single backtest from a TOML run file
    Run {
        /// Path to run file
        #[arg(short, long)]
        config: PathBuf,

        /// Spot series (CSV or parquet)
        #[arg(short, long)]
        data: PathBuf,

        /// Option chain quotes (CSV or parquet)
        #[arg(short, long)]
        quotes: Option<PathBuf>,

        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run several backtests in parallel over the same data
    Batch {
        /// Paths to run files; their settings must match
        #[arg(short, long, required = true)]
        config: Vec<PathBuf>,

        /// Spot series (CSV or parquet)
        #[arg(short, long)]
        data: PathBuf,

        /// Option chain quotes (CSV or parquet)
        #[arg(short, long)]
        quotes: Option<PathBuf>,
    },

    /// Price one option with Black-Scholes
    Price {
        #[arg(long)]
        spot: f64,

        #[arg(long)]
        strike: f64,

        /// Calendar days to expiry
        #[arg(long)]
        days: f64,

        /// Annualised volatility (0.15 = 15%)
        #[arg(long)]
        vol: f64,

        /// CE or PE
        #[arg(long, default_value = "CE")]
        option_type: String,

        /// Risk-free rate, defaults to the engine setting
        #[arg(long)]
        rate: Option<f64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("optlab_backtest=info"));

    fmt().with_env_filter(filter).with_target(false).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            data,
            quotes,
            json,
        } => run(config, data, quotes, json).await,
        Commands::Batch {
            config,
            data,
            quotes,
        } => batch(config, data, quotes).await,
        Commands::Price {
            spot,
            strike,
            days,
            vol,
            option_type,
            rate,
        } => price(spot, strike, days, vol, &option_type, rate),
    }
}

fn load_provider(data: PathBuf, quotes: Option<PathBuf>) -> Result<Arc<dyn MarketDataProvider>> {
    let mut loader = SeriesLoader::new(&data);
    if let Some(path) = quotes {
        loader = loader.with_quotes(path);
    }
    let provider = loader
        .load()
        .with_context(|| format!("loading market data from {}", data.display()))?;
    Ok(Arc::new(provider))
}

async fn run(config: PathBuf, data: PathBuf, quotes: Option<PathBuf>, json: bool) -> Result<()> {
    let app = AppConfig::load(&config)
        .with_context(|| format!("reading run file {}", config.display()))?;
    let provider = load_provider(data, quotes)?;

    let service = BacktestService::new(app.settings, provider);
    let template = app
        .strategy
        .into_template()
        .context("building strategy template")?;
    let strategy = service.create_strategy(template)?;

    let mut backtest = app.backtest;
    backtest.strategy_id = strategy.id;
    let record = service.create_backtest(backtest)?;

    let handle = service
        .run_backtest(record.id)
        .ok_or_else(|| anyhow!("backtest {} is not pending", record.id))?;
    let record = handle.await.context("backtest task failed")?;

    if record.status != BacktestStatus::Completed {
        bail!(
            "backtest {} failed: {}",
            record.id,
            record.error_message.unwrap_or_default()
        );
    }

    let metrics = service
        .get_metrics(record.id)
        .ok_or_else(|| anyhow!("no metrics for backtest {}", record.id))?;

    if json {
        let output = serde_json::json!({
            "backtest": record,
            "strategy": strategy,
            "trades": service.get_trades(record.id),
            "metrics": metrics,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("{} ({} to {})", strategy.name, record.config.start_date, record.config.end_date);
        println!("{}", metrics.summary());
    }

    Ok(())
}

async fn batch(configs: Vec<PathBuf>, data: PathBuf, quotes: Option<PathBuf>) -> Result<()> {
    let mut apps = Vec::with_capacity(configs.len());
    for path in &configs {
        let app = AppConfig::load(path)
            .with_context(|| format!("reading run file {}", path.display()))?;
        apps.push(app);
    }
    let settings = AppConfig::shared_settings(&apps)?;

    let mut jobs = Vec::with_capacity(apps.len());
    for (app, path) in apps.into_iter().zip(&configs) {
        let template = app
            .strategy
            .into_template()
            .with_context(|| format!("building strategy from {}", path.display()))?;
        jobs.push(BatchJob {
            config: app.backtest,
            template,
        });
    }

    let provider = load_provider(data, quotes)?;

    info!("Loaded {} run files", jobs.len());
    let outcomes = tokio::task::spawn_blocking(move || run_batch(&settings, jobs, provider))
        .await
        .context("batch task failed")?;

    println!(
        "{:<28} {:>7} {:>9} {:>14} {:>10} {:>10}",
        "Backtest", "Trades", "Win %", "Total P&L", "Return %", "Max DD %"
    );
    for outcome in outcomes {
        match outcome.result {
            Ok(result) => {
                let m = &result.metrics;
                println!(
                    "{:<28} {:>7} {:>9.1} {:>14.2} {:>10.2} {:>10.2}",
                    outcome.name,
                    m.total_trades,
                    m.win_rate,
                    m.total_pnl,
                    m.total_return_pct,
                    m.max_drawdown_pct
                );
            }
            Err(e) => println!("{:<28} failed: {}", outcome.name, e),
        }
    }

    Ok(())
}

fn price(
    spot: f64,
    strike: f64,
    days: f64,
    vol: f64,
    option_type: &str,
    rate: Option<f64>,
) -> Result<()> {
    let option_type = OptionType::parse(option_type)
        .ok_or_else(|| anyhow!("unknown option type {:?}, expected CE or PE", option_type))?;
    let settings = EngineSettings::default();
    let pricer = BlackScholes::new(
        rate.unwrap_or(settings.risk_free_rate),
        settings.dividend_yield,
    );

    let result = pricer.price(spot, strike, days / DAYS_PER_YEAR, vol, option_type)?;

    println!(
        "{} {} @ {} ({} days, vol {:.2}%)",
        option_type.as_str(),
        strike,
        spot,
        days,
        vol * 100.0
    );
    println!("  Price: {:.4}", result.price);
    println!("  Delta: {:.4}", result.greeks.delta);
    println!("  Gamma: {:.6}", result.greeks.gamma);
    println!("  Theta: {:.4}", result.greeks.theta);
    println!("  Vega:  {:.4}", result.greeks.vega);
    println!("  Rho:   {:.4}", result.greeks.rho);

    Ok(())
}
