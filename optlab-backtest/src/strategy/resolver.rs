//! Strategy instantiation.
//!
//! Turns a template into concrete legs for one evaluation date:
//! - strike: spot plus offset, rounded to the strike step
//! - expiry: resolved per leg from the expiry calendar
//! - price: chain quote when available, otherwise Black-Scholes

use chrono::NaiveDate;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::calendar::ExpiryCalendar;
use crate::config::EngineSettings;
use crate::data::{Greeks, OptionType, QuoteSource};
use crate::pricing::{time_to_expiry, BlackScholes, PricingError};

use super::template::{Action, StrategyTemplate};

#[derive(Error, Debug)]
pub enum StrategyError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Missing market data for {0}")]
    MissingMarketData(NaiveDate),

    #[error("Pricing error: {0}")]
    Pricing(#[from] PricingError),
}

/// Market state for one evaluation date.
#[derive(Clone, Copy)]
pub struct MarketContext<'a> {
    pub date: NaiveDate,
    pub spot: Option<Decimal>,
    pub volatility: Option<f64>,
    pub calendar: &'a ExpiryCalendar,
    pub quotes: Option<&'a dyn QuoteSource>,
}

impl<'a> MarketContext<'a> {
    pub fn new(date: NaiveDate, calendar: &'a ExpiryCalendar) -> Self {
        Self {
            date,
            spot: None,
            volatility: None,
            calendar,
            quotes: None,
        }
    }

    pub fn with_spot(mut self, spot: Decimal) -> Self {
        self.spot = Some(spot);
        self
    }

    pub fn with_volatility(mut self, vol: f64) -> Self {
        self.volatility = Some(vol);
        self
    }

    pub fn with_quotes(mut self, quotes: Option<&'a dyn QuoteSource>) -> Self {
        self.quotes = quotes;
        self
    }

    fn require_spot(&self) -> Result<Decimal, StrategyError> {
        let spot = self.spot.ok_or(StrategyError::MissingMarketData(self.date))?;
        if spot <= Decimal::ZERO {
            return Err(StrategyError::InvalidInput(format!(
                "spot must be positive, got {} on {}",
                spot, self.date
            )));
        }
        Ok(spot)
    }

    fn require_volatility(&self) -> Result<f64, StrategyError> {
        self.volatility
            .ok_or(StrategyError::MissingMarketData(self.date))
    }
}

/// A leg with an absolute strike, expiry and entry price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcreteLeg {
    pub leg_order: u32,
    pub action: Action,
    pub option_type: OptionType,
    pub strike: Decimal,
    pub expiry: NaiveDate,
    pub quantity: u32,
    pub price: Decimal,
    /// Volatility behind `price` (model input, or implied from a quote).
    pub volatility: f64,
    pub greeks: Greeks,
}

/// Resolves templates and reprices open legs.
#[derive(Debug, Clone)]
pub struct StrategyResolver {
    pricer: BlackScholes,
    strike_step: Decimal,
    price_precision: u32,
}

impl StrategyResolver {
    pub fn new(pricer: BlackScholes, strike_step: Decimal, price_precision: u32) -> Self {
        Self {
            pricer,
            strike_step,
            price_precision,
        }
    }

    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self::new(
            settings.pricer(),
            settings.strike_step,
            settings.price_precision,
        )
    }

    pub fn pricer(&self) -> &BlackScholes {
        &self.pricer
    }

    /// Concrete legs for `template` on `ctx.date`, ordered by leg order.
    pub fn instantiate(
        &self,
        template: &StrategyTemplate,
        ctx: &MarketContext<'_>,
    ) -> Result<Vec<ConcreteLeg>, StrategyError> {
        template.validate()?;
        let spot = ctx.require_spot()?;
        let vol = ctx.require_volatility()?;
        let spot_f = to_f64(spot)?;

        let mut legs = Vec::with_capacity(template.legs.len());
        for leg in template.ordered_legs() {
            let strike = round_to_step(spot + Decimal::from(leg.strike_offset), self.strike_step);
            if strike <= Decimal::ZERO {
                return Err(StrategyError::InvalidInput(format!(
                    "leg {} resolves to non-positive strike {}",
                    leg.leg_order, strike
                )));
            }

            let expiry = ctx
                .calendar
                .resolve_offset(ctx.date, leg.expiry_offset as usize)
                .ok_or_else(|| {
                    StrategyError::InvalidInput(format!(
                        "no expiry at offset {} after {}",
                        leg.expiry_offset, ctx.date
                    ))
                })?;

            let strike_f = to_f64(strike)?;
            let t = time_to_expiry(ctx.date, expiry);

            let quote = ctx
                .quotes
                .and_then(|q| q.quote(ctx.date, strike, leg.option_type, expiry));

            let (price, volatility, greeks) = match quote {
                Some(q) => {
                    let observed = to_f64(q.price)?;
                    let iv = q
                        .implied_vol
                        .filter(|v| v.is_finite() && *v >= 0.0)
                        .or_else(|| {
                            self.pricer
                                .implied_vol(spot_f, strike_f, t, observed, leg.option_type)
                        })
                        .unwrap_or(vol);
                    let model = self.pricer.price(spot_f, strike_f, t, iv, leg.option_type)?;
                    (q.price, iv, model.greeks)
                }
                None => {
                    let model = self.pricer.price(spot_f, strike_f, t, vol, leg.option_type)?;
                    (self.to_price(model.price)?, vol, model.greeks)
                }
            };

            legs.push(ConcreteLeg {
                leg_order: leg.leg_order,
                action: leg.action,
                option_type: leg.option_type,
                strike,
                expiry,
                quantity: leg.quantity,
                price,
                volatility,
                greeks,
            });
        }

        Ok(legs)
    }

    /// Current value of an existing contract.
    ///
    /// Settles at intrinsic on or after expiry. Before expiry a chain quote
    /// wins over the model price.
    pub fn mark(
        &self,
        ctx: &MarketContext<'_>,
        option_type: OptionType,
        strike: Decimal,
        expiry: NaiveDate,
    ) -> Result<Decimal, StrategyError> {
        let spot = ctx.require_spot()?;

        if ctx.date >= expiry {
            let intrinsic = match option_type {
                OptionType::Call => (spot - strike).max(Decimal::ZERO),
                OptionType::Put => (strike - spot).max(Decimal::ZERO),
            };
            return Ok(intrinsic);
        }

        if let Some(q) = ctx
            .quotes
            .and_then(|q| q.quote(ctx.date, strike, option_type, expiry))
        {
            return Ok(q.price);
        }

        let vol = ctx.require_volatility()?;
        let t = time_to_expiry(ctx.date, expiry);
        let model = self
            .pricer
            .price(to_f64(spot)?, to_f64(strike)?, t, vol, option_type)?;
        self.to_price(model.price)
    }

    fn to_price(&self, value: f64) -> Result<Decimal, StrategyError> {
        Decimal::from_f64(value)
            .map(|d| {
                d.round_dp_with_strategy(self.price_precision, RoundingStrategy::MidpointAwayFromZero)
            })
            .ok_or_else(|| StrategyError::InvalidInput(format!("unrepresentable price {}", value)))
    }
}

/// Round `value` to the nearest multiple of `step`, halves away from zero.
pub fn round_to_step(value: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return value;
    }
    (value / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * step
}

fn to_f64(value: Decimal) -> Result<f64, StrategyError> {
    value
        .to_f64()
        .ok_or_else(|| StrategyError::InvalidInput(format!("not representable as f64: {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::ExpiryCycle;
    use crate::data::{ChainQuote, InMemoryProvider, MarketDataProvider};
    use crate::strategy::{LegTemplate, StrategyKind};
    use approx::assert_relative_eq;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn resolver() -> StrategyResolver {
        StrategyResolver::from_settings(&EngineSettings::default())
    }

    #[test]
    fn test_round_to_step() {
        assert_eq!(round_to_step(dec!(21524), dec!(50)), dec!(21500));
        assert_eq!(round_to_step(dec!(21525), dec!(50)), dec!(21550));
        assert_eq!(round_to_step(dec!(21576.4), dec!(50)), dec!(21600));
        assert_eq!(round_to_step(dec!(-75), dec!(50)), dec!(-100));
        assert_eq!(round_to_step(dec!(123.45), Decimal::ZERO), dec!(123.45));
    }

    #[test]
    fn test_instantiate_straddle() {
        let calendar = ExpiryCalendar::default();
        let template = StrategyTemplate::preset(StrategyKind::LongStraddle, 0).unwrap();
        let ctx = MarketContext::new(date(2024, 1, 1), &calendar)
            .with_spot(dec!(21530))
            .with_volatility(0.15);

        let legs = resolver().instantiate(&template, &ctx).unwrap();
        assert_eq!(legs.len(), 2);
        for leg in &legs {
            assert_eq!(leg.strike, dec!(21550));
            assert_eq!(leg.expiry, date(2024, 1, 25));
            assert_eq!(leg.action, Action::Buy);
            assert!(leg.price > Decimal::ZERO);
            assert_eq!(leg.price, leg.price.round_dp(2));
            assert_eq!(leg.volatility, 0.15);
        }
        assert!(legs[0].greeks.delta > 0.0);
        assert!(legs[1].greeks.delta < 0.0);
    }

    #[test]
    fn test_expiry_resolved_per_leg() {
        let calendar = ExpiryCalendar::new(ExpiryCycle::weekly());
        let template = StrategyTemplate::preset(StrategyKind::LongDiagonalSpread, 100).unwrap();
        let ctx = MarketContext::new(date(2024, 1, 1), &calendar)
            .with_spot(dec!(21500))
            .with_volatility(0.15);

        let legs = resolver().instantiate(&template, &ctx).unwrap();
        assert_eq!(legs[0].expiry, date(2024, 1, 2));
        assert_eq!(legs[0].strike, dec!(21600));
        assert_eq!(legs[1].expiry, date(2024, 1, 9));
        assert_eq!(legs[1].strike, dec!(21500));
    }

    #[test]
    fn test_missing_market_data() {
        let calendar = ExpiryCalendar::default();
        let template = StrategyTemplate::preset(StrategyKind::ShortStraddle, 0).unwrap();
        let day = date(2024, 1, 3);

        let no_vol = MarketContext::new(day, &calendar).with_spot(dec!(21500));
        assert!(matches!(
            resolver().instantiate(&template, &no_vol),
            Err(StrategyError::MissingMarketData(d)) if d == day
        ));

        let no_spot = MarketContext::new(day, &calendar).with_volatility(0.2);
        assert!(matches!(
            resolver().instantiate(&template, &no_spot),
            Err(StrategyError::MissingMarketData(_))
        ));
    }

    #[test]
    fn test_invalid_strike() {
        let calendar = ExpiryCalendar::default();
        let template = StrategyTemplate::new(
            "deep put",
            StrategyKind::Custom,
            vec![LegTemplate::buy(OptionType::Put, -30000)],
        );
        let ctx = MarketContext::new(date(2024, 1, 3), &calendar)
            .with_spot(dec!(21500))
            .with_volatility(0.15);
        assert!(matches!(
            resolver().instantiate(&template, &ctx),
            Err(StrategyError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_quote_overrides_model() {
        let calendar = ExpiryCalendar::default();
        let mut provider = InMemoryProvider::new();
        provider.insert_quote(ChainQuote {
            trade_date: date(2024, 1, 1),
            expiry: date(2024, 1, 25),
            strike: dec!(21500),
            option_type: OptionType::Call,
            price: dec!(400),
            implied_vol: None,
        });

        let template = StrategyTemplate::new(
            "call",
            StrategyKind::Custom,
            vec![LegTemplate::buy(OptionType::Call, 0)],
        );
        let ctx = MarketContext::new(date(2024, 1, 1), &calendar)
            .with_spot(dec!(21500))
            .with_volatility(0.15)
            .with_quotes(provider.quote_source());

        let r = resolver();
        let legs = r.instantiate(&template, &ctx).unwrap();
        assert_eq!(legs[0].price, dec!(400));

        // Volatility is backed out of the quote
        let reprice = r
            .pricer()
            .price(21500.0, 21500.0, 24.0 / 365.0, legs[0].volatility, OptionType::Call)
            .unwrap();
        assert_relative_eq!(reprice.price, 400.0, epsilon = 1e-3);
    }

    #[test]
    fn test_mark_settles_at_intrinsic() {
        let calendar = ExpiryCalendar::default();
        let r = resolver();
        let expiry = date(2024, 1, 25);

        let at_expiry = MarketContext::new(expiry, &calendar).with_spot(dec!(22000));
        assert_eq!(
            r.mark(&at_expiry, OptionType::Call, dec!(21500), expiry).unwrap(),
            dec!(500)
        );
        assert_eq!(
            r.mark(&at_expiry, OptionType::Put, dec!(21500), expiry).unwrap(),
            Decimal::ZERO
        );

        // Before expiry the model needs volatility
        let before = MarketContext::new(date(2024, 1, 10), &calendar).with_spot(dec!(22000));
        assert!(r.mark(&before, OptionType::Call, dec!(21500), expiry).is_err());
        let price = r
            .mark(&before.with_volatility(0.15), OptionType::Call, dec!(21500), expiry)
            .unwrap();
        assert!(price > dec!(500));
    }
}
