//! Black-Scholes-Merton pricing for European options.
//!
//! Produces theoretical prices and Greeks from spot, strike, time to expiry
//! and volatility. Greek units:
//! - Theta: per calendar day
//! - Vega: per 1 volatility point
//! - Rho: per 1 rate point
//!
//! Degenerate inputs have closed-form limits instead of NaNs:
//! - `time == 0`: intrinsic value, delta in {-1, 0, 1} (at-the-money is 0)
//! - `vol == 0`: discounted intrinsic against the forward

use std::f64::consts::{PI, SQRT_2};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use statrs::function::erf::erfc;
use thiserror::Error;

use crate::data::{Greeks, OptionType};

/// Day count used for time to expiry.
pub const DAYS_PER_YEAR: f64 = 365.0;

/// Below this `vol * sqrt(t)` the zero-volatility limit is used.
const MIN_TOTAL_VOL: f64 = 1e-12;

const MIN_IMPLIED_VOL: f64 = 1e-4;
const MAX_IMPLIED_VOL: f64 = 5.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PricingError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Theoretical value and sensitivities of one option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionPricing {
    pub price: f64,
    pub greeks: Greeks,
}

/// Black-Scholes calculator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlackScholes {
    /// Risk-free interest rate (annual, continuous).
    pub rate: f64,
    /// Dividend yield (annual, continuous).
    #[serde(default)]
    pub dividend: f64,
}

impl Default for BlackScholes {
    fn default() -> Self {
        Self {
            rate: 0.065,
            dividend: 0.0,
        }
    }
}

impl BlackScholes {
    pub fn new(rate: f64, dividend: f64) -> Self {
        Self { rate, dividend }
    }

    /// Price an option and compute all Greeks.
    pub fn price(
        &self,
        spot: f64,
        strike: f64,
        time: f64,
        vol: f64,
        opt_type: OptionType,
    ) -> Result<OptionPricing, PricingError> {
        self.validate(spot, strike, time, vol)?;

        if time == 0.0 {
            return Ok(Self::at_expiry(spot, strike, opt_type));
        }

        let total_vol = vol * time.sqrt();
        if total_vol < MIN_TOTAL_VOL {
            return Ok(self.zero_volatility(spot, strike, time, opt_type));
        }

        let d1 = self.d1(spot, strike, time, vol);
        let d2 = d1 - total_vol;
        let discount_d = (-self.dividend * time).exp();
        let discount_r = (-self.rate * time).exp();
        let pdf_d1 = norm_pdf(d1);

        let gamma = discount_d * pdf_d1 / (spot * total_vol);
        let vega = spot * discount_d * pdf_d1 * time.sqrt() / 100.0;
        let decay = -spot * discount_d * pdf_d1 * vol / (2.0 * time.sqrt());

        let (price, delta, theta, rho) = match opt_type {
            OptionType::Call => {
                let nd1 = norm_cdf(d1);
                let nd2 = norm_cdf(d2);
                let price = spot * discount_d * nd1 - strike * discount_r * nd2;
                let theta = (decay + self.dividend * spot * discount_d * nd1
                    - self.rate * strike * discount_r * nd2)
                    / DAYS_PER_YEAR;
                let rho = strike * time * discount_r * nd2 / 100.0;
                (price, discount_d * nd1, theta, rho)
            }
            OptionType::Put => {
                let nmd1 = norm_cdf(-d1);
                let nmd2 = norm_cdf(-d2);
                let price = strike * discount_r * nmd2 - spot * discount_d * nmd1;
                let theta = (decay - self.dividend * spot * discount_d * nmd1
                    + self.rate * strike * discount_r * nmd2)
                    / DAYS_PER_YEAR;
                let rho = -strike * time * discount_r * nmd2 / 100.0;
                (price, -discount_d * nmd1, theta, rho)
            }
        };

        Ok(OptionPricing {
            price: price.max(0.0),
            greeks: Greeks {
                delta: delta.clamp(-1.0, 1.0),
                gamma,
                theta,
                vega,
                rho,
            },
        })
    }

    /// Solve for the volatility that reproduces `price`.
    ///
    /// Newton-Raphson on vega, falling back to bisection whenever a Newton
    /// step would leave the current bracket.
    pub fn implied_vol(
        &self,
        spot: f64,
        strike: f64,
        time: f64,
        price: f64,
        opt_type: OptionType,
    ) -> Option<f64> {
        if !(time > 0.0 && price > 0.0 && spot > 0.0 && strike > 0.0) {
            return None;
        }

        let value = |vol: f64| {
            self.price(spot, strike, time, vol, opt_type)
                .ok()
                .map(|p| p.price)
        };

        let tolerance = 1e-6;
        let mut lo = MIN_IMPLIED_VOL;
        let mut hi = MAX_IMPLIED_VOL;
        if price < value(lo)? - tolerance || price > value(hi)? + tolerance {
            return None;
        }

        // Brenner-Subrahmanyam starting point
        let mut vol = ((price / spot) * (2.0 * PI / time).sqrt()).clamp(lo, hi);

        for _ in 0..100 {
            let diff = value(vol)? - price;
            if diff.abs() < tolerance {
                return Some(vol);
            }
            if diff > 0.0 {
                hi = vol;
            } else {
                lo = vol;
            }

            let vega = self.raw_vega(spot, strike, time, vol);
            let next = vol - diff / vega;
            vol = if vega > 1e-10 && next.is_finite() && next > lo && next < hi {
                next
            } else {
                0.5 * (lo + hi)
            };
        }

        None
    }

    fn validate(&self, spot: f64, strike: f64, time: f64, vol: f64) -> Result<(), PricingError> {
        if !(spot.is_finite() && spot > 0.0) {
            return Err(PricingError::InvalidInput(format!(
                "spot must be positive and finite, got {}",
                spot
            )));
        }
        if !(strike.is_finite() && strike > 0.0) {
            return Err(PricingError::InvalidInput(format!(
                "strike must be positive and finite, got {}",
                strike
            )));
        }
        if !(time.is_finite() && time >= 0.0) {
            return Err(PricingError::InvalidInput(format!(
                "time to expiry must be non-negative, got {}",
                time
            )));
        }
        if !(vol.is_finite() && vol >= 0.0) {
            return Err(PricingError::InvalidInput(format!(
                "volatility must be non-negative, got {}",
                vol
            )));
        }
        if !(self.rate.is_finite() && self.dividend.is_finite()) {
            return Err(PricingError::InvalidInput(
                "rate and dividend yield must be finite".to_string(),
            ));
        }
        Ok(())
    }

    fn d1(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        let numerator =
            (spot / strike).ln() + (self.rate - self.dividend + 0.5 * vol * vol) * time;
        numerator / (vol * time.sqrt())
    }

    /// Vega per unit of volatility (not scaled), for the IV solver.
    fn raw_vega(&self, spot: f64, strike: f64, time: f64, vol: f64) -> f64 {
        spot * (-self.dividend * time).exp()
            * norm_pdf(self.d1(spot, strike, time, vol))
            * time.sqrt()
    }

    fn at_expiry(spot: f64, strike: f64, opt_type: OptionType) -> OptionPricing {
        let delta = match opt_type {
            OptionType::Call if spot > strike => 1.0,
            OptionType::Put if spot < strike => -1.0,
            _ => 0.0,
        };
        OptionPricing {
            price: intrinsic_value(spot, strike, opt_type),
            greeks: Greeks {
                delta,
                ..Greeks::default()
            },
        }
    }

    fn zero_volatility(&self, spot: f64, strike: f64, time: f64, opt_type: OptionType) -> OptionPricing {
        let discount_d = (-self.dividend * time).exp();
        let discount_r = (-self.rate * time).exp();
        let pv_spot = spot * discount_d;
        let pv_strike = strike * discount_r;
        let mut greeks = Greeks::default();

        let price = match opt_type {
            OptionType::Call if pv_spot > pv_strike => {
                greeks.delta = discount_d;
                greeks.theta =
                    (self.dividend * pv_spot - self.rate * pv_strike) / DAYS_PER_YEAR;
                greeks.rho = strike * time * discount_r / 100.0;
                pv_spot - pv_strike
            }
            OptionType::Put if pv_strike > pv_spot => {
                greeks.delta = -discount_d;
                greeks.theta =
                    (self.rate * pv_strike - self.dividend * pv_spot) / DAYS_PER_YEAR;
                greeks.rho = -strike * time * discount_r / 100.0;
                pv_strike - pv_spot
            }
            _ => 0.0,
        };

        OptionPricing { price, greeks }
    }
}

/// Intrinsic value of an option at the given spot.
pub fn intrinsic_value(spot: f64, strike: f64, opt_type: OptionType) -> f64 {
    match opt_type {
        OptionType::Call => (spot - strike).max(0.0),
        OptionType::Put => (strike - spot).max(0.0),
    }
}

/// Time to expiry in years, 365-day convention, floored at zero.
pub fn time_to_expiry(from: NaiveDate, expiry: NaiveDate) -> f64 {
    let days = (expiry - from).num_days();
    days.max(0) as f64 / DAYS_PER_YEAR
}

/// Standard normal CDF via erfc, accurate in both tails.
pub fn norm_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

/// Standard normal PDF.
pub fn norm_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}
