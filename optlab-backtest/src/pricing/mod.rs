//! Option pricing.
//!
//! Black-Scholes-Merton valuation with Greeks and implied volatility.

pub mod black_scholes;

pub use black_scholes::{
    intrinsic_value, norm_cdf, norm_pdf, time_to_expiry, BlackScholes, OptionPricing,
    PricingError, DAYS_PER_YEAR,
};
