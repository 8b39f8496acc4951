//! Expiry calendar.
//!
//! Resolves the sequence of future expiries from any date, used to give
//! each strategy leg an absolute expiry from its expiry offset.

pub mod expiry;

pub use expiry::{last_weekday_of_month, ExpiryCalendar, ExpiryCycle};
