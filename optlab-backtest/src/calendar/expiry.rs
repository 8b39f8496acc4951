//! Expiry date resolution.
//!
//! Expiries follow an exchange convention (a weekday each week, or the last
//! such weekday of each month). An expiry landing on a weekend or holiday
//! moves to the previous business day.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// Expiry convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cycle", rename_all = "snake_case")]
pub enum ExpiryCycle {
    /// Every week on `weekday`.
    Weekly { weekday: Weekday },
    /// Last `weekday` of every month.
    Monthly { weekday: Weekday },
}

impl ExpiryCycle {
    /// Weekly Tuesday expiries, the current NIFTY weekly convention.
    pub fn weekly() -> Self {
        Self::Weekly {
            weekday: Weekday::Tue,
        }
    }

    /// Monthly last-Thursday expiries.
    pub fn monthly() -> Self {
        Self::Monthly {
            weekday: Weekday::Thu,
        }
    }
}

impl Default for ExpiryCycle {
    fn default() -> Self {
        Self::monthly()
    }
}

/// Expiry calendar for one market.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryCalendar {
    #[serde(flatten)]
    pub cycle: ExpiryCycle,
    /// Exchange holidays
    #[serde(default)]
    pub holidays: BTreeSet<NaiveDate>,
}

impl ExpiryCalendar {
    pub fn new(cycle: ExpiryCycle) -> Self {
        Self {
            cycle,
            holidays: BTreeSet::new(),
        }
    }

    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays.extend(holidays);
        self
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// The next `count` expiries strictly after `as_of`, in increasing order.
    pub fn next_expiries(&self, as_of: NaiveDate, count: usize) -> Vec<NaiveDate> {
        let mut expiries = Vec::with_capacity(count);
        let mut raw = self.first_candidate(as_of);
        // Each candidate yields at most one expiry; the bound only guards
        // against a calendar made entirely of holidays.
        let mut remaining = count.saturating_mul(8).saturating_add(16);

        while expiries.len() < count && remaining > 0 {
            let Some(candidate) = raw else { break };
            remaining -= 1;

            if let Some(expiry) = self.roll_back(candidate) {
                let after_previous = expiries.last().map_or(true, |last| expiry > *last);
                if expiry > as_of && after_previous {
                    expiries.push(expiry);
                }
            }
            raw = self.next_candidate(candidate);
        }

        expiries
    }

    /// The expiry at `offset` in the sorted future expiries (0 = nearest).
    pub fn resolve_offset(&self, as_of: NaiveDate, offset: usize) -> Option<NaiveDate> {
        self.next_expiries(as_of, offset.saturating_add(1))
            .get(offset)
            .copied()
    }

    /// First unadjusted expiry on or after the start of `as_of`'s cycle.
    fn first_candidate(&self, as_of: NaiveDate) -> Option<NaiveDate> {
        match self.cycle {
            ExpiryCycle::Weekly { weekday } => {
                let ahead = (7 + weekday.num_days_from_monday()
                    - as_of.weekday().num_days_from_monday())
                    % 7;
                as_of.checked_add_days(Days::new(u64::from(ahead)))
            }
            ExpiryCycle::Monthly { weekday } => {
                last_weekday_of_month(as_of.year(), as_of.month(), weekday)
            }
        }
    }

    fn next_candidate(&self, raw: NaiveDate) -> Option<NaiveDate> {
        match self.cycle {
            ExpiryCycle::Weekly { .. } => raw.checked_add_days(Days::new(7)),
            ExpiryCycle::Monthly { weekday } => {
                let next = raw.with_day(1)?.checked_add_months(Months::new(1))?;
                last_weekday_of_month(next.year(), next.month(), weekday)
            }
        }
    }

    fn roll_back(&self, mut date: NaiveDate) -> Option<NaiveDate> {
        while !self.is_business_day(date) {
            date = date.pred_opt()?;
        }
        Some(date)
    }
}

/// Last `weekday` of the given month.
pub fn last_weekday_of_month(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let last = first.checked_add_months(Months::new(1))?.pred_opt()?;
    let back = (7 + last.weekday().num_days_from_monday() - weekday.num_days_from_monday()) % 7;
    last.checked_sub_days(Days::new(u64::from(back)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_last_weekday_of_month() {
        assert_eq!(last_weekday_of_month(2024, 1, Weekday::Thu), Some(date(2024, 1, 25)));
        assert_eq!(last_weekday_of_month(2024, 2, Weekday::Thu), Some(date(2024, 2, 29)));
        assert_eq!(last_weekday_of_month(2024, 12, Weekday::Tue), Some(date(2024, 12, 31)));
    }

    #[test]
    fn test_weekly_expiries() {
        let cal = ExpiryCalendar::new(ExpiryCycle::weekly());
        assert_eq!(
            cal.next_expiries(date(2024, 1, 1), 3),
            vec![date(2024, 1, 2), date(2024, 1, 9), date(2024, 1, 16)]
        );
        // An expiry day is not its own next expiry
        assert_eq!(cal.next_expiries(date(2024, 1, 2), 1), vec![date(2024, 1, 9)]);
    }

    #[test]
    fn test_monthly_expiries() {
        let cal = ExpiryCalendar::default();
        assert_eq!(
            cal.next_expiries(date(2024, 1, 1), 3),
            vec![date(2024, 1, 25), date(2024, 2, 29), date(2024, 3, 28)]
        );
        // After the monthly expiry, the nearest is next month's
        assert_eq!(cal.resolve_offset(date(2024, 1, 25), 0), Some(date(2024, 2, 29)));
        assert_eq!(cal.resolve_offset(date(2024, 1, 10), 1), Some(date(2024, 2, 29)));
    }

    #[test]
    fn test_holiday_rolls_back() {
        let cal = ExpiryCalendar::default().with_holidays([date(2024, 1, 25)]);
        assert_eq!(cal.resolve_offset(date(2024, 1, 2), 0), Some(date(2024, 1, 24)));

        // Rolled-back expiry already passed: skip to the next cycle
        assert_eq!(cal.resolve_offset(date(2024, 1, 24), 0), Some(date(2024, 2, 29)));
    }

    #[test]
    fn test_weekend_expiry_rolls_to_friday() {
        let cal = ExpiryCalendar::new(ExpiryCycle::Weekly {
            weekday: Weekday::Sat,
        });
        assert_eq!(cal.resolve_offset(date(2024, 1, 1), 0), Some(date(2024, 1, 5)));
    }

    #[test]
    fn test_expiries_strictly_after_as_of() {
        let calendars = [
            ExpiryCalendar::new(ExpiryCycle::weekly()),
            ExpiryCalendar::default().with_holidays([date(2024, 3, 28), date(2024, 3, 27)]),
        ];
        for cal in &calendars {
            let mut as_of = date(2024, 1, 1);
            while as_of <= date(2024, 12, 31) {
                let expiries = cal.next_expiries(as_of, 4);
                assert_eq!(expiries.len(), 4);
                assert!(expiries[0] > as_of);
                assert!(expiries.windows(2).all(|w| w[0] < w[1]));
                for (i, e) in expiries.iter().enumerate() {
                    assert_eq!(cal.resolve_offset(as_of, i), Some(*e));
                }
                as_of = as_of.succ_opt().unwrap();
            }
        }
    }

    #[test]
    fn test_calendar_from_toml() {
        let cal: ExpiryCalendar = toml::from_str(
            r#"
            cycle = "weekly"
            weekday = "Thu"
            holidays = ["2024-01-25"]
            "#,
        )
        .unwrap();
        assert_eq!(cal.cycle, ExpiryCycle::Weekly { weekday: Weekday::Thu });
        assert!(!cal.is_business_day(date(2024, 1, 25)));
    }
}
