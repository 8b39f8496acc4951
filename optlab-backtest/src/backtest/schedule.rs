//! Entry cadence tracking.
//!
//! A cadence period (the start date, a day, an ISO week or a month) allows one
//! entry. The period stays eligible until an entry actually succeeds, so a
//! skipped first trading day passes the entry to the next one.

use chrono::{Datelike, NaiveDate};

use super::config::EntryCadence;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Period {
    Start,
    Day(NaiveDate),
    Week(i32, u32),
    Month(i32, u32),
}

#[derive(Debug, Clone)]
pub struct EntrySchedule {
    cadence: EntryCadence,
    start: NaiveDate,
    last_entered: Option<Period>,
}

impl EntrySchedule {
    pub fn new(cadence: EntryCadence, start: NaiveDate) -> Self {
        Self {
            cadence,
            start,
            last_entered: None,
        }
    }

    fn period(&self, date: NaiveDate) -> Option<Period> {
        match self.cadence {
            EntryCadence::OnDate => (date == self.start).then_some(Period::Start),
            EntryCadence::Daily => Some(Period::Day(date)),
            EntryCadence::Weekly => {
                let week = date.iso_week();
                Some(Period::Week(week.year(), week.week()))
            }
            EntryCadence::Monthly => Some(Period::Month(date.year(), date.month())),
        }
    }

    /// Whether `date` may open a trade.
    pub fn is_due(&self, date: NaiveDate) -> bool {
        match self.period(date) {
            Some(period) => self.last_entered != Some(period),
            None => false,
        }
    }

    /// Record a successful entry on `date`.
    pub fn mark_entered(&mut self, date: NaiveDate) {
        if let Some(period) = self.period(date) {
            self.last_entered = Some(period);
        }
    }
}
