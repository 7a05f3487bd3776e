//! `MMYYYY` tax-period labels and the calendar arithmetic on them.

use chrono::{Datelike, NaiveDate};
use std::fmt;

/// A tax period as the portal labels it: the month it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaxPeriod {
    year: i32,
    month: u32,
}

impl TaxPeriod {
    pub fn new(month: u32, year: i32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Some(Self { year, month })
        } else {
            None
        }
    }

    /// Parses `MMYYYY`; anything else is `None`.
    pub fn parse(label: &str) -> Option<Self> {
        let label = label.trim();
        if label.len() != 6 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let month = label[..2].parse().ok()?;
        let year = label[2..].parse().ok()?;
        Self::new(month, year)
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn label(&self) -> String {
        format!("{:02}{:04}", self.month, self.year)
    }

    fn index(&self) -> i64 {
        i64::from(self.year) * 12 + i64::from(self.month) - 1
    }

    fn from_index(idx: i64) -> Self {
        Self {
            year: idx.div_euclid(12) as i32,
            month: idx.rem_euclid(12) as u32 + 1,
        }
    }

    pub fn add_months(&self, n: i64) -> Self {
        Self::from_index(self.index() + n)
    }

    pub fn add_years(&self, n: i64) -> Self {
        self.add_months(n * 12)
    }

    /// First day of the period.
    pub fn start(&self) -> NaiveDate {
        // month is validated on construction
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// First day after the period.
    pub fn close(&self) -> NaiveDate {
        self.add_months(1).start()
    }

    /// Whole months from the start of `self` to `now`; negative when `now` precedes it.
    pub fn whole_months_until(&self, now: NaiveDate) -> i64 {
        Self::containing(now).index() - self.index()
    }

    /// Whole years from the start of `self` to `now`; negative when `now` precedes it.
    pub fn whole_years_until(&self, now: NaiveDate) -> i64 {
        self.whole_months_until(now).div_euclid(12)
    }
}

impl fmt::Display for TaxPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
