//! Period steps used to extend a calendar past its loaded breakpoints.
//!
//! A step is read off the two outermost breakpoints at one end of the
//! calendar. Synthetic breakpoints are always computed from the anchor
//! (`anchor + j * step`), never by repeated addition, so month clamping
//! does not drift.

use chrono::{Datelike, Duration, Months, NaiveDate};
use serde::{Deserialize, Serialize};

/// Spacing between consecutive breakpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    /// Fixed number of days (weeks, 4-4-5 style fixed periods, ...).
    Days(i64),
    /// Whole months landing on the anchor's day of month, clamped to short months.
    Months(u32),
    /// Whole months landing on the last day of the month.
    MonthEnds(u32),
}

impl Step {
    /// Classify the spacing from `earlier` to `later`.
    ///
    /// Returns `None` unless `later` is strictly after `earlier`.
    pub fn between(earlier: NaiveDate, later: NaiveDate) -> Option<Self> {
        if later <= earlier {
            return None;
        }
        let months = month_index(later) - month_index(earlier);
        if months > 0 {
            let months = u32::try_from(months).ok()?;
            if is_month_end(earlier) && is_month_end(later) {
                return Some(Self::MonthEnds(months));
            }
            if earlier.day() == later.day() {
                return Some(Self::Months(months));
            }
        }
        Some(Self::Days((later - earlier).num_days()))
    }

    /// The `n`-th synthetic breakpoint from `anchor` (negative `n` goes back).
    pub fn nth(&self, anchor: NaiveDate, n: i64) -> Option<NaiveDate> {
        match *self {
            Self::Days(days) => {
                let delta = Duration::try_days(days.checked_mul(n)?)?;
                anchor.checked_add_signed(delta)
            }
            Self::Months(months) => add_months(anchor, i64::from(months).checked_mul(n)?),
            Self::MonthEnds(months) => {
                let first = anchor.with_day(1)?;
                let shifted = add_months(first, i64::from(months).checked_mul(n)?)?;
                shifted.checked_add_months(Months::new(1))?.pred_opt()
            }
        }
    }

    /// Largest `j` with `nth(anchor, j) <= date`.
    pub fn floor_index(&self, anchor: NaiveDate, date: NaiveDate) -> Option<i64> {
        match *self {
            Self::Days(days) => Some((date - anchor).num_days().div_euclid(days)),
            Self::Months(months) | Self::MonthEnds(months) => {
                let elapsed = month_index(date) - month_index(anchor);
                let mut j = elapsed.div_euclid(i64::from(months));
                while self.nth(anchor, j)? > date {
                    j -= 1;
                }
                while matches!(self.nth(anchor, j + 1), Some(next) if next <= date) {
                    j += 1;
                }
                Some(j)
            }
        }
    }
}

fn month_index(date: NaiveDate) -> i64 {
    i64::from(date.year()) * 12 + i64::from(date.month0())
}

fn is_month_end(date: NaiveDate) -> bool {
    date.succ_opt().is_some_and(|next| next.day() == 1)
}

fn add_months(date: NaiveDate, months: i64) -> Option<NaiveDate> {
    if months >= 0 {
        date.checked_add_months(Months::new(u32::try_from(months).ok()?))
    } else {
        date.checked_sub_months(Months::new(u32::try_from(-months).ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    #[test]
    fn test_between_classifies_steps() {
        assert_eq!(
            Step::between(date(2024, 1, 1), date(2024, 2, 1)),
            Some(Step::Months(1))
        );
        assert_eq!(
            Step::between(date(2024, 10, 1), date(2025, 1, 1)),
            Some(Step::Months(3))
        );
        assert_eq!(
            Step::between(date(2024, 2, 29), date(2024, 3, 31)),
            Some(Step::MonthEnds(1))
        );
        assert_eq!(
            Step::between(date(2024, 1, 1), date(2024, 1, 8)),
            Some(Step::Days(7))
        );
        assert_eq!(
            Step::between(date(2024, 1, 15), date(2024, 2, 14)),
            Some(Step::Days(30))
        );
        assert_eq!(Step::between(date(2024, 1, 1), date(2024, 1, 1)), None);
    }

    #[test]
    fn test_nth_months_clamps_from_anchor() {
        let step = Step::Months(1);
        let anchor = date(2024, 1, 31);
        assert_eq!(step.nth(anchor, 1), Some(date(2024, 2, 29)));
        assert_eq!(step.nth(anchor, 2), Some(date(2024, 3, 31)));
        assert_eq!(step.nth(anchor, -2), Some(date(2023, 11, 30)));
    }

    #[test]
    fn test_nth_month_ends() {
        let step = Step::MonthEnds(1);
        let anchor = date(2024, 4, 30);
        assert_eq!(step.nth(anchor, 1), Some(date(2024, 5, 31)));
        assert_eq!(step.nth(anchor, -2), Some(date(2024, 2, 29)));
        assert_eq!(step.nth(anchor, 0), Some(anchor));
    }

    #[test]
    fn test_nth_days_overflow_is_none() {
        assert_eq!(Step::Days(7).nth(date(2024, 1, 1), i64::MAX), None);
        assert_eq!(Step::Months(12).nth(date(2024, 1, 1), i64::MAX / 2), None);
    }

    #[test]
    fn test_floor_index() {
        let quarter = Step::Months(3);
        let anchor = date(2025, 1, 1);
        assert_eq!(quarter.floor_index(anchor, date(2025, 1, 1)), Some(0));
        assert_eq!(quarter.floor_index(anchor, date(2025, 3, 31)), Some(0));
        assert_eq!(quarter.floor_index(anchor, date(2025, 4, 1)), Some(1));
        assert_eq!(quarter.floor_index(anchor, date(2024, 12, 31)), Some(-1));
        assert_eq!(quarter.floor_index(anchor, date(2024, 10, 1)), Some(-1));
        assert_eq!(quarter.floor_index(anchor, date(2024, 9, 30)), Some(-2));

        let week = Step::Days(7);
        let anchor = date(2024, 1, 1);
        assert_eq!(week.floor_index(anchor, date(2024, 1, 7)), Some(0));
        assert_eq!(week.floor_index(anchor, date(2024, 1, 8)), Some(1));
        assert_eq!(week.floor_index(anchor, date(2023, 12, 31)), Some(-1));
    }

    #[test]
    fn test_floor_index_mid_month_anchor() {
        let step = Step::Months(1);
        let anchor = date(2024, 1, 15);
        assert_eq!(step.floor_index(anchor, date(2024, 3, 14)), Some(1));
        assert_eq!(step.floor_index(anchor, date(2024, 3, 15)), Some(2));
        assert_eq!(step.floor_index(anchor, date(2023, 12, 20)), Some(-1));
        assert_eq!(step.floor_index(anchor, date(2023, 12, 14)), Some(-2));
    }
}
