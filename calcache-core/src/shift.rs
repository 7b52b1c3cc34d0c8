//! Date arithmetic over a calendar's breakpoints.
//!
//! A calendar is treated as one infinite, strictly increasing sequence of
//! period starts `B(j)`: indices `0..len` are the loaded breakpoints, indices
//! past either end are synthetic breakpoints extended with the [`Step`]
//! observed between the two outermost breakpoints at that end.
//!
//! `shift(d, n)` finds the slice `i` containing `d` (largest `i` with
//! `B(i) <= d`) and returns `B(i + n)`. A date equal to a breakpoint belongs
//! to the slice that breakpoint starts, so `shift(d, 0)` floors `d` to its
//! period start.

use crate::{DayNumber, ShiftError, Step};
use chrono::NaiveDate;

/// Read access to an ascending breakpoint sequence.
pub trait Breakpoints {
    fn len(&self) -> usize;

    fn day_at(&self, index: usize) -> DayNumber;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index range that contains the count of breakpoints `<= day`.
    ///
    /// Implementations with a page map narrow this; the default is the
    /// whole sequence.
    fn search_window(&self, _day: DayNumber) -> (usize, usize) {
        (0, self.len())
    }
}

impl Breakpoints for [DayNumber] {
    fn len(&self) -> usize {
        <[DayNumber]>::len(self)
    }

    fn day_at(&self, index: usize) -> DayNumber {
        self[index]
    }
}

impl Breakpoints for Vec<DayNumber> {
    fn len(&self) -> usize {
        Vec::len(self)
    }

    fn day_at(&self, index: usize) -> DayNumber {
        self[index]
    }
}

/// Shift `date` by `periods` periods of the calendar.
pub fn shift<B>(breakpoints: &B, date: NaiveDate, periods: i32) -> Result<NaiveDate, ShiftError>
where
    B: Breakpoints + ?Sized,
{
    let slice = slice_index(breakpoints, date)?;
    breakpoint_at(breakpoints, slice + i64::from(periods))
}

/// Floor `date` to the start of the period containing it.
pub fn floor<B>(breakpoints: &B, date: NaiveDate) -> Result<NaiveDate, ShiftError>
where
    B: Breakpoints + ?Sized,
{
    shift(breakpoints, date, 0)
}

/// Virtual index of the slice containing `date`.
fn slice_index<B>(breakpoints: &B, date: NaiveDate) -> Result<i64, ShiftError>
where
    B: Breakpoints + ?Sized,
{
    let len = breakpoints.len();
    if len == 0 {
        return Err(ShiftError::EmptyCalendar);
    }
    let day = DayNumber::from(date);
    let first = breakpoints.day_at(0);
    let last = breakpoints.day_at(len - 1);

    if day < first {
        let (anchor, step) = lower_step(breakpoints)?;
        return step
            .floor_index(anchor, date)
            .ok_or_else(|| out_of_range(format!("cannot locate {date} before {anchor}")));
    }

    if day >= last {
        if day == last {
            return Ok(len as i64 - 1);
        }
        let (anchor, step) = upper_step(breakpoints)?;
        let beyond = step
            .floor_index(anchor, date)
            .ok_or_else(|| out_of_range(format!("cannot locate {date} after {anchor}")))?;
        return Ok(len as i64 - 1 + beyond);
    }

    let (mut lo, mut hi) = breakpoints.search_window(day);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if breakpoints.day_at(mid) <= day {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    // first <= day, so at least one breakpoint is <= day.
    Ok(lo as i64 - 1)
}

/// Breakpoint `B(index)`, synthesizing past either end.
fn breakpoint_at<B>(breakpoints: &B, index: i64) -> Result<NaiveDate, ShiftError>
where
    B: Breakpoints + ?Sized,
{
    let len = breakpoints.len() as i64;
    if (0..len).contains(&index) {
        return to_date(breakpoints.day_at(index as usize));
    }

    let (anchor, step, n) = if index >= len {
        let (anchor, step) = upper_step(breakpoints)?;
        (anchor, step, index - (len - 1))
    } else {
        let (anchor, step) = lower_step(breakpoints)?;
        (anchor, step, index)
    };
    step.nth(anchor, n).ok_or_else(|| {
        out_of_range(format!(
            "period {n} from {anchor} is outside the supported date range"
        ))
    })
}

fn lower_step<B>(breakpoints: &B) -> Result<(NaiveDate, Step), ShiftError>
where
    B: Breakpoints + ?Sized,
{
    let first = to_date(breakpoints.day_at(0))?;
    if breakpoints.len() < 2 {
        return Err(out_of_range(format!(
            "single breakpoint {first}, cannot extrapolate before it"
        )));
    }
    let second = to_date(breakpoints.day_at(1))?;
    let step = Step::between(first, second)
        .ok_or_else(|| out_of_range("breakpoints are not increasing".to_string()))?;
    Ok((first, step))
}

fn upper_step<B>(breakpoints: &B) -> Result<(NaiveDate, Step), ShiftError>
where
    B: Breakpoints + ?Sized,
{
    let len = breakpoints.len();
    let last = to_date(breakpoints.day_at(len - 1))?;
    if len < 2 {
        return Err(out_of_range(format!(
            "single breakpoint {last}, cannot extrapolate after it"
        )));
    }
    let previous = to_date(breakpoints.day_at(len - 2))?;
    let step = Step::between(previous, last)
        .ok_or_else(|| out_of_range("breakpoints are not increasing".to_string()))?;
    Ok((last, step))
}

fn to_date(day: DayNumber) -> Result<NaiveDate, ShiftError> {
    day.to_date()
        .ok_or_else(|| out_of_range(format!("day {} is not a representable date", day.get())))
}

fn out_of_range(reason: String) -> ShiftError {
    ShiftError::OutOfRange { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn days(dates: &[NaiveDate]) -> Vec<DayNumber> {
        dates.iter().copied().map(DayNumber::from).collect()
    }

    fn quarter() -> Vec<DayNumber> {
        days(&[
            date(2024, 1, 1),
            date(2024, 4, 1),
            date(2024, 7, 1),
            date(2024, 10, 1),
            date(2025, 1, 1),
        ])
    }

    fn month_2024() -> Vec<DayNumber> {
        days(&(1..=12).map(|m| date(2024, m, 1)).collect::<Vec<_>>())
    }

    #[test]
    fn test_quarter_scenario() {
        let q = quarter();
        assert_eq!(shift(&q, date(2024, 2, 15), 0), Ok(date(2024, 1, 1)));
        assert_eq!(shift(&q, date(2024, 2, 15), 1), Ok(date(2024, 4, 1)));
        assert_eq!(shift(&q, date(2025, 1, 1), -1), Ok(date(2024, 10, 1)));
    }

    #[test]
    fn test_month_scenario() {
        assert_eq!(shift(&month_2024(), date(2024, 1, 20), 2), Ok(date(2024, 3, 1)));
    }

    #[test]
    fn test_breakpoint_belongs_to_slice_it_starts() {
        let q = quarter();
        assert_eq!(floor(&q, date(2024, 4, 1)), Ok(date(2024, 4, 1)));
        assert_eq!(floor(&q, date(2024, 3, 31)), Ok(date(2024, 1, 1)));
        assert_eq!(shift(&q, date(2024, 4, 1), 1), Ok(date(2024, 7, 1)));
    }

    #[test]
    fn test_zero_floors_to_period_start() {
        let m = month_2024();
        assert_eq!(floor(&m, date(2024, 6, 30)), Ok(date(2024, 6, 1)));
        assert_ne!(floor(&m, date(2024, 6, 30)), Ok(date(2024, 6, 30)));
    }

    #[test]
    fn test_extrapolates_after_last_breakpoint() {
        let q = quarter();
        assert_eq!(shift(&q, date(2025, 1, 1), 1), Ok(date(2025, 4, 1)));
        assert_eq!(shift(&q, date(2024, 11, 5), 3), Ok(date(2025, 7, 1)));
        assert_eq!(floor(&q, date(2025, 8, 17)), Ok(date(2025, 7, 1)));
        assert_eq!(shift(&q, date(2025, 8, 17), -3), Ok(date(2024, 10, 1)));
    }

    #[test]
    fn test_extrapolates_before_first_breakpoint() {
        let q = quarter();
        assert_eq!(floor(&q, date(2023, 12, 31)), Ok(date(2023, 10, 1)));
        assert_eq!(shift(&q, date(2023, 12, 31), 1), Ok(date(2024, 1, 1)));
        assert_eq!(shift(&q, date(2024, 1, 1), -5), Ok(date(2022, 10, 1)));
    }

    #[test]
    fn test_weekly_extrapolation_uses_day_delta() {
        let w = days(&[date(2024, 1, 1), date(2024, 1, 8), date(2024, 1, 15)]);
        assert_eq!(shift(&w, date(2024, 1, 16), 2), Ok(date(2024, 1, 29)));
        assert_eq!(shift(&w, date(2024, 1, 2), -1), Ok(date(2023, 12, 25)));
    }

    #[test]
    fn test_month_end_calendar_extrapolation() {
        let m = days(&[date(2024, 1, 31), date(2024, 2, 29), date(2024, 3, 31)]);
        assert_eq!(shift(&m, date(2024, 3, 31), 1), Ok(date(2024, 4, 30)));
        assert_eq!(shift(&m, date(2024, 3, 31), 2), Ok(date(2024, 5, 31)));
        assert_eq!(shift(&m, date(2024, 1, 31), -1), Ok(date(2023, 12, 31)));
    }

    #[test]
    fn test_empty_calendar() {
        let empty: Vec<DayNumber> = Vec::new();
        assert_eq!(
            shift(&empty, date(2024, 1, 1), 1),
            Err(ShiftError::EmptyCalendar)
        );
    }

    #[test]
    fn test_single_breakpoint_calendar() {
        let single = days(&[date(2024, 1, 1)]);
        assert_eq!(floor(&single, date(2024, 1, 1)), Ok(date(2024, 1, 1)));
        assert!(matches!(
            shift(&single, date(2024, 1, 1), 1),
            Err(ShiftError::OutOfRange { .. })
        ));
        assert!(matches!(
            floor(&single, date(2023, 5, 1)),
            Err(ShiftError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_huge_interval_is_out_of_range() {
        let q = quarter();
        assert!(matches!(
            shift(&q, date(2024, 2, 1), i32::MAX),
            Err(ShiftError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_slice_input() {
        let q = quarter();
        let slice: &[DayNumber] = &q;
        assert_eq!(shift(slice, date(2024, 5, 5), 0), Ok(date(2024, 4, 1)));
    }

    /// Calendars generated as `start + k * step` for a handful of step kinds.
    fn arb_calendar() -> impl Strategy<Value = Vec<DayNumber>> {
        let start = (1990i32..2030, 1u32..=12);
        let kind = prop_oneof![
            Just(Step::Months(1)),
            Just(Step::Months(3)),
            Just(Step::Months(12)),
            Just(Step::Days(7)),
            (1i64..40).prop_map(Step::Days),
        ];
        (start, kind, 1usize..40).prop_map(|((year, month), step, count)| {
            let anchor = date(year, month, 1);
            (0..count as i64)
                .filter_map(|k| step.nth(anchor, k))
                .map(DayNumber::from)
                .collect()
        })
    }

    fn arb_date() -> impl Strategy<Value = NaiveDate> {
        (1985i32..2040, 1u32..=12, 1u32..=28).prop_map(|(y, m, d)| date(y, m, d))
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(300))]

        /// Flooring is idempotent.
        #[test]
        fn prop_floor_idempotent(calendar in arb_calendar(), d in arb_date()) {
            prop_assume!(calendar.len() >= 2);
            let once = floor(&calendar, d).expect("floor");
            prop_assert_eq!(floor(&calendar, once), Ok(once));
            prop_assert!(once <= d);
        }

        /// Shifting forward then back lands on the floor of the input.
        #[test]
        fn prop_shift_inverse_up_to_floor(
            calendar in arb_calendar(),
            d in arb_date(),
            n in -60i32..60,
        ) {
            prop_assume!(calendar.len() >= 2);
            let forward = shift(&calendar, d, n).expect("forward");
            let back = shift(&calendar, forward, -n).expect("back");
            prop_assert_eq!(back, floor(&calendar, d).expect("floor"));
        }

        /// Results are monotone in the interval count.
        #[test]
        fn prop_shift_monotone(calendar in arb_calendar(), d in arb_date(), n in -60i32..60) {
            prop_assume!(calendar.len() >= 2);
            let a = shift(&calendar, d, n).expect("a");
            let b = shift(&calendar, d, n + 1).expect("b");
            prop_assert!(a < b);
        }
    }
}
