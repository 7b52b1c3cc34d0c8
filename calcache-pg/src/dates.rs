//! Conversion between PostgreSQL dates and chrono dates.

use chrono::{Datelike, Duration, NaiveDate};
use pgrx::datum::Date;

/// Day zero of PostgreSQL's date representation.
fn pg_epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

/// `None` for `infinity` and `-infinity`.
pub fn to_naive(date: Date) -> Option<NaiveDate> {
    if date.is_infinity() || date.is_neg_infinity() {
        return None;
    }
    pg_epoch().checked_add_signed(Duration::days(i64::from(date.to_pg_epoch_days())))
}

/// `None` when the date lies outside PostgreSQL's date range.
pub fn from_naive(date: NaiveDate) -> Option<Date> {
    let month = u8::try_from(date.month()).ok()?;
    let day = u8::try_from(date.day()).ok()?;
    Date::new(date.year(), month, day).ok()
}
