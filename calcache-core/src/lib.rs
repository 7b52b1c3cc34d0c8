//! CALCACHE Core - Calendar Types and Period Arithmetic
//!
//! Pure data structures and arithmetic shared by every other crate in the
//! workspace. Nothing in here touches shared memory or the source store:
//! the arena and the controller live in `calcache-storage`, the PostgreSQL
//! glue in `calcache-pg`.

pub mod config;
pub mod error;
pub mod paging;
pub mod shift;
pub mod step;

pub use config::{CacheConfig, MAX_SLOTS, MIN_SLOT_BYTES};
pub use error::{
    CacheError, CalcacheError, CalcacheResult, ConfigError, LookupError, ShiftError,
};
pub use paging::{
    page_count, page_map_len, page_size_for, page_window, PageMap, PAGE_SIZE_DENSE,
    PAGE_SIZE_SPARSE,
};
pub use shift::{floor, shift, Breakpoints};
pub use step::Step;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

/// Stable primary key of a calendar in the source store.
pub type CalendarId = i64;

/// Days between 0001-01-01 (CE day 1) and 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

/// A date stored as a signed day count relative to 1970-01-01.
///
/// This is the representation breakpoints take inside the arena: four bytes,
/// totally ordered, and independent of any host date type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DayNumber(i32);

impl DayNumber {
    pub const fn new(days: i32) -> Self {
        Self(days)
    }

    pub const fn get(self) -> i32 {
        self.0
    }

    /// Convert back to a calendar date, if the day count is representable.
    pub fn to_date(self) -> Option<NaiveDate> {
        self.0
            .checked_add(UNIX_EPOCH_DAYS_FROM_CE)
            .and_then(NaiveDate::from_num_days_from_ce_opt)
    }
}

impl From<NaiveDate> for DayNumber {
    fn from(date: NaiveDate) -> Self {
        // chrono's date range (about +/-262k years) fits in i32 days.
        Self(date.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE)
    }
}

impl fmt::Display for DayNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_date() {
            Some(date) => write!(f, "{date}"),
            None => write!(f, "day {}", self.0),
        }
    }
}

/// How a caller names a calendar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CalendarRef {
    Id(CalendarId),
    Name(String),
    /// External identifier; matched case-insensitively.
    Xuid(String),
}

impl CalendarRef {
    pub fn name(name: impl Into<String>) -> Self {
        Self::Name(name.into())
    }

    pub fn xuid(xuid: impl Into<String>) -> Self {
        Self::Xuid(xuid.into())
    }
}

impl fmt::Display for CalendarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "calendar_id = {id}"),
            Self::Name(name) => write!(f, "calendar name = '{name}'"),
            Self::Xuid(xuid) => write!(f, "calendar xuid = '{xuid}'"),
        }
    }
}

/// Normalize an xuid the way the index stores it.
pub fn normalize_xuid(xuid: &str) -> String {
    xuid.trim().to_lowercase()
}

// ============================================================================
// SOURCE DATA
// ============================================================================

/// One calendar as read from the source store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarDefinition {
    pub id: CalendarId,
    pub xuid: String,
    pub name: String,
    /// Period start dates, strictly increasing.
    pub breakpoints: Vec<NaiveDate>,
}

impl CalendarDefinition {
    pub fn new(id: CalendarId, xuid: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id,
            xuid: xuid.into(),
            name: name.into(),
            breakpoints: Vec::new(),
        }
    }

    pub fn with_breakpoints(mut self, breakpoints: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.breakpoints = breakpoints.into_iter().collect();
        self
    }

    /// True when every breakpoint is strictly after the previous one.
    pub fn is_strictly_increasing(&self) -> bool {
        self.breakpoints.windows(2).all(|w| w[0] < w[1])
    }
}

/// Everything one load pass reads from the source store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSnapshot {
    pub calendars: Vec<CalendarDefinition>,
    /// When the source dataset was last known to be good. Diagnostic only.
    pub watermark: Option<DateTime<Utc>>,
}

impl SourceSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calendar(mut self, calendar: CalendarDefinition) -> Self {
        self.calendars.push(calendar);
        self
    }

    pub fn with_watermark(mut self, watermark: DateTime<Utc>) -> Self {
        self.watermark = Some(watermark);
        self
    }

    pub fn breakpoint_count(&self) -> usize {
        self.calendars.iter().map(|c| c.breakpoints.len()).sum()
    }

    /// Check the snapshot against the view invariants and the configured limits.
    ///
    /// Malformed data is `LoadFailed`; data that is well formed but too big
    /// for the configured limits is `CapacityExceeded`. Page maps grow with
    /// the day span of a calendar, not its breakpoint count, so their total
    /// size is checked against one sub-arena before anything is built.
    pub fn validate(&self, config: &CacheConfig) -> CalcacheResult<()> {
        if self.calendars.len() > config.max_calendars {
            return Err(CacheError::CapacityExceeded {
                resource: "calendars".to_string(),
                required: self.calendars.len(),
                available: config.max_calendars,
            }
            .into());
        }

        let mut ids = HashSet::with_capacity(self.calendars.len());
        let mut xuids = HashSet::with_capacity(self.calendars.len());
        let mut names = HashSet::with_capacity(self.calendars.len());
        let mut page_map_bytes = 0usize;

        for calendar in &self.calendars {
            let xuid = normalize_xuid(&calendar.xuid);
            if xuid.is_empty() || calendar.name.is_empty() {
                return Err(load_failed(format!(
                    "calendar_id = {} has an empty xuid or name",
                    calendar.id
                )));
            }
            for (label, value) in [("xuid", &xuid), ("name", &calendar.name)] {
                if value.len() > config.max_label_len {
                    return Err(CacheError::CapacityExceeded {
                        resource: format!("{label} length of calendar_id = {}", calendar.id),
                        required: value.len(),
                        available: config.max_label_len,
                    }
                    .into());
                }
            }
            if !ids.insert(calendar.id) {
                return Err(load_failed(format!("duplicate calendar_id = {}", calendar.id)));
            }
            if !xuids.insert(xuid.clone()) {
                return Err(load_failed(format!("duplicate calendar xuid = '{xuid}'")));
            }
            if !names.insert(calendar.name.as_str()) {
                return Err(load_failed(format!(
                    "duplicate calendar name = '{}'",
                    calendar.name
                )));
            }
            if calendar.breakpoints.len() > config.max_breakpoints_per_calendar {
                return Err(CacheError::CapacityExceeded {
                    resource: format!("entries of calendar_id = {}", calendar.id),
                    required: calendar.breakpoints.len(),
                    available: config.max_breakpoints_per_calendar,
                }
                .into());
            }
            if !calendar.is_strictly_increasing() {
                return Err(load_failed(format!(
                    "breakpoints of calendar_id = {} are not strictly increasing",
                    calendar.id
                )));
            }
            if let (Some(first), Some(last)) =
                (calendar.breakpoints.first(), calendar.breakpoints.last())
            {
                let len = paging::page_map_len(
                    DayNumber::from(*first),
                    DayNumber::from(*last),
                    calendar.breakpoints.len(),
                );
                page_map_bytes =
                    page_map_bytes.saturating_add(len.saturating_mul(std::mem::size_of::<u32>()));
                if page_map_bytes > config.slot_bytes {
                    return Err(CacheError::CapacityExceeded {
                        resource: format!("page map bytes up to calendar_id = {}", calendar.id),
                        required: page_map_bytes,
                        available: config.slot_bytes,
                    }
                    .into());
                }
            }
        }

        Ok(())
    }
}

fn load_failed(reason: String) -> CalcacheError {
    CacheError::LoadFailed { reason }.into()
}
