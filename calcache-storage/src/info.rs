//! Diagnostic snapshots of the cache.
//!
//! Everything here is a plain serializable value copied out of the shared
//! segment; holding one never pins a view.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use calcache_core::CalendarId;

use crate::arena::SlotState;

/// Lifecycle state of the cache as seen by one caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CacheState {
    /// No view has been published yet.
    Empty,
    /// A rebuild is running; `previous` is still served.
    Loading { previous: Option<u64> },
    /// View `version` is current.
    Published { version: u64 },
}

impl CacheState {
    /// Version readers are served right now, if any.
    pub fn served_version(&self) -> Option<u64> {
        match *self {
            Self::Empty => None,
            Self::Loading { previous } => previous,
            Self::Published { version } => Some(version),
        }
    }
}

impl std::fmt::Display for CacheState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty"),
            Self::Loading { previous: Some(v) } => write!(f, "loading (serving version {v})"),
            Self::Loading { previous: None } => write!(f, "loading"),
            Self::Published { version } => write!(f, "published (version {version})"),
        }
    }
}

/// Cache-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheInfo {
    pub state: CacheState,
    pub version: Option<u64>,
    pub calendar_count: usize,
    pub breakpoint_count: usize,
    /// Bytes used by the published view.
    pub used_bytes: usize,
    pub slot_bytes: usize,
    pub slot_count: usize,
    pub segment_bytes: usize,
    pub max_calendars: usize,
    pub max_breakpoints_per_calendar: usize,
    pub completed_rebuilds: u64,
    pub failed_rebuilds: u64,
    pub waiting_rebuilds: u32,
    /// Process id holding the rebuild latch.
    pub rebuild_owner: Option<u64>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub watermark: Option<DateTime<Utc>>,
    pub slots: Vec<SlotInfo>,
}

/// State of one sub-arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub slot: usize,
    pub state: SlotState,
    /// Readers currently holding the view in this slot.
    pub pins: u32,
    /// Version of the last view built here.
    pub version: u64,
    pub used_bytes: usize,
}

/// One calendar as listed by the diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSummary {
    pub id: CalendarId,
    pub xuid: String,
    pub name: String,
    pub entries: usize,
    pub first: Option<NaiveDate>,
    pub last: Option<NaiveDate>,
    pub page_size: i32,
    pub page_map_entries: usize,
}

/// One page map entry of a calendar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMapEntry {
    /// Page number counted from 1970-01-01.
    pub page: i64,
    /// First day of the page.
    pub page_start: Option<NaiveDate>,
    /// Breakpoints that start before this page.
    pub offset: u32,
}

/// Whether the published view still matches the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "freshness", rename_all = "snake_case")]
pub enum Freshness {
    /// Source watermark equals the one the view was built from.
    Fresh { watermark: DateTime<Utc> },
    /// The source moved on since the view was built.
    Stale {
        cached: Option<DateTime<Utc>>,
        current: DateTime<Utc>,
    },
    /// The source tracks no watermark, or nothing is published.
    Unknown,
}

impl Freshness {
    /// Compare the watermark a view was built from with the source's current one.
    pub fn compare(cached: Option<DateTime<Utc>>, current: Option<DateTime<Utc>>) -> Self {
        match current {
            None => Self::Unknown,
            Some(current) if cached == Some(current) => Self::Fresh { watermark: current },
            Some(current) => Self::Stale { cached, current },
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

/// Result of an invalidate call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidateOutcome {
    /// Version published for this call.
    pub version: u64,
    /// True when a concurrent rebuild already satisfied this call.
    pub coalesced: bool,
    pub calendar_count: usize,
    pub breakpoint_count: usize,
}

impl std::fmt::Display for InvalidateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Cache invalidated successfully (version {}, {} calendars, {} entries{})",
            self.version,
            self.calendar_count,
            self.breakpoint_count,
            if self.coalesced { ", coalesced" } else { "" }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn test_freshness_compare() {
        assert_eq!(Freshness::compare(Some(ts(1)), None), Freshness::Unknown);
        assert_eq!(
            Freshness::compare(Some(ts(1)), Some(ts(1))),
            Freshness::Fresh { watermark: ts(1) }
        );
        let stale = Freshness::compare(Some(ts(1)), Some(ts(2)));
        assert!(stale.is_stale());
        assert!(Freshness::compare(None, Some(ts(2))).is_stale());
    }

    #[test]
    fn test_cache_state_serializes_tagged() {
        let json = serde_json::to_value(CacheState::Published { version: 3 }).expect("json");
        assert_eq!(json["state"], "published");
        assert_eq!(json["version"], 3);
        assert_eq!(CacheState::Loading { previous: Some(2) }.served_version(), Some(2));
        assert_eq!(CacheState::Empty.served_version(), None);
    }

    #[test]
    fn test_invalidate_outcome_message() {
        let outcome = InvalidateOutcome {
            version: 2,
            coalesced: false,
            calendar_count: 3,
            breakpoint_count: 40,
        };
        assert_eq!(
            outcome.to_string(),
            "Cache invalidated successfully (version 2, 3 calendars, 40 entries)"
        );
    }
}
