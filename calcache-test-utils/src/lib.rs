//! CALCACHE Test Utilities
//!
//! Centralized test infrastructure for the calcache workspace:
//! - Mock calendar sources (gated, counting, failing)
//! - Proptest generators for calendars and snapshots
//! - Test fixtures for the standard quarter/month/weekly scenarios
//! - Custom assertions for calcache error variants

// Re-export the in-memory source from its crate
pub use calcache_storage::{CacheController, CalendarSource, InMemoryCalendarSource};

// Re-export core types for convenience
pub use calcache_core::{
    CacheConfig, CacheError, CalcacheError, CalcacheResult, CalendarDefinition, CalendarId,
    CalendarRef, LookupError, SourceSnapshot,
};

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Duration;

// ============================================================================
// MOCK SOURCES
// ============================================================================

/// Source whose loads block until the test opens the gate.
///
/// Lets a test hold a rebuild in the `Loading` state while readers and other
/// writers run against the cache.
#[derive(Debug)]
pub struct GatedSource {
    inner: InMemoryCalendarSource,
    open: Mutex<bool>,
    opened: Condvar,
    waiting: AtomicUsize,
    entered: Condvar,
    entered_lock: Mutex<()>,
}

impl GatedSource {
    /// A closed gate in front of `snapshot`.
    pub fn new(snapshot: SourceSnapshot) -> Self {
        Self {
            inner: InMemoryCalendarSource::new(snapshot),
            open: Mutex::new(false),
            opened: Condvar::new(),
            waiting: AtomicUsize::new(0),
            entered: Condvar::new(),
            entered_lock: Mutex::new(()),
        }
    }

    /// Let every pending and future load through.
    pub fn open(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.opened.notify_all();
    }

    /// Block future loads again.
    pub fn close(&self) {
        *self.open.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Wait until some load is parked at the gate.
    pub fn wait_for_load(&self, timeout: Duration) -> bool {
        let guard = self
            .entered_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (_guard, result) = self
            .entered
            .wait_timeout_while(guard, timeout, |_| self.waiting.load(Ordering::SeqCst) == 0)
            .unwrap_or_else(PoisonError::into_inner);
        !result.timed_out()
    }

    pub fn load_count(&self) -> u64 {
        self.inner.load_count()
    }

    pub fn replace(&self, snapshot: SourceSnapshot) {
        self.inner.replace(snapshot);
    }

    /// Make loads fail with `reason` once they pass the gate.
    pub fn fail_with(&self, reason: impl Into<String>) {
        self.inner.fail_with(reason);
    }

    pub fn recover(&self) {
        self.inner.recover();
    }
}

impl CalendarSource for GatedSource {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        {
            let _entered = self
                .entered_lock
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.waiting.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_all();
        }
        let open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        let _open = self
            .opened
            .wait_while(open, |open| !*open)
            .unwrap_or_else(PoisonError::into_inner);
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        self.inner.load()
    }

    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        self.inner.current_watermark()
    }
}

/// Source that fails its first `failures` loads, then serves the snapshot.
#[derive(Debug)]
pub struct FlakySource {
    inner: InMemoryCalendarSource,
    failures: AtomicU64,
}

impl FlakySource {
    pub fn new(snapshot: SourceSnapshot, failures: u64) -> Self {
        Self {
            inner: InMemoryCalendarSource::new(snapshot),
            failures: AtomicU64::new(failures),
        }
    }

    pub fn load_count(&self) -> u64 {
        self.inner.load_count()
    }
}

impl CalendarSource for FlakySource {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        let remaining = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let snapshot = self.inner.load()?;
        match remaining {
            Ok(_) => Err(CacheError::LoadFailed {
                reason: "flaky source".to_string(),
            }
            .into()),
            Err(_) => Ok(snapshot),
        }
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating calendars.

    use super::*;
    use proptest::prelude::*;

    /// Days from 1970-01-01 covering roughly 1990..2060.
    const DAY_RANGE: std::ops::Range<i32> = 7_300..32_800;

    /// Generate a date between 1990 and 2060.
    pub fn arb_date() -> impl Strategy<Value = NaiveDate> {
        DAY_RANGE.prop_map(fixtures::day)
    }

    /// Generate a signed period count.
    pub fn arb_periods() -> impl Strategy<Value = i32> {
        -60i32..60
    }

    /// Generate a strictly increasing breakpoint sequence.
    pub fn arb_breakpoints(
        size: impl Into<prop::collection::SizeRange>,
    ) -> impl Strategy<Value = Vec<NaiveDate>> {
        prop::collection::btree_set(DAY_RANGE, size)
            .prop_map(|days| days.into_iter().map(fixtures::day).collect())
    }

    /// Generate a calendar with the given id and 0..200 breakpoints.
    pub fn arb_calendar_definition(id: CalendarId) -> impl Strategy<Value = CalendarDefinition> {
        arb_breakpoints(0..200).prop_map(move |breakpoints| {
            CalendarDefinition::new(id, format!("XUID-{id}"), format!("calendar-{id}"))
                .with_breakpoints(breakpoints)
        })
    }

    /// Generate a snapshot of 1..8 calendars with distinct ids, names and xuids.
    pub fn arb_snapshot() -> impl Strategy<Value = SourceSnapshot> {
        prop::collection::vec(arb_breakpoints(0..120), 1..8).prop_map(|calendars| {
            calendars
                .into_iter()
                .enumerate()
                .fold(SourceSnapshot::new(), |snapshot, (i, breakpoints)| {
                    let id = i as CalendarId * 10 + 1;
                    snapshot.with_calendar(
                        CalendarDefinition::new(id, format!("XUID-{id}"), format!("calendar-{id}"))
                            .with_breakpoints(breakpoints),
                    )
                })
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built test fixtures for common testing scenarios.

    use super::*;

    /// Calendar ids used by [`standard_snapshot`].
    pub const QUARTER_ID: CalendarId = 1;
    pub const MONTH_ID: CalendarId = 2;
    pub const WEEKLY_ID: CalendarId = 3;
    pub const EMPTY_ID: CalendarId = 4;

    /// Build a date, panicking on invalid input (tests only).
    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid fixture date")
    }

    /// Date `days` after 1970-01-01.
    pub fn day(days: i32) -> NaiveDate {
        date(1970, 1, 1) + chrono::Duration::days(i64::from(days))
    }

    /// Quarter starts 2024-01-01 ..= 2025-01-01.
    pub fn quarter_calendar() -> CalendarDefinition {
        CalendarDefinition::new(QUARTER_ID, "QTR-STD", "quarter").with_breakpoints([
            date(2024, 1, 1),
            date(2024, 4, 1),
            date(2024, 7, 1),
            date(2024, 10, 1),
            date(2025, 1, 1),
        ])
    }

    /// Month starts through 2024.
    pub fn month_calendar() -> CalendarDefinition {
        CalendarDefinition::new(MONTH_ID, "MON-STD", "month")
            .with_breakpoints((1..=12).map(|m| date(2024, m, 1)))
    }

    /// Mondays of 2024 (2024-01-01 is a Monday).
    pub fn weekly_calendar() -> CalendarDefinition {
        CalendarDefinition::new(WEEKLY_ID, "WK-STD", "weekly")
            .with_breakpoints((0..52).map(|w| date(2024, 1, 1) + chrono::Duration::weeks(w)))
    }

    pub fn empty_calendar() -> CalendarDefinition {
        CalendarDefinition::new(EMPTY_ID, "EMPTY-STD", "empty")
    }

    /// Quarter, month, weekly and empty calendars.
    pub fn standard_snapshot() -> SourceSnapshot {
        SourceSnapshot::new()
            .with_calendar(quarter_calendar())
            .with_calendar(month_calendar())
            .with_calendar(weekly_calendar())
            .with_calendar(empty_calendar())
    }

    /// Small two-slot configuration with a short reclaim timeout.
    pub fn small_config() -> CacheConfig {
        CacheConfig::default()
            .with_slot_bytes(256 * 1024)
            .with_reclaim_timeout(Duration::from_millis(200))
    }

    /// Controller over an in-memory source holding [`standard_snapshot`].
    pub fn standard_controller() -> CacheController<InMemoryCalendarSource> {
        CacheController::new(
            InMemoryCalendarSource::new(standard_snapshot()),
            small_config(),
        )
        .expect("valid fixture config")
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertion helpers for calcache error variants.

    use super::*;

    /// Assert that a CalcacheResult is a CalendarNotFound lookup error.
    #[track_caller]
    pub fn assert_not_found<T: std::fmt::Debug>(result: &CalcacheResult<T>) {
        match result {
            Err(CalcacheError::Lookup(LookupError::CalendarNotFound { .. })) => {}
            other => panic!("Expected CalendarNotFound, got: {:?}", other),
        }
    }

    /// Assert that a CalcacheResult is a LoadFailed cache error.
    #[track_caller]
    pub fn assert_load_failed<T: std::fmt::Debug>(result: &CalcacheResult<T>) {
        match result {
            Err(CalcacheError::Cache(CacheError::LoadFailed { .. })) => {}
            other => panic!("Expected LoadFailed, got: {:?}", other),
        }
    }

    /// Assert that a CalcacheResult is a CapacityExceeded cache error.
    #[track_caller]
    pub fn assert_capacity_exceeded<T: std::fmt::Debug>(result: &CalcacheResult<T>) {
        match result {
            Err(CalcacheError::Cache(CacheError::CapacityExceeded { .. })) => {}
            other => panic!("Expected CapacityExceeded, got: {:?}", other),
        }
    }
}
