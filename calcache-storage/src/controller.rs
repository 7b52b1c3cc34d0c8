//! Cache controller: lifecycle of published views.
//!
//! The controller owns the shared segment and the calendar source. It runs
//! the load sequence (source read, arena build, index build, publish) and
//! hands readers [`ViewHandle`]s that keep one view alive while in use.
//!
//! State machine, per segment:
//!
//! ```text
//! Empty ──load──▶ Loading ──ok──▶ Published(v)
//!   ▲               │                 │
//!   └────failed─────┘                 │ invalidate
//!                                     ▼
//!       Published(v) ◀──failed── Loading ──ok──▶ Published(v + 1)
//! ```
//!
//! Only one rebuild runs at a time across every process attached to the
//! segment. Readers never wait for a rebuild once a view exists. Callers
//! waiting for another caller's rebuild give up after
//! `rebuild_wait_timeout` and poll the host's interrupt check meanwhile.

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};

use calcache_core::{
    CacheConfig, CacheError, CalcacheError, CalcacheResult, CalendarId, CalendarRef, DayNumber,
};

use crate::arena::segment::{InterruptCheck, Pin, RebuildLatch, ReleasedHolds};
use crate::arena::{BuiltView, CacheView, SharedSegment, ViewBuilder};
use crate::info::{
    CacheInfo, CacheState, CalendarSummary, Freshness, InvalidateOutcome, PageMapEntry,
};
use crate::source::CalendarSource;

/// A reader's handle on one published view.
///
/// While the handle lives, the view it names is never reclaimed, even if a
/// newer view is published in the meantime. Views borrowed from the handle
/// cannot outlive it.
pub struct ViewHandle<'a> {
    pin: Pin<'a>,
}

impl ViewHandle<'_> {
    pub fn view(&self) -> CacheView<'_> {
        CacheView::new(self.pin.bytes())
    }

    pub fn version(&self) -> u64 {
        self.pin.version()
    }

    /// Sub-arena holding the view.
    pub fn slot(&self) -> usize {
        self.pin.slot()
    }
}

impl std::fmt::Debug for ViewHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewHandle")
            .field("version", &self.version())
            .field("slot", &self.slot())
            .finish()
    }
}

/// Owns the shared segment and the source it is loaded from.
pub struct CacheController<S> {
    segment: SharedSegment,
    source: S,
    config: CacheConfig,
    interrupt: Option<InterruptCheck>,
}

impl<S: CalendarSource> CacheController<S> {
    /// Controller over a process-local segment.
    pub fn new(source: S, config: CacheConfig) -> CalcacheResult<Self> {
        let segment = SharedSegment::allocate(&config)?;
        Ok(Self {
            segment,
            source,
            config,
            interrupt: None,
        })
    }

    /// Controller over a segment attached by the host.
    pub fn with_segment(
        segment: SharedSegment,
        source: S,
        config: CacheConfig,
    ) -> CalcacheResult<Self> {
        config.validate()?;
        if segment.slot_count() != config.slot_count || segment.slot_bytes() != config.slot_bytes {
            return Err(CacheError::SegmentInvalid {
                reason: format!(
                    "segment has {} slots of {} bytes, configuration expects {} of {}",
                    segment.slot_count(),
                    segment.slot_bytes(),
                    config.slot_count,
                    config.slot_bytes
                ),
            }
            .into());
        }
        Ok(Self {
            segment,
            source,
            config,
            interrupt: None,
        })
    }

    /// Poll `check` while waiting for another caller's rebuild.
    ///
    /// The check may unwind (e.g. a host raising a cancel request); the
    /// wait releases its bookkeeping on the way out.
    pub fn with_interrupt_check(mut self, check: InterruptCheck) -> Self {
        self.interrupt = Some(check);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.segment
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    pub fn state(&self) -> CacheState {
        let current = self.segment.current().map(|(_, version)| version);
        if self.segment.rebuild_in_progress() {
            return CacheState::Loading { previous: current };
        }
        match current {
            Some(version) => CacheState::Published { version },
            None => CacheState::Empty,
        }
    }

    /// Handle on the published view, without loading.
    pub fn current_view(&self) -> Option<ViewHandle<'_>> {
        let pin = self.segment.pin_current()?;
        if !CacheView::new(pin.bytes()).is_valid() {
            warn!(slot = pin.slot(), version = pin.version(), "published view has no header");
            return None;
        }
        Some(ViewHandle { pin })
    }

    /// Handle on the published view, loading one first if none exists.
    ///
    /// Concurrent callers on an empty cache wait for a single load. If that
    /// load fails, every caller that was already waiting gets its error.
    pub fn ensure_loaded(&self) -> CalcacheResult<ViewHandle<'_>> {
        if let Some(handle) = self.current_view() {
            return Ok(handle);
        }

        let threshold = self.segment.coalesce_threshold();
        let latch = self.lock_rebuild()?;
        if let Some(handle) = self.current_view() {
            debug!(version = handle.version(), "view published while waiting for the rebuild latch");
            return Ok(handle);
        }
        if let Some(reason) = self.segment.failure_since(&latch, threshold) {
            debug!(%reason, "first load coalesced with a failed concurrent load");
            return Err(CacheError::LoadFailed { reason }.into());
        }
        self.rebuild(&latch)?;
        drop(latch);

        self.current_view().ok_or_else(|| {
            CalcacheError::from(CacheError::LoadFailed {
                reason: "no view published after a successful rebuild".to_string(),
            })
        })
    }

    /// Reload from the source and publish a new view.
    ///
    /// A call that finds a rebuild in flight, or one that starts while it
    /// waits for the latch, reuses that rebuild's view once it publishes
    /// instead of loading again. On failure the previously published view,
    /// if any, stays current.
    pub fn invalidate(&self) -> CalcacheResult<InvalidateOutcome> {
        let threshold = self.segment.coalesce_threshold();
        let latch = self.lock_rebuild()?;

        if self.segment.published_ticket() > threshold {
            if let Some(handle) = self.current_view() {
                let view = handle.view();
                debug!(version = view.version(), "invalidate coalesced with a concurrent rebuild");
                return Ok(InvalidateOutcome {
                    version: view.version(),
                    coalesced: true,
                    calendar_count: view.calendar_count(),
                    breakpoint_count: view.breakpoint_count(),
                });
            }
        }

        let built = self.rebuild(&latch)?;
        Ok(InvalidateOutcome {
            version: built.version,
            coalesced: false,
            calendar_count: built.calendar_count,
            breakpoint_count: built.breakpoint_count,
        })
    }

    fn lock_rebuild(&self) -> CalcacheResult<RebuildLatch<'_>> {
        self.segment
            .lock_rebuild(self.config.rebuild_wait_timeout, self.interrupt)
    }

    /// Release the pins and rebuild latch this process still holds.
    ///
    /// # Safety
    ///
    /// Only for process exit paths that skip destructors; no [`ViewHandle`]
    /// of this process may be used afterwards.
    pub unsafe fn release_process_holds(&self) -> ReleasedHolds {
        self.segment.release_process_holds()
    }

    /// Load, build and publish. The caller holds the rebuild latch.
    fn rebuild(&self, latch: &RebuildLatch<'_>) -> CalcacheResult<BuiltView> {
        let previous = self.segment.current().map(|(_, version)| version);
        let result = self.load_and_publish(latch);
        match &result {
            Ok(built) => info!(
                version = built.version,
                previous = ?previous,
                calendars = built.calendar_count,
                entries = built.breakpoint_count,
                bytes = built.used_bytes,
                "calendar cache published"
            ),
            Err(e) => {
                self.segment.record_failed_rebuild(latch, &failure_reason(e));
                warn!(error = %e, previous = ?previous, "calendar cache rebuild failed, keeping previous view");
            }
        }
        result
    }

    fn load_and_publish(&self, latch: &RebuildLatch<'_>) -> CalcacheResult<BuiltView> {
        let snapshot = self.source.load().map_err(as_load_error)?;
        snapshot.validate(&self.config)?;
        debug!(
            calendars = snapshot.calendars.len(),
            entries = snapshot.breakpoint_count(),
            "calendar source loaded"
        );

        let slot = self
            .segment
            .claim_free_slot(self.config.reclaim_timeout)?;
        let version = self.segment.next_version();
        // SAFETY: the slot was claimed under the latch: it is not current and
        // has no pins, so no reader can observe it until `publish`.
        let buffer = unsafe { self.segment.slot_data_mut(slot) };
        match ViewBuilder::new(buffer).build(&snapshot, version, Utc::now()) {
            Ok(built) => {
                self.segment.publish(latch, slot, version, built.used_bytes);
                Ok(built)
            }
            Err(e) => {
                self.segment.abandon_slot(slot);
                Err(e)
            }
        }
    }

    // ========================================================================
    // DATE ARITHMETIC
    // ========================================================================

    /// Shift `date` by `periods` periods of `calendar`, loading the cache if needed.
    pub fn shift(
        &self,
        calendar: &CalendarRef,
        date: NaiveDate,
        periods: i32,
    ) -> CalcacheResult<NaiveDate> {
        let handle = self.ensure_loaded()?;
        let shifted = handle.view().shift(calendar, date, periods)?;
        Ok(shifted)
    }

    pub fn shift_by_id(
        &self,
        id: CalendarId,
        date: NaiveDate,
        periods: i32,
    ) -> CalcacheResult<NaiveDate> {
        self.shift(&CalendarRef::Id(id), date, periods)
    }

    pub fn shift_by_name(
        &self,
        name: &str,
        date: NaiveDate,
        periods: i32,
    ) -> CalcacheResult<NaiveDate> {
        self.shift(&CalendarRef::name(name), date, periods)
    }

    pub fn shift_by_xuid(
        &self,
        xuid: &str,
        date: NaiveDate,
        periods: i32,
    ) -> CalcacheResult<NaiveDate> {
        self.shift(&CalendarRef::xuid(xuid), date, periods)
    }

    // ========================================================================
    // DIAGNOSTICS
    // ========================================================================

    /// Cache-wide statistics. Never loads.
    pub fn info(&self) -> CacheInfo {
        let handle = self.current_view();
        let view = handle.as_ref().map(ViewHandle::view);
        CacheInfo {
            state: self.state(),
            version: view.map(|v| v.version()),
            calendar_count: view.map_or(0, |v| v.calendar_count()),
            breakpoint_count: view.map_or(0, |v| v.breakpoint_count()),
            used_bytes: view.map_or(0, |v| v.used_bytes()),
            slot_bytes: self.segment.slot_bytes(),
            slot_count: self.segment.slot_count(),
            segment_bytes: self.segment.len(),
            max_calendars: self.config.max_calendars,
            max_breakpoints_per_calendar: self.config.max_breakpoints_per_calendar,
            completed_rebuilds: self.segment.completed_rebuilds(),
            failed_rebuilds: self.segment.failed_rebuilds(),
            waiting_rebuilds: self.segment.waiting_rebuilds(),
            rebuild_owner: self.segment.latch_owner(),
            loaded_at: view.and_then(|v| v.loaded_at()),
            watermark: view.and_then(|v| v.watermark()),
            slots: self.segment.slot_infos(),
        }
    }

    /// Every calendar of the published view, in id order.
    pub fn calendars(&self) -> CalcacheResult<Vec<CalendarSummary>> {
        let handle = self.ensure_loaded()?;
        let summaries = handle.view().calendars().map(|c| c.summary()).collect();
        Ok(summaries)
    }

    /// Loaded breakpoints of one calendar.
    pub fn breakpoints(&self, calendar: &CalendarRef) -> CalcacheResult<Vec<NaiveDate>> {
        let handle = self.ensure_loaded()?;
        let view = handle.view();
        let entry = view.resolve(calendar)?;
        Ok(entry.breakpoints().iter().collect())
    }

    /// Page map of one calendar.
    pub fn page_map(&self, calendar: &CalendarRef) -> CalcacheResult<Vec<PageMapEntry>> {
        let handle = self.ensure_loaded()?;
        let view = handle.view();
        let entry = view.resolve(calendar)?;
        let page_size = entry.page_size();
        let first_page = entry.first_page();
        let entries = entry
            .breakpoints()
            .page_offsets()
            .enumerate()
            .map(|(i, offset)| {
                let page = i64::from(first_page) + i as i64;
                let start = i32::try_from(page * i64::from(page_size))
                    .ok()
                    .and_then(|day| DayNumber::new(day).to_date());
                PageMapEntry {
                    page,
                    page_start: start,
                    offset,
                }
            })
            .collect();
        Ok(entries)
    }

    /// Compare the published view's watermark with the source's current one.
    pub fn freshness(&self) -> CalcacheResult<Freshness> {
        let Some(handle) = self.current_view() else {
            return Ok(Freshness::Unknown);
        };
        let cached = handle.view().watermark();
        drop(handle);
        let current = self.source.current_watermark()?;
        Ok(Freshness::compare(cached, current))
    }
}

impl<S> std::fmt::Debug for CacheController<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheController")
            .field("segment", &self.segment)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Source failures that are not already cache errors become `LoadFailed`.
/// Text handed to callers that coalesce with a failed load.
fn failure_reason(error: &CalcacheError) -> String {
    match error {
        CalcacheError::Cache(CacheError::LoadFailed { reason }) => reason.clone(),
        other => other.to_string(),
    }
}

fn as_load_error(error: CalcacheError) -> CalcacheError {
    match error {
        CalcacheError::Cache(_) => error,
        other => CacheError::LoadFailed {
            reason: other.to_string(),
        }
        .into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryCalendarSource;
    use calcache_core::{CalendarDefinition, LookupError, SourceSnapshot};
    use std::sync::Arc;
    use std::time::Duration;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn config() -> CacheConfig {
        CacheConfig::default()
            .with_slot_bytes(64 * 1024)
            .with_reclaim_timeout(Duration::from_millis(50))
    }

    fn quarter_snapshot() -> SourceSnapshot {
        SourceSnapshot::new().with_calendar(
            CalendarDefinition::new(1, "QTR", "quarter").with_breakpoints([
                date(2024, 1, 1),
                date(2024, 4, 1),
                date(2024, 7, 1),
                date(2024, 10, 1),
                date(2025, 1, 1),
            ]),
        )
    }

    fn controller() -> CacheController<Arc<InMemoryCalendarSource>> {
        let source = Arc::new(InMemoryCalendarSource::new(quarter_snapshot()));
        CacheController::new(source, config()).expect("controller")
    }

    #[test]
    fn test_starts_empty_and_loads_lazily() {
        let cache = controller();
        assert_eq!(cache.state(), CacheState::Empty);
        assert!(cache.current_view().is_none());
        assert_eq!(cache.source().load_count(), 0);

        let shifted = cache
            .shift_by_name("quarter", date(2024, 2, 15), 1)
            .expect("shift");
        assert_eq!(shifted, date(2024, 4, 1));
        assert_eq!(cache.state(), CacheState::Published { version: 1 });
        assert_eq!(cache.source().load_count(), 1);

        cache.shift_by_id(1, date(2024, 2, 15), 0).expect("shift");
        assert_eq!(cache.source().load_count(), 1);
    }

    #[test]
    fn test_invalidate_advances_version() {
        let cache = controller();
        let first = cache.invalidate().expect("invalidate");
        assert_eq!(first.version, 1);
        assert!(!first.coalesced);
        let second = cache.invalidate().expect("invalidate");
        assert_eq!(second.version, 2);
        assert_eq!(cache.info().completed_rebuilds, 2);
    }

    #[test]
    fn test_handle_survives_invalidate() {
        let cache = controller();
        let old = cache.ensure_loaded().expect("load");
        assert_eq!(old.version(), 1);

        cache.source().replace(SourceSnapshot::new().with_calendar(
            CalendarDefinition::new(1, "QTR", "quarter")
                .with_breakpoints([date(2030, 1, 1), date(2030, 4, 1)]),
        ));
        cache.invalidate().expect("invalidate");

        // The old handle still reads the old data.
        assert_eq!(
            old.view()
                .shift(&CalendarRef::Id(1), date(2024, 5, 5), 0)
                .expect("old view"),
            date(2024, 4, 1)
        );
        assert_eq!(old.view().breakpoint_count(), 5);
        let new = cache.current_view().expect("published");
        assert_eq!(new.version(), 2);
        assert_eq!(new.view().breakpoint_count(), 2);
        assert_ne!(new.slot(), old.slot());
    }

    #[test]
    fn test_failed_load_keeps_previous_view() {
        let cache = controller();
        cache.invalidate().expect("first load");
        cache.source().fail_with("source offline");

        let err = cache.invalidate().expect_err("load fails");
        assert!(matches!(err, CalcacheError::Cache(CacheError::LoadFailed { .. })));
        assert_eq!(cache.state(), CacheState::Published { version: 1 });
        assert_eq!(cache.info().failed_rebuilds, 1);
        assert_eq!(
            cache.shift_by_id(1, date(2024, 8, 1), 0).expect("still served"),
            date(2024, 7, 1)
        );
    }

    #[test]
    fn test_failed_first_load_stays_empty() {
        let source = Arc::new(InMemoryCalendarSource::new(quarter_snapshot()));
        source.fail_with("no database");
        let cache = CacheController::new(Arc::clone(&source), config()).expect("controller");

        assert!(cache.shift_by_id(1, date(2024, 1, 1), 0).is_err());
        assert_eq!(cache.state(), CacheState::Empty);

        source.recover();
        assert_eq!(
            cache.shift_by_id(1, date(2024, 1, 1), 0).expect("recovered"),
            date(2024, 1, 1)
        );
    }

    #[test]
    fn test_abandoned_rebuild_latch_fails_waiters_until_released() {
        let source = Arc::new(InMemoryCalendarSource::new(quarter_snapshot()));
        let cache = CacheController::new(
            Arc::clone(&source),
            config().with_rebuild_wait_timeout(Duration::from_millis(30)),
        )
        .expect("controller");

        // A rebuilder that exits without unwinding keeps the latch.
        std::mem::forget(
            cache
                .segment()
                .lock_rebuild(Duration::from_secs(1), None)
                .expect("latch"),
        );
        let err = cache
            .shift_by_id(1, date(2024, 2, 1), 0)
            .expect_err("latch is never released");
        assert!(matches!(err, CalcacheError::Cache(CacheError::LoadFailed { .. })));
        assert_eq!(cache.info().rebuild_owner, Some(u64::from(std::process::id())));
        assert_eq!(source.load_count(), 0);

        // SAFETY: the forgotten latch guard is never touched again.
        let released = unsafe { cache.release_process_holds() };
        assert_eq!(released.latch_ticket, Some(1));
        assert_eq!(cache.info().rebuild_owner, None);
        assert_eq!(
            cache.shift_by_id(1, date(2024, 2, 1), 0).expect("latch free again"),
            date(2024, 1, 1)
        );
    }

    #[test]
    fn test_capacity_exceeded_keeps_previous_view() {
        let cache = controller();
        cache.invalidate().expect("first load");

        let huge: Vec<NaiveDate> = (0..20_000)
            .map(|i| date(2000, 1, 1) + chrono::Duration::days(i))
            .collect();
        cache.source().replace(
            SourceSnapshot::new()
                .with_calendar(CalendarDefinition::new(9, "big", "big").with_breakpoints(huge)),
        );
        let err = cache.invalidate().expect_err("does not fit in 64 KiB");
        assert!(matches!(
            err,
            CalcacheError::Cache(CacheError::CapacityExceeded { .. })
        ));
        assert_eq!(cache.state(), CacheState::Published { version: 1 });
        assert!(cache.shift_by_name("quarter", date(2024, 1, 1), 0).is_ok());

        // The abandoned slot is reusable.
        cache.source().replace(quarter_snapshot());
        assert_eq!(cache.invalidate().expect("rebuild").version, 2);
    }

    #[test]
    fn test_unknown_calendar_has_no_side_effect() {
        let cache = controller();
        cache.invalidate().expect("load");
        let err = cache
            .shift_by_name("week", date(2024, 1, 1), 0)
            .expect_err("unknown");
        assert_eq!(
            err,
            CalcacheError::Lookup(LookupError::CalendarNotFound {
                calendar: CalendarRef::name("week")
            })
        );
        assert_eq!(cache.state(), CacheState::Published { version: 1 });
        assert_eq!(cache.source().load_count(), 1);
    }

    #[test]
    fn test_shift_by_xuid_is_case_insensitive() {
        let cache = controller();
        assert_eq!(
            cache
                .shift_by_xuid("qtr", date(2024, 12, 31), 1)
                .expect("shift"),
            date(2025, 1, 1)
        );
    }

    #[test]
    fn test_reclaim_timeout_with_pinned_views() {
        let cache = controller();
        let v1 = cache.ensure_loaded().expect("load");
        cache.invalidate().expect("v2 into the second slot");
        // v1 is pinned and v2 is current: no slot is free with two slots.
        let err = cache.invalidate().expect_err("no free slot");
        assert!(matches!(err, CalcacheError::Cache(CacheError::LoadFailed { .. })));
        assert_eq!(cache.state(), CacheState::Published { version: 2 });
        drop(v1);
        assert_eq!(cache.invalidate().expect("slot released").version, 3);
    }

    #[test]
    fn test_info_and_calendars() {
        let cache = controller();
        let info = cache.info();
        assert_eq!(info.state, CacheState::Empty);
        assert_eq!(info.version, None);
        assert_eq!(info.slot_count, 2);

        let calendars = cache.calendars().expect("calendars");
        assert_eq!(calendars.len(), 1);
        assert_eq!(calendars[0].xuid, "qtr");
        assert_eq!(calendars[0].entries, 5);

        let info = cache.info();
        assert_eq!(info.version, Some(1));
        assert_eq!(info.slots.len(), 2);
        assert_eq!(
            info.slots
                .iter()
                .filter(|s| s.state == crate::arena::SlotState::Published)
                .count(),
            1
        );
        assert_eq!(info.breakpoint_count, 5);
        assert!(info.used_bytes > 0);
        assert!(info.loaded_at.is_some());
    }

    #[test]
    fn test_page_map_covers_all_breakpoints() {
        let cache = controller();
        let pages = cache.page_map(&CalendarRef::Id(1)).expect("page map");
        assert!(!pages.is_empty());
        assert_eq!(pages.first().map(|p| p.offset), Some(0));
        assert_eq!(pages.last().map(|p| p.offset), Some(5));
        assert!(pages[0].page_start.expect("start") <= date(2024, 1, 1));

        let breakpoints = cache.breakpoints(&CalendarRef::Id(1)).expect("breakpoints");
        assert_eq!(breakpoints.len(), 5);
    }

    #[test]
    fn test_freshness() {
        use chrono::TimeZone;
        let mark = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).single().expect("ts");
        let source = Arc::new(InMemoryCalendarSource::new(
            quarter_snapshot().with_watermark(mark(1)),
        ));
        let cache = CacheController::new(Arc::clone(&source), config()).expect("controller");
        assert_eq!(cache.freshness().expect("freshness"), Freshness::Unknown);

        cache.ensure_loaded().expect("load");
        assert_eq!(
            cache.freshness().expect("freshness"),
            Freshness::Fresh { watermark: mark(1) }
        );

        source.replace(quarter_snapshot().with_watermark(mark(2)));
        assert!(cache.freshness().expect("freshness").is_stale());
        // Staleness is diagnostic only.
        assert_eq!(cache.state(), CacheState::Published { version: 1 });
    }
}
