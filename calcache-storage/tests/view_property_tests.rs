//! Property-Based Tests for Built Views
//!
//! For any valid snapshot, the view published by the controller holds
//! exactly the source calendars, every index finds every calendar, and the
//! date arithmetic over the stored breakpoints agrees with a plain linear
//! scan of the source data.

use calcache_core::{Breakpoints, CalendarRef};
use calcache_storage::CacheController;
use calcache_test_utils::fixtures::{date, small_config, standard_controller};
use calcache_test_utils::generators::{arb_date, arb_periods, arb_snapshot};
use calcache_test_utils::{CalcacheError, InMemoryCalendarSource, LookupError, SourceSnapshot};
use chrono::NaiveDate;
use proptest::prelude::*;

// ============================================================================
// HELPERS
// ============================================================================

fn controller(snapshot: SourceSnapshot) -> CacheController<InMemoryCalendarSource> {
    CacheController::new(InMemoryCalendarSource::new(snapshot), small_config())
        .expect("valid config")
}

/// Reference slice lookup: index of the last breakpoint `<= date`.
fn linear_slice(breakpoints: &[NaiveDate], date: NaiveDate) -> Option<usize> {
    breakpoints.iter().rposition(|b| *b <= date)
}

// ============================================================================
// PROPERTIES
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every source calendar is stored intact and reachable through every index.
    #[test]
    fn prop_view_round_trips_snapshot(snapshot in arb_snapshot()) {
        let cache = controller(snapshot.clone());
        let handle = cache.ensure_loaded().expect("load");
        let view = handle.view();

        prop_assert_eq!(view.calendar_count(), snapshot.calendars.len());
        prop_assert_eq!(view.breakpoint_count(), snapshot.breakpoint_count());

        for def in &snapshot.calendars {
            let by_id = view.calendar_by_id(def.id).expect("by id");
            let by_name = view.calendar_by_name(&def.name).expect("by name");
            let by_xuid = view.calendar_by_xuid(&def.xuid.to_uppercase()).expect("by xuid");
            prop_assert_eq!(by_name.id(), def.id);
            prop_assert_eq!(by_xuid.id(), def.id);

            let stored: Vec<NaiveDate> = by_id.breakpoints().iter().collect();
            prop_assert_eq!(&stored, &def.breakpoints);
            prop_assert!(stored.windows(2).all(|w| w[0] < w[1]));
        }
    }

    /// Inside the loaded range, shift equals a linear scan plus an index offset.
    #[test]
    fn prop_shift_matches_linear_scan(
        snapshot in arb_snapshot(),
        when in arb_date(),
        periods in arb_periods(),
    ) {
        let cache = controller(snapshot.clone());
        for def in &snapshot.calendars {
            let result = cache.shift_by_id(def.id, when, periods);
            // Past the last breakpoint the slice index is virtual.
            if def.breakpoints.last().map_or(true, |last| when > *last) {
                continue;
            }
            let Some(slice) = linear_slice(&def.breakpoints, when) else {
                continue;
            };
            let target = slice as i64 + i64::from(periods);
            if (0..def.breakpoints.len() as i64).contains(&target) {
                prop_assert_eq!(result, Ok(def.breakpoints[target as usize]));
            }
        }
    }

    /// Floor is stable and shifting back undoes shifting forward.
    #[test]
    fn prop_floor_idempotent_and_shift_inverse(
        snapshot in arb_snapshot(),
        when in arb_date(),
        periods in arb_periods(),
    ) {
        let cache = controller(snapshot.clone());
        let handle = cache.ensure_loaded().expect("load");
        let view = handle.view();
        for def in &snapshot.calendars {
            let entry = view.calendar_by_id(def.id).expect("calendar");
            if entry.breakpoints().len() < 2 {
                continue;
            }
            let Ok(floor) = entry.shift(when, 0) else { continue };
            prop_assert_eq!(entry.shift(floor, 0), Ok(floor));

            if let Ok(moved) = entry.shift(when, periods) {
                if let Ok(back) = entry.shift(moved, -periods) {
                    prop_assert_eq!(back, floor);
                }
            }
        }
    }

    /// Lookups of calendars that do not exist never disturb the published view.
    #[test]
    fn prop_unknown_calendar_is_side_effect_free(
        snapshot in arb_snapshot(),
        name in "[a-z]{1,12}",
    ) {
        let cache = controller(snapshot.clone());
        cache.ensure_loaded().expect("load");
        let before = cache.info();

        if !snapshot.calendars.iter().any(|c| c.name == name) {
            let result = cache.shift_by_name(&name, date(2024, 1, 1), 1);
            prop_assert_eq!(
                result,
                Err(CalcacheError::Lookup(LookupError::CalendarNotFound {
                    calendar: CalendarRef::name(name.clone()),
                }))
            );
        }
        prop_assert_eq!(cache.info(), before);
        prop_assert_eq!(cache.source().load_count(), 1);
    }
}

// ============================================================================
// CALIBRATION SCENARIOS
// ============================================================================

#[test]
fn test_quarter_scenarios() {
    let cache = standard_controller();
    assert_eq!(
        cache.shift_by_name("quarter", date(2024, 2, 15), 0),
        Ok(date(2024, 1, 1))
    );
    assert_eq!(
        cache.shift_by_name("quarter", date(2024, 2, 15), 1),
        Ok(date(2024, 4, 1))
    );
    assert_eq!(
        cache.shift_by_name("quarter", date(2025, 1, 1), -1),
        Ok(date(2024, 10, 1))
    );
}

#[test]
fn test_month_scenario() {
    let cache = standard_controller();
    assert_eq!(
        cache.shift_by_name("month", date(2024, 1, 20), 2),
        Ok(date(2024, 3, 1))
    );
}

#[test]
fn test_unknown_week_calendar() {
    let cache = standard_controller();
    cache.ensure_loaded().expect("load");
    let before = cache.info();
    calcache_test_utils::assertions::assert_not_found(
        &cache.shift_by_name("week", date(2024, 1, 1), 0),
    );
    assert_eq!(cache.info(), before);
}

#[test]
fn test_empty_calendar_error() {
    let cache = standard_controller();
    let result = cache.shift_by_name("empty", date(2024, 1, 1), 0);
    assert!(matches!(
        result,
        Err(CalcacheError::Lookup(LookupError::EmptyCalendar { .. }))
    ));
}

#[test]
fn test_weekly_extrapolates_past_loaded_range() {
    let cache = standard_controller();
    // Last loaded Monday is 2024-12-23; the next two are synthesized.
    assert_eq!(
        cache.shift_by_name("weekly", date(2024, 12, 25), 2),
        Ok(date(2025, 1, 6))
    );
    assert_eq!(
        cache.shift_by_name("weekly", date(2023, 12, 31), 0),
        Ok(date(2023, 12, 25))
    );
}

#[test]
fn test_capacity_limit_rejected_before_publish() {
    let cache = standard_controller();
    cache.ensure_loaded().expect("load");
    let mut snapshot = calcache_test_utils::fixtures::standard_snapshot();
    for id in 100..300 {
        snapshot = snapshot.with_calendar(calcache_test_utils::CalendarDefinition::new(
            id,
            format!("x{id}"),
            format!("n{id}"),
        ));
    }
    cache.source().replace(snapshot);
    calcache_test_utils::assertions::assert_capacity_exceeded(&cache.invalidate());
    assert_eq!(cache.info().version, Some(1));
}
