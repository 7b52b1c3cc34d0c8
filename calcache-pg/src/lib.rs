//! CALCACHE-PG - PostgreSQL Extension for the Shared Calendar Cache
//!
//! This crate wires the calcache components into PostgreSQL:
//! - A shared memory segment created at postmaster start and attached by
//!   every backend
//! - An SPI calendar source driven by `calcache.q_*` settings
//! - SQL functions for date arithmetic, invalidation and diagnostics
//!
//! The extension must be listed in `shared_preload_libraries`.

use pgrx::pg_sys;
use pgrx::prelude::*;

use calcache_core::{CalcacheError, CalendarRef};
use calcache_storage::CacheController;
use chrono::NaiveDate;
use once_cell::sync::OnceCell;

mod dates;
mod gucs;
mod logging;
mod shmem;
mod source;

pub use source::SpiCalendarSource;

pgrx::pg_module_magic!();

// ============================================================================
// EXTENSION INITIALIZATION
// ============================================================================

#[pg_guard]
pub extern "C-unwind" fn _PG_init() {
    gucs::register();
    logging::install();

    // SAFETY: read-only flag set by the postmaster while loading libraries.
    if !unsafe { pg_sys::process_shared_preload_libraries_in_progress } {
        pgrx::warning!(
            "calcache: calcache_pg is not in shared_preload_libraries, the calendar cache is unavailable"
        );
        return;
    }
    // SAFETY: we are in the postmaster, loading shared preload libraries.
    unsafe { shmem::install_hooks() };
    pgrx::log!("calcache: calendar cache extension loaded");
}

// ============================================================================
// BACKEND CONTROLLER
// ============================================================================

static CACHE: OnceCell<CacheController<SpiCalendarSource>> = OnceCell::new();

/// This backend's controller over the shared segment.
///
/// The first call also registers [`release_on_exit`], so a backend that
/// exits through FATAL or `proc_exit` gives back its pins and the rebuild
/// latch.
fn cache() -> &'static CacheController<SpiCalendarSource> {
    let attached = CACHE.get_or_try_init(|| {
        let segment = shmem::attach()?;
        let cache =
            CacheController::with_segment(segment, SpiCalendarSource::new(), gucs::cache_config())?
                .with_interrupt_check(check_for_interrupts);
        // SAFETY: registering an exit callback from a backend is always allowed.
        unsafe { pg_sys::before_shmem_exit(Some(release_on_exit), pg_sys::Datum::from(0usize)) };
        Ok::<_, CalcacheError>(cache)
    });
    match attached {
        Ok(cache) => cache,
        Err(e) => raise(e),
    }
}

/// Polled while waiting for another backend's rebuild; a pending cancel
/// or termination raises here.
fn check_for_interrupts() {
    pgrx::check_for_interrupts!();
}

#[pg_guard]
unsafe extern "C-unwind" fn release_on_exit(_code: std::os::raw::c_int, _arg: pg_sys::Datum) {
    let Some(cache) = CACHE.get() else {
        return;
    };
    // SAFETY: the backend is exiting; none of its view handles run again.
    let released = unsafe { cache.release_process_holds() };
    if let Some(ticket) = released.latch_ticket {
        pgrx::log!(
            "calcache: backend exited during rebuild {}, rebuild latch released",
            ticket
        );
    }
}

/// Report a calcache error as a PostgreSQL ERROR.
fn raise(e: CalcacheError) -> ! {
    pgrx::error!("calcache: {}", e)
}

fn to_pg_date(date: NaiveDate) -> pgrx::datum::Date {
    match dates::from_naive(date) {
        Some(date) => date,
        None => pgrx::error!("calcache: {} is outside the PostgreSQL date range", date),
    }
}

/// Safely serialize a value to JSON, returning null on failure.
fn safe_to_json<T: serde::Serialize>(value: &T) -> serde_json::Value {
    match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            pgrx::warning!("calcache: JSON serialization failed: {}", e);
            serde_json::Value::Null
        }
    }
}

// ============================================================================
// DATE ARITHMETIC
// ============================================================================

/// Shift through the cache. Infinite dates are returned unchanged.
fn add_days(input_date: pgrx::datum::Date, interval: i32, calendar: CalendarRef) -> pgrx::datum::Date {
    let Some(date) = dates::to_naive(input_date) else {
        return input_date;
    };
    match cache().shift(&calendar, date, interval) {
        Ok(shifted) => to_pg_date(shifted),
        Err(e) => raise(e),
    }
}

/// Move `input_date` by `interval` periods of the calendar with id `calendar_id`.
#[pg_extern(parallel_restricted)]
fn calcache_add_days_by_id(
    input_date: pgrx::datum::Date,
    interval: i32,
    calendar_id: i64,
) -> pgrx::datum::Date {
    add_days(input_date, interval, CalendarRef::Id(calendar_id))
}

/// Move `input_date` by `interval` periods of the calendar named `calendar_name`.
#[pg_extern(parallel_restricted)]
fn calcache_add_days(
    input_date: pgrx::datum::Date,
    interval: i32,
    calendar_name: &str,
) -> pgrx::datum::Date {
    add_days(input_date, interval, CalendarRef::name(calendar_name))
}

/// Move `input_date` by `interval` periods of the calendar with external id
/// `calendar_xuid` (case-insensitive).
#[pg_extern(parallel_restricted)]
fn calcache_add_days_by_xuid(
    input_date: pgrx::datum::Date,
    interval: i32,
    calendar_xuid: &str,
) -> pgrx::datum::Date {
    add_days(input_date, interval, CalendarRef::xuid(calendar_xuid))
}

// ============================================================================
// INVALIDATION
// ============================================================================

/// Reload every calendar and publish a new view.
///
/// Readers keep using the previous view until the new one is published; on
/// failure the previous view stays current and the error is raised.
#[pg_extern(parallel_unsafe)]
fn calcache_invalidate() -> String {
    pgrx::debug1!("calcache: invalidation requested");
    match cache().invalidate() {
        Ok(outcome) => {
            pgrx::log!("calcache: {}", outcome);
            outcome.to_string()
        }
        Err(e) => raise(e),
    }
}

// ============================================================================
// DIAGNOSTICS
// ============================================================================

/// Get the extension version.
#[pg_extern]
fn calcache_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Extension, cache and configuration properties.
#[pg_extern(parallel_restricted)]
fn calcache_info() -> TableIterator<'static, (name!(property, String), name!(value, String))> {
    let info = cache().info();
    let optional = |value: Option<String>| value.unwrap_or_else(|| "-".to_string());

    let mut data: Vec<(String, String)> = vec![
        (
            "PostgreSQL SDK Version".to_string(),
            pg_sys::PG_VERSION_NUM.to_string(),
        ),
        (
            "Extension Version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        (
            "Build Type".to_string(),
            if cfg!(debug_assertions) { "Debug" } else { "Release" }.to_string(),
        ),
        ("Cache State".to_string(), info.state.to_string()),
        (
            "Cache Version".to_string(),
            optional(info.version.map(|v| v.to_string())),
        ),
        ("Calendars".to_string(), info.calendar_count.to_string()),
        ("Entries".to_string(), info.breakpoint_count.to_string()),
        ("Max Calendars".to_string(), info.max_calendars.to_string()),
        (
            "Max Entries per Calendar".to_string(),
            info.max_breakpoints_per_calendar.to_string(),
        ),
        (
            "Current Memory Usage".to_string(),
            format!("{} bytes", info.used_bytes),
        ),
        (
            "Sub-arena Capacity".to_string(),
            format!("{} bytes x {}", info.slot_bytes, info.slot_count),
        ),
        (
            "Shared Segment Size".to_string(),
            format!("{} bytes", info.segment_bytes),
        ),
        (
            "Completed Rebuilds".to_string(),
            info.completed_rebuilds.to_string(),
        ),
        ("Failed Rebuilds".to_string(), info.failed_rebuilds.to_string()),
        (
            "Queued Rebuilds".to_string(),
            info.waiting_rebuilds.to_string(),
        ),
        (
            "Rebuild Owner".to_string(),
            optional(info.rebuild_owner.map(|pid| pid.to_string())),
        ),
        (
            "Loaded At".to_string(),
            optional(info.loaded_at.map(|t| t.to_rfc3339())),
        ),
        (
            "Watermark".to_string(),
            optional(info.watermark.map(|t| t.to_rfc3339())),
        ),
    ];

    for (label, setting) in [
        ("[Q0] Schema Validation", &gucs::SCHEMA_QUERY),
        ("[Q1] Calendars", &gucs::CALENDARS_QUERY),
        ("[Q2] Calendar Entries", &gucs::ENTRIES_QUERY),
        ("[Q3] Watermark", &gucs::WATERMARK_QUERY),
    ] {
        data.push((label.to_string(), optional(gucs::query_text(setting))));
    }

    for slot in &info.slots {
        data.push((
            format!("  Sub-arena {}", slot.slot),
            format!(
                "{:?}, version {}, {} pins, {} bytes",
                slot.state, slot.version, slot.pins, slot.used_bytes
            ),
        ));
    }

    TableIterator::new(data)
}

/// One row per cached calendar.
#[pg_extern(parallel_restricted)]
fn calcache_cache_info() -> TableIterator<
    'static,
    (
        name!(calendar_id, i64),
        name!(calendar_xuid, String),
        name!(calendar_name, String),
        name!(entries, i64),
        name!(first_entry, Option<pgrx::datum::Date>),
        name!(last_entry, Option<pgrx::datum::Date>),
        name!(page_size, i32),
        name!(page_map_entries, i64),
    ),
> {
    let calendars = cache().calendars().unwrap_or_else(|e| raise(e));
    let rows: Vec<_> = calendars
        .into_iter()
        .map(|c| {
            (
                c.id,
                c.xuid,
                c.name,
                c.entries as i64,
                c.first.and_then(dates::from_naive),
                c.last.and_then(dates::from_naive),
                c.page_size,
                c.page_map_entries as i64,
            )
        })
        .collect();
    TableIterator::new(rows)
}

/// Every cached breakpoint, labelled `id (xuid)`.
#[pg_extern(parallel_restricted)]
fn calcache_display_cache(
) -> TableIterator<'static, (name!(calendar, String), name!(entry, pgrx::datum::Date))> {
    let handle = cache().ensure_loaded().unwrap_or_else(|e| raise(e));
    let view = handle.view();
    let mut data: Vec<(String, pgrx::datum::Date)> = vec![];
    for calendar in view.calendars() {
        let label = format!("{} ({})", calendar.id(), calendar.xuid());
        for date in calendar.breakpoints().iter() {
            data.push((label.clone(), to_pg_date(date)));
        }
    }
    TableIterator::new(data)
}

/// Every page map entry, labelled `id (xuid)`.
#[pg_extern(parallel_restricted)]
fn calcache_display_page_map() -> TableIterator<
    'static,
    (
        name!(calendar, String),
        name!(page, i64),
        name!(page_start, Option<pgrx::datum::Date>),
        name!(index, i64),
    ),
> {
    let cache = cache();
    let calendars = cache.calendars().unwrap_or_else(|e| raise(e));
    let mut data = vec![];
    for calendar in calendars {
        let label = format!("{} ({})", calendar.id, calendar.xuid);
        let pages = cache
            .page_map(&CalendarRef::Id(calendar.id))
            .unwrap_or_else(|e| raise(e));
        for entry in pages {
            data.push((
                label.clone(),
                entry.page,
                entry.page_start.and_then(dates::from_naive),
                i64::from(entry.offset),
            ));
        }
    }
    TableIterator::new(data)
}

/// Cache statistics and freshness as JSON.
#[pg_extern(parallel_restricted)]
fn calcache_status() -> pgrx::JsonB {
    let cache = cache();
    let freshness = match cache.freshness() {
        Ok(freshness) => safe_to_json(&freshness),
        Err(e) => {
            pgrx::warning!("calcache: cannot check freshness: {}", e);
            serde_json::Value::Null
        }
    };
    pgrx::JsonB(serde_json::json!({
        "info": safe_to_json(&cache.info()),
        "freshness": freshness,
    }))
}

/// Whether the published view still matches the source watermark.
///
/// Never reloads; returns `fresh`, `stale` or `unknown`.
#[pg_extern(parallel_restricted)]
fn calcache_freshness() -> &'static str {
    match cache().freshness() {
        Ok(calcache_storage::Freshness::Fresh { .. }) => "fresh",
        Ok(calcache_storage::Freshness::Stale { .. }) => "stale",
        Ok(calcache_storage::Freshness::Unknown) => "unknown",
        Err(e) => raise(e),
    }
}

// ============================================================================
// PGRX INTEGRATION TESTS
// ============================================================================

#[cfg(any(test, feature = "pg_test"))]
#[pgrx::pg_schema]
mod tests {
    use pgrx::prelude::*;

    extension_sql_file!("../sql/test_data.sql");

    fn date(y: i32, m: u8, d: u8) -> pgrx::datum::Date {
        pgrx::datum::Date::new(y, m, d).expect("valid date")
    }

    #[pg_test]
    fn test_calcache_version() {
        assert!(!crate::calcache_version().is_empty());
    }

    #[pg_test]
    fn test_add_days_by_name() {
        assert_eq!(
            crate::calcache_add_days(date(2024, 2, 15), 1, "quarter"),
            date(2024, 4, 1)
        );
        assert_eq!(
            crate::calcache_add_days(date(2024, 1, 20), 2, "month"),
            date(2024, 3, 1)
        );
    }

    #[pg_test]
    fn test_add_days_by_id_and_xuid() {
        assert_eq!(
            crate::calcache_add_days_by_id(date(2025, 1, 1), -1, 1),
            date(2024, 10, 1)
        );
        assert_eq!(
            crate::calcache_add_days_by_xuid(date(2024, 2, 15), 0, "QTR-STD"),
            date(2024, 1, 1)
        );
    }

    #[pg_test]
    fn test_infinite_date_passes_through() {
        let infinity = Spi::get_one::<pgrx::datum::Date>("SELECT 'infinity'::date")
            .expect("spi")
            .expect("infinity");
        assert_eq!(crate::calcache_add_days(infinity, 3, "quarter"), infinity);
    }

    #[pg_test(error = "calcache: Lookup error: Calendar not found: calendar name = 'week'")]
    fn test_unknown_calendar_raises() {
        crate::calcache_add_days(date(2024, 1, 1), 0, "week");
    }

    #[pg_test]
    fn test_exit_callback_leaves_cache_usable() {
        crate::calcache_add_days(date(2024, 2, 15), 0, "quarter");
        // Nothing is held between calls, so the callback has nothing to return.
        unsafe { crate::release_on_exit(0, pg_sys::Datum::from(0usize)) };
        let info = crate::cache().info();
        assert_eq!(info.rebuild_owner, None);
        assert!(info.slots.iter().all(|slot| slot.pins == 0));
        assert_eq!(
            crate::calcache_add_days(date(2024, 2, 15), 1, "quarter"),
            date(2024, 4, 1)
        );
    }

    #[pg_test]
    fn test_tracing_events_render_message_and_fields() {
        use std::sync::{Arc, Mutex};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        struct Capture(Arc<Mutex<Vec<String>>>);

        impl<S: tracing::Subscriber> Layer<S> for Capture {
            fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
                let mut text = crate::logging::EventText::default();
                event.record(&mut text);
                self.0.lock().expect("capture lock").push(text.finish());
            }
        }

        let lines = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(Capture(Arc::clone(&lines)));
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(owner = 42u64, reason = "locked", "gave up waiting");
            tracing::info!("calendar cache published");
        });
        let lines = lines.lock().expect("capture lock");
        assert_eq!(
            *lines,
            vec![
                "gave up waiting (owner=42, reason=locked)".to_string(),
                "calendar cache published".to_string(),
            ]
        );
    }

    #[pg_test]
    fn test_invalidate_publishes_new_version() {
        crate::calcache_add_days(date(2024, 2, 15), 0, "quarter");
        let message = crate::calcache_invalidate();
        assert!(message.starts_with("Cache invalidated successfully"));
        let status = crate::calcache_status().0;
        assert_eq!(status["info"]["state"]["state"], "published");
    }
}

/// This module is required by `cargo pgrx test` invocations.
/// It must be visible at the root of your extension crate.
#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {}

    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec!["shared_preload_libraries = 'calcache_pg'"]
    }
}
