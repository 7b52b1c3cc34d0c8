//! Server configuration parameters.
//!
//! Segment sizing is fixed at postmaster start: every backend must agree on
//! the layout of the shared region. The source queries are superuser
//! settings so installations with a different schema can re-point the
//! loader without rebuilding the extension.

use std::ffi::CString;
use std::time::Duration;

use pgrx::{GucContext, GucFlags, GucRegistry, GucSetting};

use calcache_core::CacheConfig;

// ============================================================================
// DEFAULT QUERIES
// ============================================================================

const DEFAULT_SCHEMA_QUERY: &std::ffi::CStr = c"SELECT COUNT(table_name) = 2
FROM information_schema.tables
WHERE table_schema = 'plan'
AND (table_name = 'calendar' OR table_name = 'calendar_date')";

const DEFAULT_CALENDARS_QUERY: &std::ffi::CStr = c"SELECT c.id, LOWER(c.xuid), c.name
FROM plan.calendar c
ORDER BY c.id ASC";

const DEFAULT_ENTRIES_QUERY: &std::ffi::CStr = c"SELECT cd.calendar_id, cd.\"date\"
FROM plan.calendar_date cd
ORDER BY cd.calendar_id ASC, cd.\"date\" ASC";

// ============================================================================
// SETTINGS
// ============================================================================

pub static SLOT_SIZE_MB: GucSetting<i32> = GucSetting::<i32>::new(8);
pub static SLOT_COUNT: GucSetting<i32> = GucSetting::<i32>::new(2);
pub static MAX_CALENDARS: GucSetting<i32> = GucSetting::<i32>::new(128);
pub static MAX_ENTRIES_PER_CALENDAR: GucSetting<i32> = GucSetting::<i32>::new(512 * 1024);
pub static RECLAIM_TIMEOUT_MS: GucSetting<i32> = GucSetting::<i32>::new(5_000);
pub static REBUILD_WAIT_MS: GucSetting<i32> = GucSetting::<i32>::new(60_000);

pub static SCHEMA_QUERY: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(Some(DEFAULT_SCHEMA_QUERY));
pub static CALENDARS_QUERY: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(Some(DEFAULT_CALENDARS_QUERY));
pub static ENTRIES_QUERY: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(Some(DEFAULT_ENTRIES_QUERY));
pub static WATERMARK_QUERY: GucSetting<Option<CString>> =
    GucSetting::<Option<CString>>::new(None);

/// Register every `calcache.*` parameter. Called once from `_PG_init`.
pub fn register() {
    GucRegistry::define_int_guc(
        c"calcache.slot_size_mb",
        c"Capacity of one cache sub-arena in megabytes.",
        c"Each published view must fit in one sub-arena.",
        &SLOT_SIZE_MB,
        1,
        1024,
        GucContext::Postmaster,
        GucFlags::empty(),
    );
    GucRegistry::define_int_guc(
        c"calcache.slot_count",
        c"Number of cache sub-arenas in the shared segment.",
        c"Two sub-arenas allow one rebuild while the current view is served.",
        &SLOT_COUNT,
        2,
        calcache_core::MAX_SLOTS as i32,
        GucContext::Postmaster,
        GucFlags::empty(),
    );
    GucRegistry::define_int_guc(
        c"calcache.max_calendars",
        c"Maximum number of calendars in one cached view.",
        c"",
        &MAX_CALENDARS,
        1,
        i32::MAX,
        GucContext::Postmaster,
        GucFlags::empty(),
    );
    GucRegistry::define_int_guc(
        c"calcache.max_entries_per_calendar",
        c"Maximum number of breakpoints per cached calendar.",
        c"",
        &MAX_ENTRIES_PER_CALENDAR,
        1,
        i32::MAX,
        GucContext::Postmaster,
        GucFlags::empty(),
    );
    GucRegistry::define_int_guc(
        c"calcache.reclaim_timeout_ms",
        c"How long a rebuild waits for a retired sub-arena to drain.",
        c"",
        &RECLAIM_TIMEOUT_MS,
        1,
        i32::MAX,
        GucContext::Postmaster,
        GucFlags::empty(),
    );
    GucRegistry::define_int_guc(
        c"calcache.rebuild_wait_ms",
        c"How long a backend waits for another backend's rebuild before failing.",
        c"",
        &REBUILD_WAIT_MS,
        1,
        i32::MAX,
        GucContext::Postmaster,
        GucFlags::empty(),
    );

    GucRegistry::define_string_guc(
        c"calcache.q_schema_validation",
        c"Query returning true when the calendar schema is present.",
        c"",
        &SCHEMA_QUERY,
        GucContext::Suset,
        GucFlags::empty(),
    );
    GucRegistry::define_string_guc(
        c"calcache.q_calendars",
        c"Query returning (id, xuid, name) for every calendar.",
        c"",
        &CALENDARS_QUERY,
        GucContext::Suset,
        GucFlags::empty(),
    );
    GucRegistry::define_string_guc(
        c"calcache.q_calendar_entries",
        c"Query returning (calendar_id, date) ordered by calendar and date.",
        c"",
        &ENTRIES_QUERY,
        GucContext::Suset,
        GucFlags::empty(),
    );
    GucRegistry::define_string_guc(
        c"calcache.q_watermark",
        c"Query returning one timestamptz marking the last change of the calendar data.",
        c"Leave empty when the source does not track changes.",
        &WATERMARK_QUERY,
        GucContext::Suset,
        GucFlags::empty(),
    );
}

/// Cache configuration derived from the postmaster settings.
pub fn cache_config() -> CacheConfig {
    CacheConfig::default()
        .with_slot_bytes(positive(SLOT_SIZE_MB.get()) * 1024 * 1024)
        .with_slot_count(positive(SLOT_COUNT.get()))
        .with_max_calendars(positive(MAX_CALENDARS.get()))
        .with_max_breakpoints_per_calendar(positive(MAX_ENTRIES_PER_CALENDAR.get()))
        .with_reclaim_timeout(millis(RECLAIM_TIMEOUT_MS.get()))
        .with_rebuild_wait_timeout(millis(REBUILD_WAIT_MS.get()))
}

/// Text of a query setting, or `None` when it is unset or blank.
pub fn query_text(setting: &GucSetting<Option<CString>>) -> Option<String> {
    let value = setting.get()?;
    let text = value.to_string_lossy().replace('\n', " ");
    let trimmed = text.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn positive(value: i32) -> usize {
    usize::try_from(value).unwrap_or(0)
}

fn millis(value: i32) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or(0))
}
