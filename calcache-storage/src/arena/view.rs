//! Read-only access to a published view.
//!
//! Every accessor decodes straight from the sub-arena bytes; nothing is
//! copied out except the values returned.

use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, Utc};

use calcache_core::{
    normalize_xuid, page_window, shift, Breakpoints, CalendarId, CalendarRef, DayNumber,
    LookupError, ShiftError,
};

use super::layout::{
    self, header, record, DAY_LEN, ID_ENTRY_LEN, LABEL_ENTRY_LEN, NO_TIMESTAMP, PAGE_ENTRY_LEN,
    RECORD_LEN, VIEW_MAGIC,
};
use crate::info::CalendarSummary;

/// One immutable view: every calendar and its indexes.
#[derive(Clone, Copy)]
pub struct CacheView<'a> {
    bytes: &'a [u8],
}

impl<'a> CacheView<'a> {
    /// Wrap the bytes of a sub-arena holding a built view.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// True when the bytes start with a built view header.
    pub fn is_valid(&self) -> bool {
        self.bytes.len() >= layout::HEADER_LEN
            && layout::read_u32(self.bytes, header::MAGIC) == VIEW_MAGIC
    }

    pub fn version(&self) -> u64 {
        layout::read_u64(self.bytes, header::VERSION)
    }

    pub fn calendar_count(&self) -> usize {
        layout::read_u32(self.bytes, header::CALENDAR_COUNT) as usize
    }

    pub fn breakpoint_count(&self) -> usize {
        layout::read_u64(self.bytes, header::BREAKPOINT_COUNT) as usize
    }

    pub fn used_bytes(&self) -> usize {
        layout::read_u32(self.bytes, header::USED_BYTES) as usize
    }

    /// Source watermark captured by the load that built this view.
    pub fn watermark(&self) -> Option<DateTime<Utc>> {
        timestamp(layout::read_i64(self.bytes, header::WATERMARK_MICROS))
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        timestamp(layout::read_i64(self.bytes, header::LOADED_AT_MICROS))
    }

    // ------------------------------------------------------------------------
    // Index lookups
    // ------------------------------------------------------------------------

    pub fn calendar_by_id(&self, id: CalendarId) -> Option<CalendarEntry<'a>> {
        let index = layout::read_u32(self.bytes, header::ID_INDEX_OFF) as usize;
        let slot = binary_search(self.calendar_count(), |slot| {
            layout::read_i64(self.bytes, index + slot * ID_ENTRY_LEN).cmp(&id)
        })?;
        let record = layout::read_u32(self.bytes, index + slot * ID_ENTRY_LEN + 8);
        Some(self.record(record as usize))
    }

    /// Exact, case-sensitive name match.
    pub fn calendar_by_name(&self, name: &str) -> Option<CalendarEntry<'a>> {
        self.search_labels(header::NAME_INDEX_OFF, name.as_bytes(), CalendarEntry::name)
    }

    /// Case-insensitive xuid match.
    pub fn calendar_by_xuid(&self, xuid: &str) -> Option<CalendarEntry<'a>> {
        let needle = normalize_xuid(xuid);
        self.search_labels(header::XUID_INDEX_OFF, needle.as_bytes(), CalendarEntry::xuid)
    }

    pub fn resolve(&self, calendar: &CalendarRef) -> Result<CalendarEntry<'a>, LookupError> {
        let found = match calendar {
            CalendarRef::Id(id) => self.calendar_by_id(*id),
            CalendarRef::Name(name) => self.calendar_by_name(name),
            CalendarRef::Xuid(xuid) => self.calendar_by_xuid(xuid),
        };
        found.ok_or_else(|| LookupError::CalendarNotFound {
            calendar: calendar.clone(),
        })
    }

    /// Shift `date` by `periods` periods of the named calendar.
    pub fn shift(
        &self,
        calendar: &CalendarRef,
        date: NaiveDate,
        periods: i32,
    ) -> Result<NaiveDate, LookupError> {
        self.resolve(calendar)?
            .shift(date, periods)
            .map_err(|e| e.for_calendar(calendar.clone()))
    }

    /// All calendars in id order.
    pub fn calendars(&self) -> impl Iterator<Item = CalendarEntry<'a>> + 'a {
        let view = *self;
        let index = layout::read_u32(self.bytes, header::ID_INDEX_OFF) as usize;
        (0..self.calendar_count()).map(move |slot| {
            let record = layout::read_u32(view.bytes, index + slot * ID_ENTRY_LEN + 8);
            view.record(record as usize)
        })
    }

    fn record(&self, index: usize) -> CalendarEntry<'a> {
        let records = layout::read_u32(self.bytes, header::RECORDS_OFF) as usize;
        CalendarEntry {
            bytes: self.bytes,
            base: records + index * RECORD_LEN,
        }
    }

    fn search_labels(
        &self,
        index_field: usize,
        needle: &[u8],
        label: fn(&CalendarEntry<'a>) -> &'a str,
    ) -> Option<CalendarEntry<'a>> {
        let index = layout::read_u32(self.bytes, index_field) as usize;
        let entry_at = |slot: usize| {
            self.record(layout::read_u32(self.bytes, index + slot * LABEL_ENTRY_LEN) as usize)
        };
        let slot = binary_search(self.calendar_count(), |slot| {
            label(&entry_at(slot)).as_bytes().cmp(needle)
        })?;
        Some(entry_at(slot))
    }
}

impl std::fmt::Debug for CacheView<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheView")
            .field("version", &self.version())
            .field("calendars", &self.calendar_count())
            .field("breakpoints", &self.breakpoint_count())
            .finish()
    }
}

fn timestamp(micros: i64) -> Option<DateTime<Utc>> {
    if micros == NO_TIMESTAMP {
        None
    } else {
        DateTime::from_timestamp_micros(micros)
    }
}

/// Position of the element for which `compare` returns `Equal`.
fn binary_search(len: usize, compare: impl Fn(usize) -> Ordering) -> Option<usize> {
    let (mut lo, mut hi) = (0usize, len);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        match compare(mid) {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Some(mid),
        }
    }
    None
}

// ============================================================================
// CALENDAR ENTRY
// ============================================================================

/// One calendar record of a view.
#[derive(Clone, Copy)]
pub struct CalendarEntry<'a> {
    bytes: &'a [u8],
    base: usize,
}

impl<'a> CalendarEntry<'a> {
    pub fn id(&self) -> CalendarId {
        layout::read_i64(self.bytes, self.base + record::ID)
    }

    /// Normalized (lowercase) xuid.
    pub fn xuid(&self) -> &'a str {
        self.label(record::XUID_OFF)
    }

    pub fn name(&self) -> &'a str {
        self.label(record::NAME_OFF)
    }

    pub fn len(&self) -> usize {
        self.field(record::DAYS_LEN)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_size(&self) -> i32 {
        layout::read_i32(self.bytes, self.base + record::PAGE_SIZE)
    }

    pub fn first_page(&self) -> i32 {
        layout::read_i32(self.bytes, self.base + record::FIRST_PAGE)
    }

    pub fn breakpoints(&self) -> StoredBreakpoints<'a> {
        let days = self.field(record::DAYS_OFF);
        let pages = self.field(record::PAGE_MAP_OFF);
        let page_entries = self.field(record::PAGE_MAP_LEN);
        StoredBreakpoints {
            days: &self.bytes[days..days + self.len() * DAY_LEN],
            pages: &self.bytes[pages..pages + page_entries * PAGE_ENTRY_LEN],
            page_size: self.page_size(),
            first_page: self.first_page(),
        }
    }

    pub fn first(&self) -> Option<NaiveDate> {
        let breakpoints = self.breakpoints();
        (!breakpoints.is_empty())
            .then(|| breakpoints.day_at(0).to_date())
            .flatten()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        let breakpoints = self.breakpoints();
        let len = breakpoints.len();
        (len > 0)
            .then(|| breakpoints.day_at(len - 1).to_date())
            .flatten()
    }

    pub fn shift(&self, date: NaiveDate, periods: i32) -> Result<NaiveDate, ShiftError> {
        shift(&self.breakpoints(), date, periods)
    }

    pub fn summary(&self) -> CalendarSummary {
        CalendarSummary {
            id: self.id(),
            xuid: self.xuid().to_string(),
            name: self.name().to_string(),
            entries: self.len(),
            first: self.first(),
            last: self.last(),
            page_size: self.page_size(),
            page_map_entries: self.breakpoints().page_entries(),
        }
    }

    fn field(&self, offset: usize) -> usize {
        layout::read_u32(self.bytes, self.base + offset) as usize
    }

    /// String at the `(offset, len)` pair starting at `field`.
    fn label(&self, field: usize) -> &'a str {
        let offset = self.field(field);
        let len = self.field(field + 4);
        std::str::from_utf8(&self.bytes[offset..offset + len]).unwrap_or_default()
    }
}

impl std::fmt::Debug for CalendarEntry<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CalendarEntry")
            .field("id", &self.id())
            .field("xuid", &self.xuid())
            .field("name", &self.name())
            .field("entries", &self.len())
            .finish()
    }
}

/// Breakpoints of one calendar, decoded on demand.
#[derive(Clone, Copy)]
pub struct StoredBreakpoints<'a> {
    days: &'a [u8],
    pages: &'a [u8],
    page_size: i32,
    first_page: i32,
}

impl<'a> StoredBreakpoints<'a> {
    pub fn iter(&self) -> impl Iterator<Item = NaiveDate> + 'a {
        let days = self.days;
        (0..days.len() / DAY_LEN)
            .filter_map(move |i| DayNumber::new(layout::read_i32(days, i * DAY_LEN)).to_date())
    }

    /// Number of page map entries (pages + 1, or 0 for an empty calendar).
    pub fn page_entries(&self) -> usize {
        self.pages.len() / PAGE_ENTRY_LEN
    }

    /// Page map offsets: `offsets[p]` breakpoints start before page `p`.
    pub fn page_offsets(&self) -> impl Iterator<Item = u32> + 'a {
        let pages = self.pages;
        (0..pages.len() / PAGE_ENTRY_LEN).map(move |p| layout::read_u32(pages, p * PAGE_ENTRY_LEN))
    }
}

impl Breakpoints for StoredBreakpoints<'_> {
    fn len(&self) -> usize {
        self.days.len() / DAY_LEN
    }

    fn day_at(&self, index: usize) -> DayNumber {
        DayNumber::new(layout::read_i32(self.days, index * DAY_LEN))
    }

    fn search_window(&self, day: DayNumber) -> (usize, usize) {
        let entries = self.page_entries();
        if entries == 0 || self.page_size <= 0 {
            return (0, self.len());
        }
        page_window(
            self.page_size,
            self.first_page,
            entries - 1,
            |page| layout::read_u32(self.pages, page * PAGE_ENTRY_LEN) as usize,
            day,
        )
    }
}
