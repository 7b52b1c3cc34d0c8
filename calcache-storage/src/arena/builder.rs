//! Serializes a source snapshot into a sub-arena.

use chrono::{DateTime, Utc};

use calcache_core::{normalize_xuid, CalcacheResult, DayNumber, PageMap, SourceSnapshot};

use super::bump::{BumpArena, Span};
use super::layout::{
    self, header, record, DAY_LEN, HEADER_LEN, ID_ENTRY_LEN, LABEL_ENTRY_LEN, NO_TIMESTAMP,
    PAGE_ENTRY_LEN, RECORD_LEN, VIEW_MAGIC,
};

/// Summary of a view written by [`ViewBuilder::build`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltView {
    pub version: u64,
    pub calendar_count: usize,
    pub breakpoint_count: usize,
    pub used_bytes: usize,
}

/// Writes one complete view into a claimed sub-arena.
pub struct ViewBuilder<'a> {
    arena: BumpArena<'a>,
}

impl<'a> ViewBuilder<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            arena: BumpArena::new(buffer),
        }
    }

    /// Lay out `snapshot` as view `version`.
    ///
    /// The snapshot must already have passed [`SourceSnapshot::validate`].
    /// A `CapacityExceeded` error leaves the sub-arena partially written;
    /// it is never published.
    pub fn build(
        mut self,
        snapshot: &SourceSnapshot,
        version: u64,
        loaded_at: DateTime<Utc>,
    ) -> CalcacheResult<BuiltView> {
        let count = snapshot.calendars.len();
        let head = self.arena.alloc(HEADER_LEN, 8)?;
        let records = self.arena.alloc(count * RECORD_LEN, 8)?;

        let mut xuids = Vec::with_capacity(count);
        let mut breakpoint_count = 0usize;
        for (index, calendar) in snapshot.calendars.iter().enumerate() {
            let xuid = normalize_xuid(&calendar.xuid);
            let xuid_span = self.arena.alloc_bytes(xuid.as_bytes())?;
            let name_span = self.arena.alloc_bytes(calendar.name.as_bytes())?;

            let days: Vec<DayNumber> = calendar
                .breakpoints
                .iter()
                .copied()
                .map(DayNumber::from)
                .collect();
            let days_span = self.arena.alloc(days.len() * DAY_LEN, 4)?;
            {
                let out = self.arena.slice_mut(days_span);
                for (i, day) in days.iter().enumerate() {
                    layout::write_i32(out, i * DAY_LEN, day.get());
                }
            }

            let (page_size, first_page, pages_span) = match PageMap::build(&days) {
                Some(map) => {
                    let span = self.arena.alloc(map.offsets.len() * PAGE_ENTRY_LEN, 4)?;
                    let out = self.arena.slice_mut(span);
                    for (i, offset) in map.offsets.iter().enumerate() {
                        layout::write_u32(out, i * PAGE_ENTRY_LEN, *offset);
                    }
                    (map.page_size, map.first_page, span)
                }
                None => (0, 0, self.arena.alloc(0, 4)?),
            };

            let base = records.offset() + index * RECORD_LEN;
            let bytes = self.arena.bytes_mut();
            layout::write_i64(bytes, base + record::ID, calendar.id);
            write_span(bytes, base + record::XUID_OFF, xuid_span, 1);
            write_span(bytes, base + record::NAME_OFF, name_span, 1);
            write_span(bytes, base + record::DAYS_OFF, days_span, DAY_LEN);
            layout::write_i32(bytes, base + record::PAGE_SIZE, page_size);
            layout::write_i32(bytes, base + record::FIRST_PAGE, first_page);
            write_span(bytes, base + record::PAGE_MAP_OFF, pages_span, PAGE_ENTRY_LEN);

            breakpoint_count += days.len();
            xuids.push(xuid);
        }

        // Indexes hold record numbers in lookup order.
        let mut by_id: Vec<usize> = (0..count).collect();
        by_id.sort_by_key(|&i| snapshot.calendars[i].id);
        let id_index = self.arena.alloc(count * ID_ENTRY_LEN, 8)?;
        {
            let out = self.arena.slice_mut(id_index);
            for (slot, &i) in by_id.iter().enumerate() {
                layout::write_i64(out, slot * ID_ENTRY_LEN, snapshot.calendars[i].id);
                layout::write_u32(out, slot * ID_ENTRY_LEN + 8, i as u32);
            }
        }

        let mut by_name: Vec<usize> = (0..count).collect();
        by_name.sort_by(|&a, &b| {
            snapshot.calendars[a]
                .name
                .as_bytes()
                .cmp(snapshot.calendars[b].name.as_bytes())
        });
        let name_index = self.write_label_index(&by_name)?;

        let mut by_xuid: Vec<usize> = (0..count).collect();
        by_xuid.sort_by(|&a, &b| xuids[a].as_bytes().cmp(xuids[b].as_bytes()));
        let xuid_index = self.write_label_index(&by_xuid)?;

        let used_bytes = self.arena.used();
        let bytes = self.arena.bytes_mut();
        let h = head.offset();
        layout::write_u32(bytes, h + header::MAGIC, VIEW_MAGIC);
        layout::write_u32(bytes, h + header::CALENDAR_COUNT, count as u32);
        layout::write_u64(bytes, h + header::VERSION, version);
        layout::write_u64(bytes, h + header::BREAKPOINT_COUNT, breakpoint_count as u64);
        layout::write_i64(
            bytes,
            h + header::WATERMARK_MICROS,
            snapshot
                .watermark
                .map_or(NO_TIMESTAMP, |w| w.timestamp_micros()),
        );
        layout::write_i64(bytes, h + header::LOADED_AT_MICROS, loaded_at.timestamp_micros());
        layout::write_u32(bytes, h + header::RECORDS_OFF, records.offset() as u32);
        layout::write_u32(bytes, h + header::ID_INDEX_OFF, id_index.offset() as u32);
        layout::write_u32(bytes, h + header::NAME_INDEX_OFF, name_index.offset() as u32);
        layout::write_u32(bytes, h + header::XUID_INDEX_OFF, xuid_index.offset() as u32);
        layout::write_u32(bytes, h + header::USED_BYTES, used_bytes as u32);

        Ok(BuiltView {
            version,
            calendar_count: count,
            breakpoint_count,
            used_bytes,
        })
    }

    fn write_label_index(&mut self, order: &[usize]) -> CalcacheResult<Span> {
        let span = self.arena.alloc(order.len() * LABEL_ENTRY_LEN, 4)?;
        let out = self.arena.slice_mut(span);
        for (slot, &i) in order.iter().enumerate() {
            layout::write_u32(out, slot * LABEL_ENTRY_LEN, i as u32);
        }
        Ok(span)
    }
}

/// Store `(offset, element count)` at `at`.
fn write_span(bytes: &mut [u8], at: usize, span: Span, element_len: usize) {
    layout::write_u32(bytes, at, span.offset() as u32);
    layout::write_u32(bytes, at + 4, (span.len() / element_len) as u32);
}

#[cfg(test)]
mod tests {
    use super::*;
    use calcache_core::{CacheError, CalcacheError, CalendarDefinition};
    use chrono::{NaiveDate, TimeZone};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).expect("valid date")
    }

    fn snapshot() -> SourceSnapshot {
        SourceSnapshot::new()
            .with_calendar(
                CalendarDefinition::new(20, "Month-X", "month")
                    .with_breakpoints([date(2024, 1, 1), date(2024, 2, 1), date(2024, 3, 1)]),
            )
            .with_calendar(
                CalendarDefinition::new(10, "quarter-x", "quarter")
                    .with_breakpoints([date(2024, 1, 1), date(2024, 4, 1)]),
            )
            .with_calendar(CalendarDefinition::new(30, "empty-x", "empty"))
    }

    #[test]
    fn test_build_reports_counts() {
        let mut buffer = vec![0u8; 4096];
        let loaded_at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).single().expect("ts");
        let built = ViewBuilder::new(&mut buffer)
            .build(&snapshot(), 7, loaded_at)
            .expect("fits");
        assert_eq!(built.version, 7);
        assert_eq!(built.calendar_count, 3);
        assert_eq!(built.breakpoint_count, 5);
        assert!(built.used_bytes > HEADER_LEN + 3 * RECORD_LEN);

        assert_eq!(layout::read_u32(&buffer, header::MAGIC), VIEW_MAGIC);
        assert_eq!(layout::read_u64(&buffer, header::VERSION), 7);
        assert_eq!(layout::read_i64(&buffer, header::WATERMARK_MICROS), NO_TIMESTAMP);
    }

    #[test]
    fn test_build_sorts_id_index() {
        let mut buffer = vec![0u8; 4096];
        ViewBuilder::new(&mut buffer)
            .build(&snapshot(), 1, Utc::now())
            .expect("fits");
        let index = layout::read_u32(&buffer, header::ID_INDEX_OFF) as usize;
        let ids: Vec<i64> = (0..3)
            .map(|i| layout::read_i64(&buffer, index + i * ID_ENTRY_LEN))
            .collect();
        assert_eq!(ids, vec![10, 20, 30]);
    }

    #[test]
    fn test_build_overflow_is_capacity_exceeded() {
        let mut buffer = vec![0u8; HEADER_LEN + RECORD_LEN];
        let err = ViewBuilder::new(&mut buffer)
            .build(&snapshot(), 1, Utc::now())
            .expect_err("too small");
        assert!(matches!(
            err,
            CalcacheError::Cache(CacheError::CapacityExceeded { .. })
        ));
    }
}
