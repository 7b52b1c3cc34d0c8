//! SPI-backed calendar source.
//!
//! One load runs the schema check, the calendar query and the entry query
//! in the calling backend's transaction. The queries come from the
//! `calcache.q_*` settings.

use chrono::{DateTime, NaiveDate, Utc};
use pgrx::prelude::*;

use calcache_core::{CacheError, CalcacheError, CalcacheResult, CalendarDefinition, SourceSnapshot};
use calcache_storage::CalendarSource;

use crate::{dates, gucs};

/// Reads calendars from the current database through SPI.
#[derive(Debug, Default, Clone, Copy)]
pub struct SpiCalendarSource;

impl SpiCalendarSource {
    pub fn new() -> Self {
        Self
    }

    fn validate_schema(&self) -> CalcacheResult<()> {
        let Some(query) = gucs::query_text(&gucs::SCHEMA_QUERY) else {
            return Ok(());
        };
        match Spi::get_one::<bool>(&query) {
            Ok(Some(true)) => Ok(()),
            Ok(_) => Err(load_failed(
                "the current database does not hold the calendar schema".to_string(),
            )),
            Err(e) => Err(load_failed(format!("cannot validate current database: {e}"))),
        }
    }

    fn load_calendars(&self) -> CalcacheResult<Vec<CalendarDefinition>> {
        let query = required_query(&gucs::CALENDARS_QUERY, "calcache.q_calendars")?;
        Spi::connect(|client| {
            let table = client
                .select(&query, None, &[])
                .map_err(|e| load_failed(format!("cannot read calendars: {e}")))?;
            let mut calendars = Vec::new();
            for row in table {
                let id = row
                    .get::<i64>(1)
                    .map_err(|e| load_failed(format!("calendar id: {e}")))?
                    .ok_or_else(|| load_failed("calendar id cannot be null".to_string()))?;
                let xuid = row
                    .get::<String>(2)
                    .map_err(|e| load_failed(format!("calendar xuid: {e}")))?
                    .ok_or_else(|| load_failed(format!("calendar {id} has a null xuid")))?;
                // A calendar without a name is addressed by its xuid.
                let name = row
                    .get::<String>(3)
                    .map_err(|e| load_failed(format!("calendar name: {e}")))?
                    .unwrap_or_else(|| xuid.clone());
                calendars.push(CalendarDefinition::new(id, xuid, name));
            }
            Ok(calendars)
        })
    }

    /// Attach ordered entries to their calendars. Entries of unknown
    /// calendars are a load error.
    fn load_entries(&self, calendars: &mut [CalendarDefinition]) -> CalcacheResult<usize> {
        let query = required_query(&gucs::ENTRIES_QUERY, "calcache.q_calendar_entries")?;
        calendars.sort_by_key(|c| c.id);
        Spi::connect(|client| {
            let table = client
                .select(&query, None, &[])
                .map_err(|e| load_failed(format!("cannot load calendar entries: {e}")))?;
            let mut total = 0;
            for row in table {
                let id = row
                    .get::<i64>(1)
                    .map_err(|e| load_failed(format!("entry calendar id: {e}")))?
                    .ok_or_else(|| load_failed("entry calendar id cannot be null".to_string()))?;
                let date = row
                    .get::<pgrx::datum::Date>(2)
                    .map_err(|e| load_failed(format!("entry date: {e}")))?
                    .ok_or_else(|| load_failed(format!("calendar {id} has a null entry")))?;
                let date: NaiveDate = dates::to_naive(date).ok_or_else(|| {
                    load_failed(format!("calendar {id} has an infinite entry"))
                })?;
                let index = calendars
                    .binary_search_by_key(&id, |c| c.id)
                    .map_err(|_| load_failed(format!("entries reference unknown calendar {id}")))?;
                calendars[index].breakpoints.push(date);
                total += 1;
            }
            Ok(total)
        })
    }

    fn load_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        let Some(query) = gucs::query_text(&gucs::WATERMARK_QUERY) else {
            return Ok(None);
        };
        let wrapped = format!(
            "SELECT (EXTRACT(EPOCH FROM w) * 1000000)::int8 FROM ({query}) AS q(w) LIMIT 1"
        );
        let micros = Spi::get_one::<i64>(&wrapped)
            .map_err(|e| load_failed(format!("cannot read watermark: {e}")))?;
        Ok(micros.and_then(DateTime::from_timestamp_micros))
    }
}

impl CalendarSource for SpiCalendarSource {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        self.validate_schema()?;
        let mut calendars = self.load_calendars()?;
        let entries = self.load_entries(&mut calendars)?;
        let watermark = self.load_watermark()?;
        pgrx::debug1!(
            "calcache: loaded {} calendars with {} entries",
            calendars.len(),
            entries
        );
        Ok(SourceSnapshot {
            calendars,
            watermark,
        })
    }

    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        self.load_watermark()
    }
}

fn required_query(
    setting: &pgrx::GucSetting<Option<std::ffi::CString>>,
    name: &str,
) -> CalcacheResult<String> {
    gucs::query_text(setting).ok_or_else(|| load_failed(format!("{name} is not set")))
}

fn load_failed(reason: String) -> CalcacheError {
    CacheError::LoadFailed { reason }.into()
}
