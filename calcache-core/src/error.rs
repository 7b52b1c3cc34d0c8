//! Error types for calcache operations

use crate::CalendarRef;
use thiserror::Error;

/// Query-time errors. None of them touch the published view.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LookupError {
    #[error("Calendar not found: {calendar}")]
    CalendarNotFound { calendar: CalendarRef },

    #[error("Calendar has no breakpoints: {calendar}")]
    EmptyCalendar { calendar: CalendarRef },

    #[error("Date out of range for {calendar}: {reason}")]
    DateOutOfRange { calendar: CalendarRef, reason: String },
}

/// Load and rebuild errors. The previously published view stays in effect.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache capacity exceeded for {resource}: required {required}, available {available}")]
    CapacityExceeded {
        resource: String,
        required: usize,
        available: usize,
    },

    #[error("Cache load failed: {reason}")]
    LoadFailed { reason: String },

    #[error("Shared segment invalid: {reason}")]
    SegmentInvalid { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Failures of the date arithmetic engine, before calendar context is attached.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ShiftError {
    #[error("calendar has no breakpoints")]
    EmptyCalendar,

    #[error("{reason}")]
    OutOfRange { reason: String },
}

impl ShiftError {
    /// Attach the calendar the shift was requested against.
    pub fn for_calendar(self, calendar: CalendarRef) -> LookupError {
        match self {
            Self::EmptyCalendar => LookupError::EmptyCalendar { calendar },
            Self::OutOfRange { reason } => LookupError::DateOutOfRange { calendar, reason },
        }
    }
}

/// Master error type for all calcache errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CalcacheError {
    #[error("Lookup error: {0}")]
    Lookup(#[from] LookupError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CalcacheError {
    /// True for errors a rebuild can raise; the caller keeps the last good view.
    pub fn is_load_error(&self) -> bool {
        matches!(self, Self::Cache(_))
    }
}

/// Result type alias for calcache operations.
pub type CalcacheResult<T> = Result<T, CalcacheError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_error_display_not_found() {
        let err = LookupError::CalendarNotFound {
            calendar: CalendarRef::name("week"),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Calendar not found"));
        assert!(msg.contains("'week'"));
    }

    #[test]
    fn test_cache_error_display_capacity() {
        let err = CacheError::CapacityExceeded {
            resource: "arena bytes".to_string(),
            required: 4096,
            available: 1024,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("arena bytes"));
        assert!(msg.contains("4096"));
        assert!(msg.contains("1024"));
    }

    #[test]
    fn test_shift_error_for_calendar() {
        let empty = ShiftError::EmptyCalendar.for_calendar(CalendarRef::Id(3));
        assert_eq!(
            empty,
            LookupError::EmptyCalendar {
                calendar: CalendarRef::Id(3)
            }
        );

        let out = ShiftError::OutOfRange {
            reason: "single breakpoint".to_string(),
        }
        .for_calendar(CalendarRef::Id(3));
        assert!(matches!(out, LookupError::DateOutOfRange { .. }));
        assert!(out.to_string().contains("single breakpoint"));
    }

    #[test]
    fn test_calcache_error_from_variants() {
        let lookup = CalcacheError::from(LookupError::CalendarNotFound {
            calendar: CalendarRef::Id(1),
        });
        assert!(matches!(lookup, CalcacheError::Lookup(_)));
        assert!(!lookup.is_load_error());

        let cache = CalcacheError::from(CacheError::LoadFailed {
            reason: "spi".to_string(),
        });
        assert!(matches!(cache, CalcacheError::Cache(_)));
        assert!(cache.is_load_error());

        let config = CalcacheError::from(ConfigError::InvalidValue {
            field: "slot_count".to_string(),
            value: "1".to_string(),
            reason: "too small".to_string(),
        });
        assert!(matches!(config, CalcacheError::Config(_)));
    }
}
