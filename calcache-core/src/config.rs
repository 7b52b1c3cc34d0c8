//! Configuration types

use crate::{CalcacheResult, ConfigError};
use std::time::Duration;

/// Upper bound on the number of sub-arenas in one shared segment.
pub const MAX_SLOTS: usize = 8;

/// Smallest sub-arena that can hold a view header and a few records.
pub const MIN_SLOT_BYTES: usize = 4096;

/// Sizing and limits of the shared calendar cache.
///
/// The segment holds `slot_count` sub-arenas of `slot_bytes` each. One holds
/// the published view; the others take rebuilds and drain retired views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Capacity of one sub-arena in bytes.
    pub slot_bytes: usize,
    /// Number of sub-arenas (2..=MAX_SLOTS).
    pub slot_count: usize,
    /// Maximum number of calendars in one view.
    pub max_calendars: usize,
    /// Maximum number of breakpoints of a single calendar.
    pub max_breakpoints_per_calendar: usize,
    /// Maximum byte length of a calendar xuid or name.
    pub max_label_len: usize,
    /// How long a rebuild waits for a retired sub-arena to be released.
    pub reclaim_timeout: Duration,
    /// How long a caller waits for another process's rebuild to finish.
    pub rebuild_wait_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            slot_bytes: 8 * 1024 * 1024,
            slot_count: 2,
            max_calendars: 128,
            max_breakpoints_per_calendar: 512 * 1024,
            max_label_len: 128,
            reclaim_timeout: Duration::from_secs(5),
            rebuild_wait_timeout: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot_bytes(mut self, bytes: usize) -> Self {
        self.slot_bytes = bytes;
        self
    }

    pub fn with_slot_count(mut self, count: usize) -> Self {
        self.slot_count = count;
        self
    }

    pub fn with_max_calendars(mut self, max: usize) -> Self {
        self.max_calendars = max;
        self
    }

    pub fn with_max_breakpoints_per_calendar(mut self, max: usize) -> Self {
        self.max_breakpoints_per_calendar = max;
        self
    }

    pub fn with_max_label_len(mut self, max: usize) -> Self {
        self.max_label_len = max;
        self
    }

    pub fn with_reclaim_timeout(mut self, timeout: Duration) -> Self {
        self.reclaim_timeout = timeout;
        self
    }

    pub fn with_rebuild_wait_timeout(mut self, timeout: Duration) -> Self {
        self.rebuild_wait_timeout = timeout;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - slot_count in 2..=MAX_SLOTS
    /// - slot_bytes >= MIN_SLOT_BYTES and addressable with u32 offsets
    /// - all limits and timeouts positive
    pub fn validate(&self) -> CalcacheResult<()> {
        if self.slot_count < 2 || self.slot_count > MAX_SLOTS {
            return Err(invalid(
                "slot_count",
                self.slot_count.to_string(),
                format!("slot_count must be between 2 and {MAX_SLOTS}"),
            ));
        }

        if self.slot_bytes < MIN_SLOT_BYTES || self.slot_bytes > u32::MAX as usize {
            return Err(invalid(
                "slot_bytes",
                self.slot_bytes.to_string(),
                format!("slot_bytes must be between {MIN_SLOT_BYTES} and {}", u32::MAX),
            ));
        }

        if self.max_calendars == 0 {
            return Err(invalid(
                "max_calendars",
                self.max_calendars.to_string(),
                "max_calendars must be greater than 0".to_string(),
            ));
        }

        if self.max_breakpoints_per_calendar == 0 {
            return Err(invalid(
                "max_breakpoints_per_calendar",
                self.max_breakpoints_per_calendar.to_string(),
                "max_breakpoints_per_calendar must be greater than 0".to_string(),
            ));
        }

        if self.max_label_len == 0 {
            return Err(invalid(
                "max_label_len",
                self.max_label_len.to_string(),
                "max_label_len must be greater than 0".to_string(),
            ));
        }

        if self.reclaim_timeout.is_zero() {
            return Err(invalid(
                "reclaim_timeout",
                format!("{:?}", self.reclaim_timeout),
                "reclaim_timeout must be positive".to_string(),
            ));
        }

        if self.rebuild_wait_timeout.is_zero() {
            return Err(invalid(
                "rebuild_wait_timeout",
                format!("{:?}", self.rebuild_wait_timeout),
                "rebuild_wait_timeout must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CALCACHE_SLOT_BYTES`: Capacity of one sub-arena (default: 8 MiB)
    /// - `CALCACHE_SLOT_COUNT`: Number of sub-arenas (default: 2)
    /// - `CALCACHE_MAX_CALENDARS`: Maximum calendars per view (default: 128)
    /// - `CALCACHE_MAX_ENTRIES_PER_CALENDAR`: Maximum breakpoints per calendar (default: 524288)
    /// - `CALCACHE_MAX_LABEL_LEN`: Maximum xuid/name length (default: 128)
    /// - `CALCACHE_RECLAIM_TIMEOUT_MS`: Reclaim wait in milliseconds (default: 5000)
    /// - `CALCACHE_REBUILD_WAIT_MS`: Rebuild latch wait in milliseconds (default: 60000)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            slot_bytes: env_or("CALCACHE_SLOT_BYTES", defaults.slot_bytes),
            slot_count: env_or("CALCACHE_SLOT_COUNT", defaults.slot_count),
            max_calendars: env_or("CALCACHE_MAX_CALENDARS", defaults.max_calendars),
            max_breakpoints_per_calendar: env_or(
                "CALCACHE_MAX_ENTRIES_PER_CALENDAR",
                defaults.max_breakpoints_per_calendar,
            ),
            max_label_len: env_or("CALCACHE_MAX_LABEL_LEN", defaults.max_label_len),
            reclaim_timeout: env_millis("CALCACHE_RECLAIM_TIMEOUT_MS", defaults.reclaim_timeout),
            rebuild_wait_timeout: env_millis(
                "CALCACHE_REBUILD_WAIT_MS",
                defaults.rebuild_wait_timeout,
            ),
        }
    }
}

fn env_or(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn invalid(field: &str, value: String, reason: String) -> crate::CalcacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value,
        reason,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CalcacheError;

    #[test]
    fn test_default_config_is_valid() {
        assert!(CacheConfig::default().validate().is_ok());
    }

    #[test]
    fn test_slot_count_bounds() {
        for count in [0, 1, MAX_SLOTS + 1] {
            let err = CacheConfig::default()
                .with_slot_count(count)
                .validate()
                .expect_err("slot_count out of bounds");
            assert!(matches!(
                err,
                CalcacheError::Config(ConfigError::InvalidValue { ref field, .. }) if field == "slot_count"
            ));
        }
        assert!(CacheConfig::default().with_slot_count(MAX_SLOTS).validate().is_ok());
    }

    #[test]
    fn test_slot_bytes_minimum() {
        let err = CacheConfig::default()
            .with_slot_bytes(MIN_SLOT_BYTES - 1)
            .validate()
            .expect_err("slot too small");
        assert!(err.to_string().contains("slot_bytes"));
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(CacheConfig::default().with_max_calendars(0).validate().is_err());
        assert!(CacheConfig::default()
            .with_max_breakpoints_per_calendar(0)
            .validate()
            .is_err());
        assert!(CacheConfig::default().with_max_label_len(0).validate().is_err());
        assert!(CacheConfig::default()
            .with_reclaim_timeout(Duration::ZERO)
            .validate()
            .is_err());
        assert!(CacheConfig::default()
            .with_rebuild_wait_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_smallest_positive_timeouts_accepted() {
        // One millisecond is the smallest value the host settings allow.
        let config = CacheConfig::default()
            .with_reclaim_timeout(Duration::from_millis(1))
            .with_rebuild_wait_timeout(Duration::from_millis(1));
        assert!(config.validate().is_ok());
    }
}
