//! Calendar source abstraction and the in-memory implementation.
//!
//! The cache never talks to the source store directly. A load pass goes
//! through [`CalendarSource`]; the PostgreSQL implementation (SPI queries)
//! lives in calcache-pg.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};

use calcache_core::{CacheError, CalcacheResult, SourceSnapshot};

// ============================================================================
// SOURCE TRAIT
// ============================================================================

/// Where calendar definitions come from.
pub trait CalendarSource: Send + Sync {
    /// Read every calendar with its ordered breakpoints in one pass.
    fn load(&self) -> CalcacheResult<SourceSnapshot>;

    /// Current watermark of the source dataset, if the source tracks one.
    ///
    /// Only used for diagnostics; a mismatch never triggers a rebuild.
    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        Ok(None)
    }
}

impl<T: CalendarSource + ?Sized> CalendarSource for Arc<T> {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        (**self).load()
    }

    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        (**self).current_watermark()
    }
}

impl<T: CalendarSource + ?Sized> CalendarSource for &T {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        (**self).load()
    }

    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        (**self).current_watermark()
    }
}

// ============================================================================
// IN-MEMORY SOURCE
// ============================================================================

/// In-memory source for testing and embedding.
///
/// The snapshot can be swapped between loads, and a failure can be injected
/// to exercise the "keep the last good view" paths.
#[derive(Debug, Default)]
pub struct InMemoryCalendarSource {
    snapshot: RwLock<SourceSnapshot>,
    failure: RwLock<Option<String>>,
    loads: AtomicU64,
}

impl InMemoryCalendarSource {
    pub fn new(snapshot: SourceSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(snapshot),
            failure: RwLock::new(None),
            loads: AtomicU64::new(0),
        }
    }

    /// Replace the dataset the next load will see.
    pub fn replace(&self, snapshot: SourceSnapshot) {
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot;
    }

    /// Make every following load fail with `reason`.
    pub fn fail_with(&self, reason: impl Into<String>) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = Some(reason.into());
    }

    /// Stop injecting failures.
    pub fn recover(&self) {
        *self.failure.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of load passes attempted, failed ones included.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::SeqCst)
    }
}

impl CalendarSource for InMemoryCalendarSource {
    fn load(&self) -> CalcacheResult<SourceSnapshot> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(reason) = self
            .failure
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return Err(CacheError::LoadFailed { reason }.into());
        }
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn current_watermark(&self) -> CalcacheResult<Option<DateTime<Utc>>> {
        Ok(self
            .snapshot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .watermark)
    }
}
