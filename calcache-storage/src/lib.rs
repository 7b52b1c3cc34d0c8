//! CALCACHE Storage - Shared Arena, Calendar Index and Cache Controller
//!
//! Views of every calendar live in an offset-addressed shared segment so
//! that any number of processes can map it and read the same bytes. The
//! [`CacheController`] rebuilds views copy-on-write and publishes them
//! atomically; [`ViewHandle`]s keep a view alive while it is read.
//!
//! The PostgreSQL glue (shared memory hooks, SPI source, SQL functions)
//! lives in calcache-pg.

pub mod arena;
pub mod controller;
pub mod info;
pub mod source;

pub use arena::{
    BuiltView, BumpArena, CacheView, CalendarEntry, InterruptCheck, ReleasedHolds, SharedSegment,
    SlotState, Span, StoredBreakpoints, ViewBuilder,
};
pub use controller::{CacheController, ViewHandle};
pub use info::{
    CacheInfo, CacheState, CalendarSummary, Freshness, InvalidateOutcome, PageMapEntry, SlotInfo,
};
pub use source::{CalendarSource, InMemoryCalendarSource};
