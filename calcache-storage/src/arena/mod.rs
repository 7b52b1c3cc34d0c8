//! Offset-addressed shared arena
//!
//! - [`segment`]: the shared region, its control block, pins and rebuild latch
//! - [`bump`]: forward-only allocation inside one sub-arena
//! - [`layout`]: byte layout of a view
//! - [`builder`]: writes a snapshot as a view
//! - [`view`]: reads a published view

pub mod builder;
pub mod bump;
pub mod layout;
pub mod segment;
pub mod view;

pub use builder::{BuiltView, ViewBuilder};
pub use bump::{BumpArena, Span};
pub use segment::{
    InterruptCheck, ReleasedHolds, SharedSegment, SlotState, SEGMENT_LAYOUT_VERSION, SEGMENT_MAGIC,
};
pub use view::{CacheView, CalendarEntry, StoredBreakpoints};
