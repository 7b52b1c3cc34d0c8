//! Shared segment holding every sub-arena of the calendar cache.
//!
//! The segment is one contiguous region that may be mapped at a different
//! base address in every process attached to it. Nothing inside it stores
//! a pointer: the control block names sub-arenas by index, and everything a
//! view references is an offset from the start of its sub-arena.
//!
//! # Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │ ControlBlock (320 B)                                           │
//! │   magic │ layout │ slot_count │ slot_bytes │ current │ ...     │
//! │   rebuild latch │ latch owner │ last failure                   │
//! ├────────────────────────────────────────────────────────────────┤
//! │ SlotHeader[0..MAX_SLOTS] (64 B each)                           │
//! │   pins │ state │ version │ used_bytes                          │
//! ├────────────────────────────────────────────────────────────────┤
//! │ slot data 0 (slot_bytes)                                       │
//! ├────────────────────────────────────────────────────────────────┤
//! │ ...                                                            │
//! ├────────────────────────────────────────────────────────────────┤
//! │ slot data slot_count-1 (slot_bytes)                            │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Reader Protocol
//!
//! A reader loads `current`, increments the pin count of the slot it names,
//! then loads `current` again. If the word changed the reader unpins and
//! retries without touching the slot data. A rebuild only reuses a slot that
//! is not current and has zero pins, so a validated pin keeps its view
//! readable until it is dropped.
//!
//! `current` packs the view version with the slot index, so a slot that is
//! retired and republished never looks like the view a reader validated.
//!
//! # Process Exit
//!
//! Pins and the rebuild latch are released by guards. A host whose error
//! path exits the process without running destructors calls
//! [`SharedSegment::release_process_holds`] from its exit callback; the
//! latch records the owning process for that purpose. Waiting for the latch
//! is bounded and polls the host's interrupt check, so a lost latch turns
//! into `LoadFailed` instead of a hang.

use std::alloc::{self, Layout};
use std::cell::UnsafeCell;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use calcache_core::{CacheConfig, CacheError, CalcacheResult, MAX_SLOTS};

use crate::info::SlotInfo;

/// Magic bytes identifying an initialized calendar cache segment.
pub const SEGMENT_MAGIC: [u8; 8] = *b"CALCACHE";

/// Current segment format version.
pub const SEGMENT_LAYOUT_VERSION: u32 = 2;

/// Sentinel `current` value meaning "no view published".
const NO_VIEW: u64 = 0;

/// Latch value between winning the latch and drawing a ticket.
const LATCH_PENDING: u64 = u64::MAX;

/// Bytes kept of the latest rebuild failure message.
const FAILURE_REASON_LEN: usize = 192;

/// Sleep between latch and reclaim polls once spinning is exhausted.
const PARK_INTERVAL: Duration = Duration::from_micros(200);

/// Host hook polled while waiting; may unwind to abort the wait.
pub type InterruptCheck = fn();

/// Lifecycle of one sub-arena.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    Free = 0,
    Building = 1,
    Published = 2,
    Retired = 3,
}

impl SlotState {
    fn from_u32(value: u32) -> Self {
        match value {
            1 => Self::Building,
            2 => Self::Published,
            3 => Self::Retired,
            _ => Self::Free,
        }
    }
}

/// Segment-wide state, at offset 0.
#[repr(C, align(64))]
pub(crate) struct ControlBlock {
    magic: [u8; 8],
    layout_version: u32,
    slot_count: u32,
    slot_bytes: u64,
    /// `(version << 8) | (slot + 1)` of the published view, or `NO_VIEW`.
    current: AtomicU64,
    last_version: AtomicU64,
    completed_rebuilds: AtomicU64,
    failed_rebuilds: AtomicU64,
    /// Ticket of the rebuild holding the latch, `LATCH_PENDING` while the
    /// winner draws its ticket, or 0 when free.
    rebuild_latch: AtomicU64,
    waiting_rebuilds: AtomicU32,
    /// Ticket handed to the latest rebuild that took the latch.
    rebuild_tickets: AtomicU64,
    /// Ticket of the latest rebuild that published.
    published_ticket: AtomicU64,
    /// Process id of the latch holder, or 0 when free.
    latch_owner: AtomicU64,
    /// Ticket of the latest rebuild that failed.
    failed_ticket: AtomicU64,
    failure_len: AtomicU32,
    /// UTF-8 message of that failure. Written and read under the latch.
    failure_reason: UnsafeCell<[u8; FAILURE_REASON_LEN]>,
}

const _: () = assert!(size_of::<ControlBlock>() % 64 == 0);

/// Per sub-arena bookkeeping.
#[repr(C, align(64))]
pub(crate) struct SlotHeader {
    pins: AtomicU32,
    state: AtomicU32,
    version: AtomicU64,
    used_bytes: AtomicU64,
}

const _: () = assert!(size_of::<SlotHeader>() == 64);

const DATA_OFFSET: usize = size_of::<ControlBlock>() + MAX_SLOTS * size_of::<SlotHeader>();

fn pack(slot: usize, version: u64) -> u64 {
    (version << 8) | (slot as u64 + 1)
}

fn unpack(word: u64) -> Option<(usize, u64)> {
    if word == NO_VIEW {
        None
    } else {
        Some(((word & 0xFF) as usize - 1, word >> 8))
    }
}

/// The region all sub-arenas live in.
pub struct SharedSegment {
    base: NonNull<u8>,
    len: usize,
    slot_count: usize,
    slot_bytes: usize,
    /// Process id recorded as latch owner.
    process: u64,
    /// Pins held by this process, per slot.
    local_pins: [AtomicU32; MAX_SLOTS],
    /// Set when this segment allocated its own memory.
    owned: Option<Layout>,
}

// The segment only hands out shared references to atomics, and slot bytes
// under the pin/latch protocol described in the module docs.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Bytes a segment needs for `config`.
    pub fn required_size(config: &CacheConfig) -> usize {
        DATA_OFFSET + config.slot_count * config.slot_bytes
    }

    /// Alignment the segment base must have.
    pub fn required_align() -> usize {
        align_of::<ControlBlock>()
    }

    /// Allocate a process-local segment.
    ///
    /// Used by tests and by hosts where every caller is a thread of one
    /// process. Multi-process hosts map shared memory and [`attach`](Self::attach).
    pub fn allocate(config: &CacheConfig) -> CalcacheResult<Self> {
        config.validate()?;
        let size = Self::required_size(config);
        let layout = Layout::from_size_align(size, Self::required_align()).map_err(|e| {
            CacheError::SegmentInvalid {
                reason: format!("cannot lay out {size} bytes: {e}"),
            }
        })?;
        // SAFETY: layout has a non-zero size (DATA_OFFSET > 0).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or(CacheError::CapacityExceeded {
            resource: "segment allocation".to_string(),
            required: size,
            available: 0,
        })?;
        let mut segment = Self {
            base,
            len: size,
            slot_count: config.slot_count,
            slot_bytes: config.slot_bytes,
            process: u64::from(std::process::id()),
            local_pins: Default::default(),
            owned: None,
        };
        // SAFETY: freshly allocated, exclusively owned, correctly sized and aligned.
        unsafe { segment.initialize() };
        segment.owned = Some(layout);
        Ok(segment)
    }

    /// Attach to a region provided by the host (e.g. PostgreSQL shared memory).
    ///
    /// With `initialize` set the control block and slot headers are written;
    /// otherwise they are validated against `config`.
    ///
    /// # Safety
    ///
    /// `base` must point to at least `len` bytes that stay mapped for the
    /// lifetime of the returned segment, and `initialize` must only be set
    /// by the single process creating the region, before any other attach.
    pub unsafe fn attach(
        base: *mut u8,
        len: usize,
        config: &CacheConfig,
        initialize: bool,
    ) -> CalcacheResult<Self> {
        config.validate()?;
        let base = NonNull::new(base).ok_or_else(|| invalid("null segment base".to_string()))?;
        if base.as_ptr() as usize % Self::required_align() != 0 {
            return Err(invalid(format!(
                "segment base is not {}-byte aligned",
                Self::required_align()
            )));
        }
        let required = Self::required_size(config);
        if len < required {
            return Err(CacheError::CapacityExceeded {
                resource: "segment bytes".to_string(),
                required,
                available: len,
            }
            .into());
        }

        let segment = Self {
            base,
            len,
            slot_count: config.slot_count,
            slot_bytes: config.slot_bytes,
            process: u64::from(std::process::id()),
            local_pins: Default::default(),
            owned: None,
        };
        if initialize {
            segment.initialize();
        } else {
            segment.check_header()?;
        }
        Ok(segment)
    }

    /// # Safety
    ///
    /// No other process or thread may be using the region.
    unsafe fn initialize(&self) {
        ptr::write(
            self.base.as_ptr() as *mut ControlBlock,
            ControlBlock {
                magic: SEGMENT_MAGIC,
                layout_version: SEGMENT_LAYOUT_VERSION,
                slot_count: self.slot_count as u32,
                slot_bytes: self.slot_bytes as u64,
                current: AtomicU64::new(NO_VIEW),
                last_version: AtomicU64::new(0),
                completed_rebuilds: AtomicU64::new(0),
                failed_rebuilds: AtomicU64::new(0),
                rebuild_latch: AtomicU64::new(0),
                waiting_rebuilds: AtomicU32::new(0),
                rebuild_tickets: AtomicU64::new(0),
                published_ticket: AtomicU64::new(0),
                latch_owner: AtomicU64::new(0),
                failed_ticket: AtomicU64::new(0),
                failure_len: AtomicU32::new(0),
                failure_reason: UnsafeCell::new([0; FAILURE_REASON_LEN]),
            },
        );
        let headers = self.base.as_ptr().add(size_of::<ControlBlock>()) as *mut SlotHeader;
        for index in 0..MAX_SLOTS {
            ptr::write(
                headers.add(index),
                SlotHeader {
                    pins: AtomicU32::new(0),
                    state: AtomicU32::new(SlotState::Free as u32),
                    version: AtomicU64::new(0),
                    used_bytes: AtomicU64::new(0),
                },
            );
        }
    }

    fn check_header(&self) -> CalcacheResult<()> {
        let control = self.control();
        if control.magic != SEGMENT_MAGIC {
            return Err(invalid("bad magic".to_string()));
        }
        if control.layout_version != SEGMENT_LAYOUT_VERSION {
            return Err(invalid(format!(
                "layout version {} (expected {SEGMENT_LAYOUT_VERSION})",
                control.layout_version
            )));
        }
        if control.slot_count as usize != self.slot_count
            || control.slot_bytes as usize != self.slot_bytes
        {
            return Err(invalid(format!(
                "segment holds {} slots of {} bytes, configuration expects {} of {}",
                control.slot_count, control.slot_bytes, self.slot_count, self.slot_bytes
            )));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    pub(crate) fn control(&self) -> &ControlBlock {
        // SAFETY: the base is aligned and initialized (allocate/attach).
        unsafe { &*(self.base.as_ptr() as *const ControlBlock) }
    }

    pub(crate) fn slot(&self, index: usize) -> &SlotHeader {
        debug_assert!(index < MAX_SLOTS);
        // SAFETY: MAX_SLOTS headers follow the control block.
        unsafe {
            &*(self.base.as_ptr().add(size_of::<ControlBlock>()) as *const SlotHeader).add(index)
        }
    }

    /// Bytes of a published sub-arena.
    ///
    /// # Safety
    ///
    /// The caller holds a validated [`Pin`] on `index`.
    pub(crate) unsafe fn slot_data(&self, index: usize) -> &[u8] {
        std::slice::from_raw_parts(
            self.base.as_ptr().add(DATA_OFFSET + index * self.slot_bytes),
            self.slot_bytes,
        )
    }

    /// Writable bytes of a sub-arena being built.
    ///
    /// # Safety
    ///
    /// The caller holds the rebuild latch and claimed `index` through
    /// [`claim_free_slot`](Self::claim_free_slot), so no reader can reach it.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slot_data_mut(&self, index: usize) -> &mut [u8] {
        std::slice::from_raw_parts_mut(
            self.base.as_ptr().add(DATA_OFFSET + index * self.slot_bytes),
            self.slot_bytes,
        )
    }

    // ------------------------------------------------------------------------
    // Publication
    // ------------------------------------------------------------------------

    /// `(slot, version)` of the published view.
    pub(crate) fn current(&self) -> Option<(usize, u64)> {
        unpack(self.control().current.load(Ordering::Acquire))
    }

    /// Pin the published view, if any.
    pub(crate) fn pin_current(&self) -> Option<Pin<'_>> {
        let control = self.control();
        loop {
            let word = control.current.load(Ordering::SeqCst);
            let (slot, version) = unpack(word)?;
            let header = self.slot(slot);
            header.pins.fetch_add(1, Ordering::SeqCst);
            if control.current.load(Ordering::SeqCst) == word {
                self.local_pins[slot].fetch_add(1, Ordering::Relaxed);
                return Some(Pin {
                    segment: self,
                    slot,
                    version,
                });
            }
            // A rebuild published in between; the slot may already be reused.
            header.pins.fetch_sub(1, Ordering::SeqCst);
            std::hint::spin_loop();
        }
    }

    /// Claim a sub-arena for a rebuild, waiting for retired views to drain.
    ///
    /// Must be called with the rebuild latch held.
    pub(crate) fn claim_free_slot(&self, timeout: Duration) -> CalcacheResult<usize> {
        let started = Instant::now();
        let backoff = Backoff::new();
        let mut warned = false;
        loop {
            let current_slot = self.current().map(|(slot, _)| slot);
            for index in 0..self.slot_count {
                if Some(index) == current_slot {
                    continue;
                }
                let header = self.slot(index);
                if header.pins.load(Ordering::SeqCst) == 0 {
                    header.state.store(SlotState::Building as u32, Ordering::Release);
                    header.used_bytes.store(0, Ordering::Release);
                    return Ok(index);
                }
            }
            if !warned {
                warn!(
                    slots = self.slot_count,
                    "every free arena slot is still pinned, waiting for readers to drain"
                );
                warned = true;
            }
            if started.elapsed() >= timeout {
                return Err(CacheError::LoadFailed {
                    reason: format!(
                        "no arena slot was released by its readers within {timeout:?}"
                    ),
                }
                .into());
            }
            park(&backoff);
        }
    }

    /// Return a claimed slot after a failed build.
    pub(crate) fn abandon_slot(&self, index: usize) {
        self.slot(index)
            .state
            .store(SlotState::Free as u32, Ordering::Release);
    }

    /// Latest ticket handed out.
    #[cfg(test)]
    pub(crate) fn rebuild_ticket(&self) -> u64 {
        self.control().rebuild_tickets.load(Ordering::Acquire)
    }

    /// Ticket of the rebuild that published the current view.
    pub(crate) fn published_ticket(&self) -> u64 {
        self.control().published_ticket.load(Ordering::Acquire)
    }

    /// Make the view in `index` the current one.
    pub(crate) fn publish(
        &self,
        latch: &RebuildLatch<'_>,
        index: usize,
        version: u64,
        used_bytes: usize,
    ) {
        let control = self.control();
        let header = self.slot(index);
        header.version.store(version, Ordering::Release);
        header.used_bytes.store(used_bytes as u64, Ordering::Release);
        header
            .state
            .store(SlotState::Published as u32, Ordering::Release);

        let previous = control.current.swap(pack(index, version), Ordering::SeqCst);
        if let Some((old_slot, _)) = unpack(previous) {
            self.slot(old_slot)
                .state
                .store(SlotState::Retired as u32, Ordering::Release);
        }
        control.last_version.store(version, Ordering::Release);
        control.published_ticket.store(latch.ticket, Ordering::Release);
        control.completed_rebuilds.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn next_version(&self) -> u64 {
        self.control().last_version.load(Ordering::Acquire) + 1
    }

    /// Count a failed rebuild and keep its message for coalesced waiters.
    pub(crate) fn record_failed_rebuild(&self, latch: &RebuildLatch<'_>, reason: &str) {
        let control = self.control();
        let mut end = reason.len().min(FAILURE_REASON_LEN);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }
        // SAFETY: the latch is held, so no other writer or reader exists.
        unsafe {
            (&mut (*control.failure_reason.get()))[..end].copy_from_slice(&reason.as_bytes()[..end]);
        }
        control.failure_len.store(end as u32, Ordering::Release);
        control.failed_ticket.store(latch.ticket, Ordering::Release);
        control.failed_rebuilds.fetch_add(1, Ordering::AcqRel);
    }

    /// Message of the latest failed rebuild if its ticket is above `threshold`.
    pub(crate) fn failure_since(
        &self,
        _latch: &RebuildLatch<'_>,
        threshold: u64,
    ) -> Option<String> {
        let control = self.control();
        if control.failed_ticket.load(Ordering::Acquire) <= threshold {
            return None;
        }
        let len = (control.failure_len.load(Ordering::Acquire) as usize).min(FAILURE_REASON_LEN);
        // SAFETY: the latch is held, so the message is not being written.
        let bytes = unsafe { &(&(*control.failure_reason.get()))[..len] };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    pub(crate) fn completed_rebuilds(&self) -> u64 {
        self.control().completed_rebuilds.load(Ordering::Acquire)
    }

    pub(crate) fn failed_rebuilds(&self) -> u64 {
        self.control().failed_rebuilds.load(Ordering::Acquire)
    }

    pub(crate) fn waiting_rebuilds(&self) -> u32 {
        self.control().waiting_rebuilds.load(Ordering::Acquire)
    }

    pub(crate) fn slot_state(&self, index: usize) -> SlotState {
        SlotState::from_u32(self.slot(index).state.load(Ordering::Acquire))
    }

    pub(crate) fn slot_pins(&self, index: usize) -> u32 {
        self.slot(index).pins.load(Ordering::Acquire)
    }

    /// Point-in-time view of every sub-arena header.
    pub(crate) fn slot_infos(&self) -> Vec<SlotInfo> {
        (0..self.slot_count)
            .map(|index| {
                let header = self.slot(index);
                SlotInfo {
                    slot: index,
                    state: self.slot_state(index),
                    pins: self.slot_pins(index),
                    version: header.version.load(Ordering::Acquire),
                    used_bytes: header.used_bytes.load(Ordering::Acquire) as usize,
                }
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Rebuild latch
    // ------------------------------------------------------------------------

    pub(crate) fn rebuild_in_progress(&self) -> bool {
        self.control().rebuild_latch.load(Ordering::Acquire) != 0
    }

    /// Tickets above this belong to rebuilds that were in flight when this
    /// was called, or started after.
    pub(crate) fn coalesce_threshold(&self) -> u64 {
        let control = self.control();
        // Tickets are only drawn by the latch holder, so a holder equal to
        // the ticket count read first was already running.
        let issued = control.rebuild_tickets.load(Ordering::SeqCst);
        let backoff = Backoff::new();
        let holder = loop {
            match control.rebuild_latch.load(Ordering::SeqCst) {
                LATCH_PENDING => backoff.snooze(),
                holder => break holder,
            }
        };
        if holder != 0 && holder == issued {
            issued - 1
        } else {
            issued
        }
    }

    /// Process id of the latch holder, if any.
    pub(crate) fn latch_owner(&self) -> Option<u64> {
        match self.control().latch_owner.load(Ordering::Acquire) {
            0 => None,
            owner => Some(owner),
        }
    }

    /// Wait until this caller is the only rebuilder.
    ///
    /// Gives up with `LoadFailed` after `timeout`. `interrupt`, when set, is
    /// called on every poll and may unwind out of the wait.
    pub(crate) fn lock_rebuild(
        &self,
        timeout: Duration,
        interrupt: Option<InterruptCheck>,
    ) -> CalcacheResult<RebuildLatch<'_>> {
        let control = self.control();
        let waiting = Waiting::enter(&control.waiting_rebuilds);
        let started = Instant::now();
        let backoff = Backoff::new();
        while control
            .rebuild_latch
            .compare_exchange_weak(0, LATCH_PENDING, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            if let Some(check) = interrupt {
                check();
            }
            if started.elapsed() >= timeout {
                let owner = control.latch_owner.load(Ordering::Acquire);
                warn!(owner, ?timeout, "gave up waiting for the rebuild latch");
                return Err(CacheError::LoadFailed {
                    reason: format!(
                        "rebuild latch held by process {owner} for longer than {timeout:?}"
                    ),
                }
                .into());
            }
            park(&backoff);
        }
        drop(waiting);
        let ticket = control.rebuild_tickets.fetch_add(1, Ordering::SeqCst) + 1;
        control.latch_owner.store(self.process, Ordering::SeqCst);
        control.rebuild_latch.store(ticket, Ordering::SeqCst);
        Ok(RebuildLatch {
            segment: self,
            ticket,
        })
    }

    /// Drop every shared hold of this process: its pins and, if this process
    /// owns it, the rebuild latch.
    ///
    /// For exit paths that skip destructors.
    ///
    /// # Safety
    ///
    /// No [`Pin`] or latch guard of this process may be used or dropped
    /// afterwards. Call it only while the process is exiting.
    pub unsafe fn release_process_holds(&self) -> ReleasedHolds {
        let mut released = ReleasedHolds::default();
        for (index, local) in self.local_pins.iter().enumerate().take(self.slot_count) {
            let held = local.swap(0, Ordering::AcqRel);
            if held > 0 {
                self.slot(index).pins.fetch_sub(held, Ordering::SeqCst);
                released.pins += held;
            }
        }

        let control = self.control();
        if control.latch_owner.load(Ordering::Acquire) == self.process {
            let ticket = control.rebuild_latch.load(Ordering::Acquire);
            control.latch_owner.store(0, Ordering::SeqCst);
            control.rebuild_latch.store(0, Ordering::SeqCst);
            control.failed_rebuilds.fetch_add(1, Ordering::AcqRel);
            released.latch_ticket = Some(ticket);
        }
        if released.pins > 0 || released.latch_ticket.is_some() {
            debug!(
                pins = released.pins,
                latch_ticket = ?released.latch_ticket,
                "released shared holds of an exiting process"
            );
        }
        released
    }
}

/// What [`SharedSegment::release_process_holds`] gave back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReleasedHolds {
    pub pins: u32,
    /// Ticket of the abandoned rebuild, if this process held the latch.
    pub latch_ticket: Option<u64>,
}

/// Counts a caller in `waiting_rebuilds` until dropped, including on unwind.
struct Waiting<'a>(&'a AtomicU32);

impl<'a> Waiting<'a> {
    fn enter(counter: &'a AtomicU32) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spin and yield through `backoff`, then sleep once it is exhausted.
fn park(backoff: &Backoff) {
    if backoff.is_completed() {
        thread::sleep(PARK_INTERVAL);
    } else {
        backoff.snooze();
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        if let Some(layout) = self.owned.take() {
            // SAFETY: allocated in `allocate` with this layout; no pins can
            // outlive the segment borrow.
            unsafe { alloc::dealloc(self.base.as_ptr(), layout) };
        }
    }
}

impl std::fmt::Debug for SharedSegment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedSegment")
            .field("len", &self.len)
            .field("slot_count", &self.slot_count)
            .field("slot_bytes", &self.slot_bytes)
            .field("current", &self.current())
            .finish()
    }
}

fn invalid(reason: String) -> calcache_core::CalcacheError {
    CacheError::SegmentInvalid { reason }.into()
}

/// A reader's hold on one published sub-arena.
pub(crate) struct Pin<'a> {
    segment: &'a SharedSegment,
    slot: usize,
    version: u64,
}

impl<'a> Pin<'a> {
    pub(crate) fn slot(&self) -> usize {
        self.slot
    }

    pub(crate) fn version(&self) -> u64 {
        self.version
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        // SAFETY: this pin was validated against `current`.
        unsafe { self.segment.slot_data(self.slot) }
    }
}

impl Drop for Pin<'_> {
    fn drop(&mut self) {
        self.segment.local_pins[self.slot].fetch_sub(1, Ordering::Relaxed);
        self.segment
            .slot(self.slot)
            .pins
            .fetch_sub(1, Ordering::SeqCst);
    }
}

/// Exclusive right to rebuild; released on drop, including unwinding.
pub(crate) struct RebuildLatch<'a> {
    segment: &'a SharedSegment,
    ticket: u64,
}

impl RebuildLatch<'_> {
    pub(crate) fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl Drop for RebuildLatch<'_> {
    fn drop(&mut self) {
        let control = self.segment.control();
        control.latch_owner.store(0, Ordering::Release);
        control.rebuild_latch.store(0, Ordering::Release);
    }
}
