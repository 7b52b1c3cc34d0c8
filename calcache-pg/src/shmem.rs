//! Shared memory registration for the cache segment.
//!
//! The segment is requested while `shared_preload_libraries` is processed,
//! created once by the postmaster in the startup hook, and inherited by
//! every backend. Backends attach to it by address; nothing in the segment
//! holds a pointer, so the mapping address does not matter.

use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use pgrx::pg_sys;
use pgrx::prelude::*;

use calcache_core::{CacheError, CalcacheResult};
use calcache_storage::SharedSegment;

use crate::gucs;

const SEGMENT_NAME: &std::ffi::CStr = c"calcache segment";

static SEGMENT_BASE: AtomicPtr<u8> = AtomicPtr::new(std::ptr::null_mut());
static SEGMENT_LEN: AtomicUsize = AtomicUsize::new(0);

static mut PREV_SHMEM_REQUEST_HOOK: pg_sys::shmem_request_hook_type = None;
static mut PREV_SHMEM_STARTUP_HOOK: pg_sys::shmem_startup_hook_type = None;

/// Bytes requested from the postmaster, including alignment slack.
fn requested_size() -> usize {
    SharedSegment::required_size(&gucs::cache_config()) + SharedSegment::required_align()
}

/// Install the request and startup hooks. Called from `_PG_init`.
///
/// # Safety
///
/// Must run in the postmaster while shared preload libraries are loaded.
pub unsafe fn install_hooks() {
    PREV_SHMEM_REQUEST_HOOK = pg_sys::shmem_request_hook;
    pg_sys::shmem_request_hook = Some(shmem_request);
    PREV_SHMEM_STARTUP_HOOK = pg_sys::shmem_startup_hook;
    pg_sys::shmem_startup_hook = Some(shmem_startup);
}

#[pg_guard]
unsafe extern "C-unwind" fn shmem_request() {
    if let Some(prev) = PREV_SHMEM_REQUEST_HOOK {
        prev();
    }
    pg_sys::RequestAddinShmemSpace(requested_size());
}

#[pg_guard]
unsafe extern "C-unwind" fn shmem_startup() {
    if let Some(prev) = PREV_SHMEM_STARTUP_HOOK {
        prev();
    }

    let size = requested_size();
    let addin_shmem_init_lock: *mut pg_sys::LWLock =
        &mut (*pg_sys::MainLWLockArray.add(21)).lock;
    pg_sys::LWLockAcquire(addin_shmem_init_lock, pg_sys::LWLockMode::LW_EXCLUSIVE);

    let mut found = false;
    let raw = pg_sys::ShmemInitStruct(SEGMENT_NAME.as_ptr(), size, &mut found) as *mut u8;
    let align = SharedSegment::required_align();
    let base = raw.add(raw.align_offset(align));
    let len = size - (base as usize - raw as usize);

    if !found {
        // First attach: write the control block and free slot headers.
        if let Err(e) = SharedSegment::attach(base, len, &gucs::cache_config(), true) {
            pg_sys::LWLockRelease(addin_shmem_init_lock);
            pgrx::error!("calcache: cannot initialize shared segment: {}", e);
        }
        pgrx::log!("calcache: shared segment initialized ({} bytes)", len);
    }
    pg_sys::LWLockRelease(addin_shmem_init_lock);

    SEGMENT_BASE.store(base, Ordering::Release);
    SEGMENT_LEN.store(len, Ordering::Release);
}

/// Attach this backend to the shared segment.
pub fn attach() -> CalcacheResult<SharedSegment> {
    let base = SEGMENT_BASE.load(Ordering::Acquire);
    if base.is_null() {
        return Err(CacheError::SegmentInvalid {
            reason: "shared segment not created; add calcache_pg to shared_preload_libraries"
                .to_string(),
        }
        .into());
    }
    let len = SEGMENT_LEN.load(Ordering::Acquire);
    // SAFETY: the region was created by `shmem_startup` and stays mapped for
    // the life of the server.
    unsafe { SharedSegment::attach(base, len, &gucs::cache_config(), false) }
}
