//! Bump allocator over one sub-arena.
//!
//! Allocation only moves the head forward; a rebuild starts a fresh arena
//! over a reclaimed sub-arena, so nothing is ever freed individually.
//!
//! ```text
//! sub-arena: [header][records][xuid][name][days][pages]...[free space]
//!                                                         ^ head
//! ```

use calcache_core::{CacheError, CalcacheResult};

/// Offset and length of an allocated region, relative to the sub-arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    offset: u32,
    len: u32,
}

impl Span {
    pub const fn offset(self) -> usize {
        self.offset as usize
    }

    pub const fn len(self) -> usize {
        self.len as usize
    }

    pub const fn is_empty(self) -> bool {
        self.len == 0
    }

    pub const fn end(self) -> usize {
        self.offset as usize + self.len as usize
    }
}

/// Forward-only allocator writing into a borrowed byte region.
pub struct BumpArena<'a> {
    buffer: &'a mut [u8],
    head: usize,
}

impl<'a> BumpArena<'a> {
    /// Wrap `buffer`; its length must fit in a `u32`.
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self { buffer, head: 0 }
    }

    /// Reserve `len` bytes aligned to `align` (a power of two).
    ///
    /// Fails with `CapacityExceeded` when the region is too small; the arena
    /// is left unchanged in that case.
    pub fn alloc(&mut self, len: usize, align: usize) -> CalcacheResult<Span> {
        debug_assert!(align.is_power_of_two());
        let start = (self.head + align - 1) & !(align - 1);
        let end = start.checked_add(len).filter(|end| *end <= self.buffer.len());
        let Some(end) = end else {
            return Err(CacheError::CapacityExceeded {
                resource: "arena bytes".to_string(),
                required: start.saturating_add(len),
                available: self.buffer.len(),
            }
            .into());
        };
        self.head = end;
        Ok(Span {
            offset: start as u32,
            len: len as u32,
        })
    }

    /// Reserve and fill a region with `bytes`.
    pub fn alloc_bytes(&mut self, bytes: &[u8]) -> CalcacheResult<Span> {
        let span = self.alloc(bytes.len(), 1)?;
        self.slice_mut(span).copy_from_slice(bytes);
        Ok(span)
    }

    pub fn slice_mut(&mut self, span: Span) -> &mut [u8] {
        &mut self.buffer[span.offset()..span.end()]
    }

    /// The whole region, for writing fixed fields at known offsets.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.buffer
    }

    /// Bytes handed out so far, including alignment padding.
    pub fn used(&self) -> usize {
        self.head
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.head
    }
}
