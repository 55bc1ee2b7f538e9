/*++

Licensed under the Apache-2.0 license.

File Name:

    workbuf.rs

Abstract:

    File contains the stacked scratch allocator. A `Workbuf` is a cursor
    over the free tail of the context's scratch buffer: `alloc` bumps it,
    `realloc` resizes the most recent allocation in place, and
    `Context::set_workbuf_used` pins everything below the new mark as
    permanent. The arena deals in byte offsets, never pointers, so
    regions can be re-purposed across verification stages safely.

--*/

/// Alignment of every workbuf allocation.
pub const WORKBUF_ALIGN: usize = 16;

/// Recommended scratch size for a full firmware + kernel verification.
pub const WORKBUF_RECOMMENDED_SIZE: usize = 12 * 1024;

/// Smallest scratch buffer the context will accept.
pub const WORKBUF_MIN_SIZE: usize = 1024;

/// Round `n` up to the allocation alignment. Returns `None` on
/// overflow.
pub fn round_up(n: usize) -> Option<usize> {
    n.checked_add(WORKBUF_ALIGN - 1).map(|v| v & !(WORKBUF_ALIGN - 1))
}

/// Allocation cursor over the free tail of the context workbuf.
///
/// Allocations made through a `Workbuf` are transient until the caller
/// pins them with `Context::set_workbuf_used`; dropping the cursor
/// abandons them.
#[derive(Debug, Clone, Copy)]
pub struct Workbuf {
    cursor: usize,
    end: usize,
}

impl Workbuf {
    pub(crate) fn new(cursor: usize, end: usize) -> Self {
        Self { cursor, end }
    }

    /// Offset of the next allocation.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Bytes left in the free tail.
    pub fn free(&self) -> usize {
        self.end - self.cursor
    }

    /// Allocate `size` bytes, rounded up to the alignment. Returns the
    /// offset of the region, or `None` if it does not fit. Failure
    /// leaves the cursor unchanged, so prior allocations stay intact.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        let offset = self.cursor;
        let next = offset.checked_add(round_up(size)?)?;
        if next > self.end {
            return None;
        }
        self.cursor = next;
        Some(offset)
    }

    /// Grow or shrink the most recent allocation in place. `offset` and
    /// `old_size` must describe that allocation exactly.
    pub fn realloc(&mut self, offset: usize, old_size: usize, new_size: usize) -> Option<usize> {
        let old_end = offset.checked_add(round_up(old_size)?)?;
        if old_end != self.cursor {
            return None;
        }
        let new_end = offset.checked_add(round_up(new_size)?)?;
        if new_end > self.end {
            return None;
        }
        self.cursor = new_end;
        Some(offset)
    }
}
