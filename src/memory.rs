//! The host memory interface consumed by the allocator core.
//!
//! The allocator never talks to an operating system directly. It manages one
//! contiguous byte region owned by a [`MemorySource`], which hands out more
//! bytes at the high end on request and never takes them back. Block
//! positions are byte offsets into that region, so a heap can be moved (or
//! live inside a `static`) without invalidating any bookkeeping.

use crate::raw_heap::header::{ALIGNMENT, MIN_BLOCK_SIZE};

/// Page size reported by [`FixedRegion`].
const PAGE_SIZE: usize = 4096;

/// A grow-only byte region backing one heap.
///
/// Implementations must uphold three properties for the allocator to work:
///
/// - the base of the region is 16-byte aligned and stable,
/// - [`grow`](Self::grow) only ever appends: the bytes returned by
///   [`mapped`](Self::mapped) keep their contents and their offsets across
///   calls,
/// - a fresh source starts out empty (`mapped().is_empty()`).
///
/// The trait is safe because the region is plain initialized memory; all
/// pointer handling stays with the caller.
pub trait MemorySource {
    /// Extend the region by `delta` bytes and return the offset of the first
    /// new byte (the old break), or `None` if the host refuses.
    ///
    /// A refused growth must leave the region untouched.
    fn grow(&mut self, delta: usize) -> Option<usize>;

    /// The currently mapped bytes, from the region base up to the break.
    fn mapped(&self) -> &[u8];

    /// Mutable view of the currently mapped bytes.
    fn mapped_mut(&mut self) -> &mut [u8];

    /// The host page size.
    fn page_size(&self) -> usize;
}

/// A [`MemorySource`] over an inline, statically sized array.
///
/// The break starts at zero and advances through the array on
/// [`grow`](MemorySource::grow); once it reaches `N` all further growth is
/// refused. The array is zero-initialized and the constructor is `const`, so
/// a `static` region is placed in `.bss` and costs no image size.
#[repr(align(16))]
pub struct FixedRegion<const N: usize> {
    bytes: [u8; N],
    brk: usize,
}

impl<const N: usize> FixedRegion<N> {
    /// Create an empty region.
    ///
    /// # Panics
    /// Panics if `N` is less than `32` or not divisible by `16`.
    #[must_use]
    pub const fn new() -> Self {
        assert!(N >= MIN_BLOCK_SIZE, "too small heap memory: minimum size is 32");
        assert!(N % ALIGNMENT == 0, "memory size has to be divisible by 16");
        Self { bytes: [0; N], brk: 0 }
    }
}

impl<const N: usize> MemorySource for FixedRegion<N> {
    fn grow(&mut self, delta: usize) -> Option<usize> {
        let new_brk = self.brk.checked_add(delta)?;
        if new_brk > N {
            return None;
        }
        let old_brk = self.brk;
        self.brk = new_brk;
        Some(old_brk)
    }

    fn mapped(&self) -> &[u8] {
        &self.bytes[..self.brk]
    }

    fn mapped_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..self.brk]
    }

    fn page_size(&self) -> usize {
        PAGE_SIZE
    }
}
