//! Segregated-fit memory allocator for grow-only heap regions
//!
//! This crate provides a classical `malloc`-style heap in two layers. The
//! core type [`RawHeap`] implements the allocation policy over any
//! [`MemorySource`], a contiguous byte region that can only ever grow at
//! its high end (like a process break). The convenience type [`Allocator`]
//! wraps a heap over an inline [`FixedRegion`] in a spin mutex and
//! implements [`core::alloc::GlobalAlloc`], which makes the
//! [`alloc`-crate][alloc] collections available on `#![no_std]`-targets:
//!
//! ```no_run
//! #[global_allocator]
//! static ALLOCATOR: segalloc::Allocator<{ 1024 * 1024 }> = segalloc::Allocator::new();
//!
//! extern crate alloc;
//! ```
//!
//! The region size must be divisible by 16. The heap sets itself up on the
//! first allocation and takes 4 KiB plus 16 bytes of the region for its
//! initial chunk, so sizes below that only ever produce failing
//! allocations.
//!
//! # Implementation
//! The mapped region is divided into blocks, each led by one 8-byte header
//! word that packs the block size with three metadata bits. Allocated
//! blocks carry **no footer**: the successor's header caches whether the
//! block below it is allocated (and whether it is a 16-byte mini block), so
//! only free regular blocks mirror their header into a footer for backward
//! coalescing. A payload is the block minus its header and is always
//! 16-byte aligned. One group below is one 8-byte word:
//!
//! ```text
//!  allocated:  hhhhhhhh dddddddd dddddddd dddddddd
//!              ^------- ^--------------------------
//!              header   payload (16-byte aligned)
//!
//!  free:       hhhhhhhh nnnnnnnn pppppppp ........ ffffffff
//!              ^------- ^------- ^------- ^------- ^-------
//!              header   next     prev     (unused) footer
//!
//!  free mini:  hhhhhhhh nnnnnnnn
//!              ^------- ^-------
//!              header   next     (16 bytes total)
//! ```
//!
//! Free blocks are indexed in 15 power-of-two size classes; allocation
//! scans a bounded number of candidates per class and takes the smallest,
//! growing the region by at least one 4 KiB chunk when nothing fits.
//! Freeing coalesces with both neighbours immediately, so no two free
//! blocks ever touch. The 16-byte mini blocks serve payloads of up to 8
//! bytes without footer or back-link overhead.
//!
//! [`RawHeap`] exposes the same policy directly (offsets instead of
//! pointers, [`Option`] instead of null), together with an invariant
//! checker ([`RawHeap::check`]) that test code can run after every
//! operation.
//!
//! [alloc]: https://doc.rust-lang.org/alloc/index.html
#![cfg_attr(not(test), no_std)]
#![warn(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

mod memory;
mod raw_heap;

pub use memory::{FixedRegion, MemorySource};
pub use raw_heap::{CheckError, Header, RawHeap};
pub use raw_heap::{ALIGNMENT, CHUNK_SIZE, MINI_SIZE, MIN_BLOCK_SIZE, WORD};

use core::alloc::{GlobalAlloc, Layout};
use core::ptr;

/// A global allocator over an inline memory region of `N` bytes.
///
/// The region is part of the allocator value itself, so the heap memory of
/// a `static` allocator is statically limited and accounted to the image's
/// `.bss` section. The allocator sets itself up lazily on the first
/// allocation; a region too small for the initial 4 KiB chunk simply
/// refuses every allocation.
///
/// Usage: declare a `static` and register it as the global allocator.
/// ```no_run
/// #[global_allocator]
/// static ALLOCATOR: segalloc::Allocator<{ 1024 * 1024 }> = segalloc::Allocator::new();
/// ```
pub struct Allocator<const N: usize> {
    /// The heap core behind a spin mutex.
    ///
    /// The core is strictly single-threaded; the mutex is what makes it
    /// usable through the shared references [`GlobalAlloc`] hands out.
    heap: spin::Mutex<RawHeap<FixedRegion<N>>>,
}

impl<const N: usize> Allocator<N> {
    /// Create a new [`Allocator`].
    ///
    /// This function is a `const fn`, therefore you can call it directly
    /// when creating the allocator.
    ///
    /// # Panics
    /// This function will panic, if the supplied region size, i.e. `N` is
    /// less than `32` or not divisible by `16`.
    #[must_use = "assign the allocator to a static variable and apply the `#[global_allocator]`-attribute to make it the global allocator"]
    pub const fn new() -> Self {
        let heap = spin::Mutex::new(RawHeap::new(FixedRegion::new()));
        Self { heap }
    }

    /// Align a given pointer to the specified alignment.
    ///
    /// # Safety
    /// This function requires `align` to be a power of two and requires the
    /// `ptr` to point to a memory region, that is large enough, so that the
    /// aligned pointer is still in that memory region.
    unsafe fn align_to(ptr: *mut u8, align: usize) -> *mut u8 {
        let addr = ptr as usize;
        let mismatch = addr & (align - 1);
        let offset = if mismatch != 0 { align - mismatch } else { 0 };
        // SAFETY: "in-bound"-requirement is part of the safety-contract of
        // this function, therefore the caller is responsible for it
        unsafe { ptr.add(offset) }
    }
}

// SAFETY: the implementation does not panic on allocation failure (it
// returns null as required) and hands out payloads that satisfy the given
// layout: they are at least `layout.size()` bytes long and 16-byte aligned,
// with larger alignments fulfilled by over-allocation.
unsafe impl<const N: usize> GlobalAlloc for Allocator<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut heap = self.heap.lock();
        if !heap.init() {
            return ptr::null_mut();
        }
        // every payload is 16-byte aligned, which covers the common
        // alignments directly. Larger ones are fulfilled by conservative
        // over-allocation and adjusting the returned pointer; `dealloc`
        // maps such interior pointers back to their block.
        let align = layout.align();
        let size = if align > ALIGNMENT { layout.size() + align } else { layout.size() };
        match heap.allocate(size) {
            Some(payload) => {
                let base = heap.memory_mut().mapped_mut().as_mut_ptr();
                // SAFETY: `allocate` only hands out offsets of blocks
                // inside the mapped region
                let ptr = unsafe { base.add(payload) };
                if align > ALIGNMENT {
                    // SAFETY: the block was over-allocated by `align`
                    // bytes, so the aligned pointer stays inside it
                    unsafe { Self::align_to(ptr, align) }
                } else {
                    ptr
                }
            }
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut heap = self.heap.lock();
        let base = heap.memory().mapped().as_ptr() as usize;
        let offset = (ptr as usize).wrapping_sub(base);
        let payload = if layout.align() > ALIGNMENT {
            // over-aligned allocations returned a pointer into the middle
            // of their block; walk the heap to find the block again
            heap.payload_containing(offset)
        } else {
            Some(offset)
        };
        // a foreign pointer cannot be reported here (`GlobalAlloc` must not
        // panic), so it is ignored
        if let Some(payload) = payload {
            heap.free(payload);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            // the over-alignment path of `alloc` decides the final payload
            // position, so zero afterwards instead
            // SAFETY: forwarding our own contract
            let ptr = unsafe { self.alloc(layout) };
            if !ptr.is_null() {
                // SAFETY: `alloc` returned a block of `layout.size()` bytes
                unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
            }
            return ptr;
        }
        let mut heap = self.heap.lock();
        if !heap.init() {
            return ptr::null_mut();
        }
        match heap.zeroed_allocate(1, layout.size()) {
            Some(payload) => {
                let base = heap.memory_mut().mapped_mut().as_mut_ptr();
                // SAFETY: `zeroed_allocate` only hands out offsets of
                // blocks inside the mapped region
                unsafe { base.add(payload) }
            }
            None => ptr::null_mut(),
        }
    }
}
