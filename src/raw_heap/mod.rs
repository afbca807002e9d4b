//! The allocator core: a boundary-tag heap over a grow-only byte region.
//!
//! The region is divided into blocks. Every block starts with a packed
//! [`Header`] word; free blocks of regular size additionally mirror that
//! word in a footer and carry their free-list links right after the header.
//! An 8-byte prologue footer below the first block and an 8-byte epilogue
//! header at the top of the region bound the implicit block list, so
//! neighbour inspection never needs a range check. One group below is one
//! 8-byte word; the region spans offset 0 up to `len`:
//!
//! ```text
//!  pppppppp hhhhhhhh dddddddd hhhhhhhh nnnnnnnn ffffffff .... eeeeeeee
//!  ^------- ^---------------- ^-------------------------      ^-------
//!  prologue allocated block   free block (header, next        epilogue
//!  footer   (header, payload) link and footer)                header
//!  at 0                                                       at len-8
//! ```
//!
//! Allocation picks a block from the segregated index (bounded best-fit),
//! growing the region by at least one chunk when the index has nothing
//! suitable. Freeing coalesces with both neighbours immediately, so two
//! adjacent free blocks never exist.

pub(crate) mod checker;
pub(crate) mod header;
pub(crate) mod index;

pub use checker::CheckError;
pub use header::{Header, ALIGNMENT, MINI_SIZE, MIN_BLOCK_SIZE, WORD};

use crate::memory::MemorySource;
use index::SegIndex;

use log::{debug, trace};

/// Granularity of heap extension: growth requests are at least this big.
pub const CHUNK_SIZE: usize = 4096;

/// How many large-enough candidates a size class is asked for before the
/// smallest of them wins. Larger budgets trade throughput for a little less
/// fragmentation; three keeps the scan short while skipping the worst
/// oversized picks.
const FIT_SCAN_LIMIT: usize = 3;

/// A single-threaded heap over a [`MemorySource`].
///
/// All block positions handed out and accepted by this type are byte
/// offsets into the source's mapped region; the payload of a block starts
/// one word past its header and is 16-byte aligned. Multiple independent
/// heaps may coexist, each owning its source.
///
/// The type is inert until [`init`](Self::init) succeeds.
pub struct RawHeap<M> {
    memory: M,
    /// Offset of the first block header, zero until [`init`](Self::init) ran.
    heap_start: usize,
    index: SegIndex,
}

impl<M: MemorySource> RawHeap<M> {
    /// Wrap a memory source. No bytes are requested until
    /// [`init`](Self::init).
    pub const fn new(memory: M) -> Self {
        Self { memory, heap_start: 0, index: SegIndex::new() }
    }

    /// The underlying memory source.
    pub fn memory(&self) -> &M {
        &self.memory
    }

    /// Mutable access to the underlying memory source.
    pub fn memory_mut(&mut self) -> &mut M {
        &mut self.memory
    }

    /// Set up the empty heap: sentinels plus one chunk of free memory.
    ///
    /// Returns `false` if the source refuses either growth request; a heap
    /// that failed to initialize stays inert, and `init` may be retried.
    /// Calling `init` again after it succeeded is a no-op returning `true`.
    /// The source must be fresh (nothing mapped yet, except by a previous
    /// failed `init`) and its base 16-byte aligned.
    pub fn init(&mut self) -> bool {
        if self.heap_start != 0 {
            return true;
        }
        match self.memory.mapped().len() {
            0 => {
                if self.memory.grow(2 * WORD).is_none() {
                    return false;
                }
            }
            // a previous init got the sentinel words but was refused the
            // first chunk; pick up from there
            len if len == 2 * WORD => {}
            _ => return false,
        }
        debug_assert_eq!(
            self.memory.mapped().as_ptr() as usize % ALIGNMENT,
            0,
            "memory source base must be 16-byte aligned",
        );

        let memory = self.memory.mapped_mut();
        // prologue footer and initial epilogue header
        Header::new(0, true, false, false).store(memory, 0);
        Header::new(0, true, true, false).store(memory, WORD);
        self.index.clear();

        self.heap_start = WORD;
        if self.extend_heap(CHUNK_SIZE).is_none() {
            self.heap_start = 0;
            return false;
        }
        debug!("heap initialized with {} mapped bytes", self.memory.mapped().len());
        true
    }

    /// Hand out a payload of at least `size` bytes, 16-byte aligned.
    ///
    /// Returns the payload offset, or `None` for `size == 0`, on an
    /// uninitialized heap, or when the memory source refuses to grow. A
    /// failed allocation leaves the heap exactly as it was.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 || self.heap_start == 0 {
            return None;
        }
        let asize = adjusted_size(size)?;
        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => self.extend_heap(asize.max(CHUNK_SIZE))?,
        };
        self.index.remove(self.memory.mapped_mut(), block);
        let header = self.header(block).with_allocated(true);
        self.set_header(block, header);
        if let Some(rest) = self.split(block, asize) {
            self.index.insert(self.memory.mapped_mut(), rest);
        }
        Some(block + WORD)
    }

    /// Release the block whose payload starts at `payload`.
    ///
    /// `payload` must come from [`allocate`](Self::allocate) (or
    /// [`reallocate`](Self::reallocate)) on this heap and must be live;
    /// anything else corrupts the heap.
    pub fn free(&mut self, payload: usize) {
        debug_assert_ne!(self.heap_start, 0, "free on an uninitialized heap");
        let block = payload - WORD;
        let header = self.header(block);
        debug_assert!(header.is_allocated(), "double free or foreign offset");

        self.set_header(block, header.with_allocated(false));
        let merged = self.coalesce(block);
        self.index.insert(self.memory.mapped_mut(), merged);
    }

    /// Resize an allocation, moving it if needed.
    ///
    /// `reallocate(None, size)` behaves as `allocate(size)`;
    /// `reallocate(Some(p), 0)` frees `p` and returns `None`. Otherwise the
    /// contents are copied into a fresh block and the old one is freed; if
    /// the new allocation fails the old block is left untouched and `None`
    /// is returned. No in-place growth or shrinking is attempted.
    pub fn reallocate(&mut self, payload: Option<usize>, size: usize) -> Option<usize> {
        let payload = match payload {
            Some(payload) => payload,
            None => return self.allocate(size),
        };
        if size == 0 {
            self.free(payload);
            return None;
        }
        let old_payload_size = self.header(payload - WORD).size() - WORD;
        let new_payload = self.allocate(size)?;
        let keep = size.min(old_payload_size);
        self.memory.mapped_mut().copy_within(payload..payload + keep, new_payload);
        self.free(payload);
        Some(new_payload)
    }

    /// Allocate `count * size` bytes and zero them.
    ///
    /// Returns `None` for a zero `count`, when `count * size` overflows, or
    /// when the allocation itself fails.
    pub fn zeroed_allocate(&mut self, count: usize, size: usize) -> Option<usize> {
        if count == 0 {
            return None;
        }
        let total = count.checked_mul(size)?;
        let payload = self.allocate(total)?;
        self.memory.mapped_mut()[payload..payload + total].fill(0);
        Some(payload)
    }

    /// Map an offset anywhere inside an allocated payload back to that
    /// payload's start.
    ///
    /// Walks the implicit block list; `None` if no allocated block's payload
    /// covers `offset`. This is how interior pointers (from over-aligned
    /// allocations) find their block again.
    pub fn payload_containing(&self, offset: usize) -> Option<usize> {
        if self.heap_start == 0 {
            return None;
        }
        let epilogue = self.epilogue();
        let mut block = self.heap_start;
        while block < epilogue {
            let header = self.header(block);
            if offset < block + header.size() {
                let payload = block + WORD;
                return (header.is_allocated() && offset >= payload).then_some(payload);
            }
            block += header.size();
        }
        None
    }

    /// Verify every heap and free-index invariant.
    ///
    /// Returns the first violation found. An uninitialized heap passes
    /// trivially. Intended for test instrumentation (the walk touches the
    /// whole heap).
    pub fn check(&self) -> Result<(), CheckError> {
        checker::check(self.memory.mapped(), self.heap_start, &self.index)
    }

    fn header(&self, block: usize) -> Header {
        Header::load(self.memory.mapped(), block)
    }

    /// Offset of the epilogue header.
    fn epilogue(&self) -> usize {
        self.memory.mapped().len() - WORD
    }

    fn find_next(&self, block: usize) -> usize {
        block + self.header(block).size()
    }

    /// Locate the block immediately below `block` on the heap.
    ///
    /// Only meaningful when that predecessor is free: the mini bit or the
    /// predecessor's footer is the only way back down. `None` means the
    /// predecessor is the prologue, i.e. there is nothing to coalesce with.
    fn find_prev(&self, block: usize) -> Option<usize> {
        if self.header(block).prev_mini() {
            return Some(block - MINI_SIZE);
        }
        let footer = Header::load(self.memory.mapped(), block - WORD);
        if footer.size() == 0 {
            return None;
        }
        Some(block - footer.size())
    }

    /// The single point through which block headers are written.
    ///
    /// Stores the header word, mirrors it into the footer when the block is
    /// free and regular, and rewrites the successor's `prev_alloc` and
    /// `prev_mini` bits (including the successor's own footer mirror when
    /// the successor is free and regular). Keeping neighbour bits in sync
    /// here means no caller ever touches them directly.
    fn set_header(&mut self, block: usize, header: Header) {
        debug_assert!(header.size() >= MINI_SIZE, "sentinels are not written through set_header");
        let memory = self.memory.mapped_mut();
        header.store(memory, block);
        if !header.is_allocated() && !header.is_mini() {
            header.store(memory, block + header.size() - WORD);
        }
        let next = block + header.size();
        let next_header = Header::load(memory, next)
            .with_prev_allocated(header.is_allocated())
            .with_prev_mini(header.is_mini());
        next_header.store(memory, next);
        if !next_header.is_allocated() && !next_header.is_mini() {
            next_header.store(memory, next + next_header.size() - WORD);
        }
    }

    /// Bounded best-fit over the segregated index.
    ///
    /// Starting at the class of `asize`, each bucket is asked for up to
    /// [`FIT_SCAN_LIMIT`] large-enough candidates and the smallest one wins
    /// (first of equals on a tie). A bucket without any qualifying block
    /// passes the search on to the next class. Bucket 0 is an exact-match
    /// fast path: every mini block fits a mini request.
    fn find_fit(&self, asize: usize) -> Option<usize> {
        let memory = self.memory.mapped();
        let start = index::class_of(asize);
        if start == index::MINI_CLASS {
            if let Some(head) = self.index.head(index::MINI_CLASS) {
                return Some(head);
            }
        }
        for class in start..index::CLASS_COUNT {
            let mut best: Option<(usize, usize)> = None;
            let mut qualifying = 0;
            let mut cursor = self.index.head(class);
            while let Some(block) = cursor {
                let size = Header::load(memory, block).size();
                if size >= asize {
                    if best.map_or(true, |(best_size, _)| size < best_size) {
                        best = Some((size, block));
                    }
                    qualifying += 1;
                    if qualifying == FIT_SCAN_LIMIT {
                        break;
                    }
                }
                cursor = self.index.next(memory, block);
            }
            if let Some((_, block)) = best {
                return Some(block);
            }
        }
        None
    }

    /// Grow the arena and install the new bytes as one free block.
    ///
    /// The old epilogue becomes the new block's header (keeping the bits
    /// that describe the block below it), a fresh epilogue is written at the
    /// new top, and the block is coalesced with a free tail and indexed.
    /// Returns the indexed block, or `None` if the source refuses, in
    /// which case nothing was altered.
    fn extend_heap(&mut self, size: usize) -> Option<usize> {
        let old_epilogue = self.epilogue();
        let captured = self.header(old_epilogue);
        let delta = (size.checked_add(ALIGNMENT - 1)?) & !(ALIGNMENT - 1);
        let old_break = match self.memory.grow(delta) {
            Some(old_break) => old_break,
            None => {
                debug!("growth by {delta} bytes refused by the memory source");
                return None;
            }
        };
        debug_assert_eq!(old_break, old_epilogue + WORD);
        trace!("heap grown by {delta} bytes to {}", self.memory.mapped().len());

        let memory = self.memory.mapped_mut();
        // fresh epilogue first: set_header below syncs its prev bits
        Header::new(0, true, false, false).store(memory, old_epilogue + delta);
        let header = Header::new(delta, false, captured.prev_allocated(), captured.prev_mini());
        self.set_header(old_epilogue, header);

        let block = self.coalesce(old_epilogue);
        self.index.insert(self.memory.mapped_mut(), block);
        Some(block)
    }

    /// Merge a free block with its free neighbours.
    ///
    /// `block` must already carry a free header (and footer, when regular).
    /// Absorbed neighbours are unlinked from the index; the caller indexes
    /// the returned block. The merged block can never be mini: merging only
    /// grows, so the successor's mini bit always clears here (via
    /// [`set_header`](Self::set_header)).
    fn coalesce(&mut self, block: usize) -> usize {
        let header = self.header(block);
        debug_assert!(!header.is_allocated());

        let next = self.find_next(block);
        let next_free = !self.header(next).is_allocated();
        // an allocated predecessor and the prologue both mean: nothing below
        let prev = if header.prev_allocated() { None } else { self.find_prev(block) };

        let mut base = block;
        let mut size = header.size();
        if next_free {
            self.index.remove(self.memory.mapped_mut(), next);
            size += self.header(next).size();
        }
        if let Some(prev) = prev {
            self.index.remove(self.memory.mapped_mut(), prev);
            size += self.header(prev).size();
            base = prev;
        }
        if base == block && !next_free {
            return block;
        }

        let base_header = self.header(base);
        let merged = Header::new(size, false, base_header.prev_allocated(), base_header.prev_mini());
        self.set_header(base, merged);
        base
    }

    /// Carve the tail of an allocated block into a free remainder.
    ///
    /// `block` keeps `asize` bytes; the rest becomes a free block which the
    /// caller must index. `None` if the residue would be smaller than a mini
    /// block. When `asize` is 16 the allocated block itself is mini and the
    /// remainder records that in its `prev_mini` bit.
    fn split(&mut self, block: usize, asize: usize) -> Option<usize> {
        let header = self.header(block);
        debug_assert!(header.is_allocated());
        let total = header.size();
        if total - asize < MINI_SIZE {
            return None;
        }
        let rest = block + asize;
        self.set_header(rest, Header::new(total - asize, false, true, asize == MINI_SIZE));
        self.set_header(block, Header::new(asize, true, header.prev_allocated(), header.prev_mini()));
        Some(rest)
    }
}

/// Round a request up to a conformant block size: one header word on top,
/// 16-byte granularity, at least a mini block. Payloads of up to 8 bytes
/// fit the mini class. `None` on arithmetic overflow.
fn adjusted_size(size: usize) -> Option<usize> {
    let gross = size.checked_add(WORD + ALIGNMENT - 1)?;
    Some((gross & !(ALIGNMENT - 1)).max(MINI_SIZE))
}
