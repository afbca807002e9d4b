//! Whole-heap and free-index invariant verification.
//!
//! [`check`] walks the implicit block list from prologue to epilogue and
//! then every bucket of the segregated index, reporting the first violated
//! invariant as a [`CheckError`]. It never mutates anything and is meant
//! for test instrumentation; the allocator itself only relies on the
//! targeted `debug_assert!`s in its helpers.

use core::fmt;

use super::header::{Header, ALIGNMENT, MINI_SIZE, WORD};
use super::index::{self, SegIndex, CLASS_COUNT};

/// The first invariant violation found by [`check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckError {
    /// The word at offset 0 is not an allocated zero-size sentinel.
    BadPrologue { found: Header },
    /// The word below the break is not an allocated zero-size sentinel.
    BadEpilogue { found: Header },
    /// A block size is not 16-byte granular, below the mini size, or runs
    /// past the epilogue.
    InvalidSize { block: usize, size: usize },
    /// A payload is not 16-byte aligned.
    MisalignedPayload { block: usize },
    /// A free regular block whose footer disagrees with its header.
    FooterMismatch { block: usize, header: Header, footer: Header },
    /// A block whose `prev_alloc`/`prev_mini` bits contradict the block
    /// below it.
    StalePrevBits { block: usize },
    /// Two free blocks touch.
    AdjacentFreeBlocks { block: usize },
    /// A free block on the heap is missing from its bucket.
    UnindexedFreeBlock { block: usize },
    /// A bucket member lies outside the heap.
    MemberOutOfBounds { class: usize, block: usize },
    /// A bucket member is marked allocated.
    AllocatedInBucket { class: usize, block: usize },
    /// A bucket member whose size belongs to a different class.
    WrongClass { class: usize, block: usize, size: usize },
    /// A `prev` link that does not point back to the preceding member.
    AsymmetricLinks { class: usize, block: usize },
    /// Walking a bucket backwards visited a different number of members
    /// than walking it forwards.
    TraversalMismatch { class: usize, forward: usize, backward: usize },
    /// A bucket chain does not terminate.
    ListCycle { class: usize },
    /// The index holds a different number of blocks than are free on the
    /// heap.
    FreeCountMismatch { heap: usize, index: usize },
}

impl fmt::Display for CheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadPrologue { found } => write!(f, "bad prologue: {found:?}"),
            Self::BadEpilogue { found } => write!(f, "bad epilogue: {found:?}"),
            Self::InvalidSize { block, size } => {
                write!(f, "block at {block} has invalid size {size}")
            }
            Self::MisalignedPayload { block } => {
                write!(f, "payload of block at {block} is not 16-byte aligned")
            }
            Self::FooterMismatch { block, header, footer } => {
                write!(f, "block at {block}: header {header:?} but footer {footer:?}")
            }
            Self::StalePrevBits { block } => {
                write!(f, "block at {block} disagrees with its predecessor's state")
            }
            Self::AdjacentFreeBlocks { block } => {
                write!(f, "block at {block} and its predecessor are both free")
            }
            Self::UnindexedFreeBlock { block } => {
                write!(f, "free block at {block} is not in its bucket")
            }
            Self::MemberOutOfBounds { class, block } => {
                write!(f, "bucket {class} member at {block} lies outside the heap")
            }
            Self::AllocatedInBucket { class, block } => {
                write!(f, "bucket {class} member at {block} is allocated")
            }
            Self::WrongClass { class, block, size } => {
                write!(f, "bucket {class} member at {block} has size {size} of another class")
            }
            Self::AsymmetricLinks { class, block } => {
                write!(f, "bucket {class} member at {block} has a stale prev link")
            }
            Self::TraversalMismatch { class, forward, backward } => {
                write!(f, "bucket {class}: {forward} members forward, {backward} backward")
            }
            Self::ListCycle { class } => write!(f, "bucket {class} does not terminate"),
            Self::FreeCountMismatch { heap, index } => {
                write!(f, "{heap} free blocks on the heap, {index} in the index")
            }
        }
    }
}

/// Verify every invariant of the block layout and the free index.
///
/// A `heap_start` of zero (uninitialized heap) passes trivially.
pub(crate) fn check(memory: &[u8], heap_start: usize, index: &SegIndex) -> Result<(), CheckError> {
    if heap_start == 0 {
        return Ok(());
    }

    let prologue = Header::load(memory, 0);
    if prologue.size() != 0 || !prologue.is_allocated() {
        return Err(CheckError::BadPrologue { found: prologue });
    }
    let epilogue_at = memory.len() - WORD;
    let epilogue = Header::load(memory, epilogue_at);
    if epilogue.size() != 0 || !epilogue.is_allocated() {
        return Err(CheckError::BadEpilogue { found: epilogue });
    }

    let heap_free = check_blocks(memory, heap_start, epilogue_at, index)?;
    let indexed = check_buckets(memory, heap_start, epilogue_at, index)?;
    if indexed != heap_free {
        return Err(CheckError::FreeCountMismatch { heap: heap_free, index: indexed });
    }
    Ok(())
}

/// Walk the implicit list; returns the number of free blocks seen.
fn check_blocks(
    memory: &[u8],
    heap_start: usize,
    epilogue_at: usize,
    index: &SegIndex,
) -> Result<usize, CheckError> {
    let mut free_seen = 0;
    let mut previous: Option<Header> = None;
    let mut block = heap_start;
    while block < epilogue_at {
        let header = Header::load(memory, block);
        let size = header.size();
        if size < MINI_SIZE || size % ALIGNMENT != 0 || block + size > epilogue_at {
            return Err(CheckError::InvalidSize { block, size });
        }
        if (block + WORD) % ALIGNMENT != 0 {
            return Err(CheckError::MisalignedPayload { block });
        }
        match previous {
            Some(below) => {
                if header.prev_allocated() != below.is_allocated()
                    || header.prev_mini() != below.is_mini()
                {
                    return Err(CheckError::StalePrevBits { block });
                }
                if !below.is_allocated() && !header.is_allocated() {
                    return Err(CheckError::AdjacentFreeBlocks { block });
                }
            }
            // the first block sits on the prologue: allocated, not mini
            None => {
                if !header.prev_allocated() || header.prev_mini() {
                    return Err(CheckError::StalePrevBits { block });
                }
            }
        }
        if !header.is_allocated() {
            if !header.is_mini() {
                let footer = Header::load(memory, block + size - WORD);
                if footer != header {
                    return Err(CheckError::FooterMismatch { block, header, footer });
                }
            }
            if !index.contains(memory, block) {
                return Err(CheckError::UnindexedFreeBlock { block });
            }
            free_seen += 1;
        }
        previous = Some(header);
        block += size;
    }

    // the epilogue's bits describe the topmost block
    let epilogue = Header::load(memory, epilogue_at);
    if let Some(last) = previous {
        if epilogue.prev_allocated() != last.is_allocated()
            || epilogue.prev_mini() != last.is_mini()
        {
            return Err(CheckError::StalePrevBits { block: epilogue_at });
        }
    }
    Ok(free_seen)
}

/// Walk every bucket; returns the total number of indexed blocks.
fn check_buckets(
    memory: &[u8],
    heap_start: usize,
    epilogue_at: usize,
    index: &SegIndex,
) -> Result<usize, CheckError> {
    let mut indexed = 0;
    let walk_cap = memory.len() / MINI_SIZE + 1;
    for class in 0..CLASS_COUNT {
        let mut forward = 0;
        let mut previous = None;
        let mut tail = None;
        let mut cursor = index.head(class);
        while let Some(block) = cursor {
            forward += 1;
            if forward > walk_cap {
                return Err(CheckError::ListCycle { class });
            }
            if block < heap_start || block >= epilogue_at {
                return Err(CheckError::MemberOutOfBounds { class, block });
            }
            let header = Header::load(memory, block);
            if header.is_allocated() {
                return Err(CheckError::AllocatedInBucket { class, block });
            }
            if index::class_of(header.size()) != class {
                return Err(CheckError::WrongClass { class, block, size: header.size() });
            }
            if class != index::MINI_CLASS && index.prev(memory, block) != previous {
                return Err(CheckError::AsymmetricLinks { class, block });
            }
            previous = Some(block);
            tail = Some(block);
            cursor = index.next(memory, block);
        }
        if class != index::MINI_CLASS {
            let mut backward = 0;
            let mut cursor = tail;
            while let Some(block) = cursor {
                backward += 1;
                if backward > walk_cap {
                    return Err(CheckError::ListCycle { class });
                }
                cursor = index.prev(memory, block);
            }
            if backward != forward {
                return Err(CheckError::TraversalMismatch { class, forward, backward });
            }
        }
        indexed += forward;
    }
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::super::{Header, RawHeap, WORD};
    use super::CheckError;
    use crate::memory::{FixedRegion, MemorySource};

    fn heap() -> RawHeap<FixedRegion<{ 32 * 1024 }>> {
        let mut heap = RawHeap::new(FixedRegion::new());
        assert!(heap.init());
        heap
    }

    #[test]
    fn a_fresh_heap_passes() {
        heap().check().unwrap();
    }

    #[test]
    fn a_busy_heap_passes() {
        let mut heap = heap();
        let a = heap.allocate(10).unwrap();
        let b = heap.allocate(100).unwrap();
        let _c = heap.allocate(1000).unwrap();
        heap.free(a);
        heap.free(b);
        heap.check().unwrap();
    }

    #[test]
    fn detects_a_clobbered_epilogue() {
        let mut heap = heap();
        let epilogue = heap.memory().mapped().len() - WORD;
        Header::new(64, true, true, false).store(heap.memory_mut().mapped_mut(), epilogue);
        assert!(matches!(heap.check(), Err(CheckError::BadEpilogue { .. })));
    }

    #[test]
    fn detects_a_torn_footer() {
        let mut heap = heap();
        let payload = heap.allocate(100).unwrap();
        heap.free(payload);
        // the whole heap is one free block again; tear its footer
        let memory = heap.memory_mut().mapped_mut();
        let footer_at = memory.len() - 2 * WORD;
        Header::new(4096, true, true, false).store(memory, footer_at);
        assert!(matches!(heap.check(), Err(CheckError::FooterMismatch { .. })));
    }

    #[test]
    fn detects_stale_predecessor_bits() {
        let mut heap = heap();
        let payload = heap.allocate(100).unwrap();
        // make the successor believe the block below it is free
        let rest = heap.find_next(payload - WORD);
        let header = Header::load(heap.memory().mapped(), rest).with_prev_allocated(false);
        header.store(heap.memory_mut().mapped_mut(), rest);
        assert!(matches!(heap.check(), Err(CheckError::StalePrevBits { .. })));
    }

    #[test]
    fn detects_an_unindexed_free_block() {
        let mut heap = heap();
        let payload = heap.allocate(50).unwrap();
        heap.free(payload);
        // drop the merged block from its bucket without touching the heap
        let block = heap.index.head(crate::raw_heap::index::class_of(4096)).unwrap();
        heap.index.remove(heap.memory.mapped_mut(), block);
        assert_eq!(
            heap.check(),
            Err(CheckError::UnindexedFreeBlock { block })
        );
    }

    #[test]
    fn detects_a_cycle_in_a_bucket() {
        let mut heap = heap();
        let _keep = heap.allocate(8).unwrap();
        let gap = heap.allocate(8).unwrap();
        let _fence = heap.allocate(8).unwrap();
        heap.free(gap);
        // point the lone mini member's next link at itself
        let block = gap - WORD;
        let memory = heap.memory_mut().mapped_mut();
        memory[block + WORD..block + 2 * WORD]
            .copy_from_slice(&(block as u64).to_ne_bytes());
        let result = heap.check();
        assert!(
            matches!(result, Err(CheckError::ListCycle { .. })),
            "expected a cycle, got {result:?}",
        );
    }

    #[test]
    fn errors_render_a_diagnostic() {
        let error = CheckError::FreeCountMismatch { heap: 3, index: 2 };
        assert_eq!(
            format!("{error}"),
            "3 free blocks on the heap, 2 in the index"
        );
    }
}
