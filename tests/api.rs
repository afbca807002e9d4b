#[test]
fn is_usable_in_const_contexts() {
    const _ALLOCATOR1: segalloc::Allocator<4096> = segalloc::Allocator::new();
    static _ALLOCATOR2: segalloc::Allocator<4096> = segalloc::Allocator::new();
}

#[test]
fn supports_global_alloc() {
    fn assert<T: core::alloc::GlobalAlloc>(_: T) {}
    assert(segalloc::Allocator::<64>::new())
}

#[test]
#[should_panic(expected = "too small heap memory")]
fn min_region_size_of_at_least_32() {
    let _allocator = segalloc::Allocator::<16>::new(); // panic here
}

#[test]
#[should_panic(expected = "divisible by 16")]
fn region_size_must_be_a_multiple_of_16() {
    let _allocator = segalloc::Allocator::<1000>::new(); // panic here
}

#[test]
fn raw_heap_is_usable_standalone() {
    let mut heap = segalloc::RawHeap::new(segalloc::FixedRegion::<8192>::new());
    assert!(heap.init());

    let payload = heap.allocate(100).expect("allocation fits the first chunk");
    assert_eq!(payload % 16, 0);
    heap.check().expect("a fresh heap upholds its invariants");
    heap.free(payload);
    heap.check().unwrap();
}

#[test]
fn two_heaps_do_not_interfere() {
    let mut first = segalloc::RawHeap::new(segalloc::FixedRegion::<8192>::new());
    let mut second = segalloc::RawHeap::new(segalloc::FixedRegion::<8192>::new());
    assert!(first.init());
    assert!(second.init());

    let a = first.allocate(40).unwrap();
    let b = second.allocate(40).unwrap();
    // independent arenas produce the same offsets for the same trace
    assert_eq!(a, b);
    first.free(a);
    first.check().unwrap();
    second.check().unwrap();
}
