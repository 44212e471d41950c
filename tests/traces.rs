//! End-to-end operation traces exercising the documented allocator
//! contracts: alignment, reuse, coalescing, the mini-block fast path, and
//! the realloc/calloc edge cases.

use core::ptr::null_mut;

use seg_allocator::{RawAlloc, ToyHeap};

use test_log::test;

fn new_alloc() -> RawAlloc<ToyHeap> {
    RawAlloc::new(ToyHeap::default())
}

#[test]
fn two_tiny_allocations_land_side_by_side() {
    let mut alloc = new_alloc();
    unsafe {
        let p1 = alloc.malloc(1);
        let p2 = alloc.malloc(1);
        assert!(!p1.is_null());
        assert!(!p2.is_null());
        assert_ne!(p1, p2);
        assert_eq!(p1 as usize % 16, 0);
        assert_eq!(p2 as usize % 16, 0);

        // Minimum-sized blocks are 16 bytes apart.
        let gap = (p1 as usize).max(p2 as usize) - (p1 as usize).min(p2 as usize);
        assert_eq!(gap, 16);

        alloc.free(p1);
        alloc.free(p2);
        assert!(alloc.check_heap(line!()));

        // The two frees coalesced with the rest of the chunk.
        let (_, stats) = alloc.audit();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn chunk_sized_allocation_extends_then_reuses() {
    let mut alloc = new_alloc();
    unsafe {
        assert!(alloc.init());
        let grown_before = alloc.grower.size;

        let p = alloc.malloc(4096);
        assert!(!p.is_null());
        // The initial chunk cannot hold it; the heap grew exactly once
        // more.
        assert!(alloc.grower.size > grown_before);

        alloc.free(p);
        assert!(alloc.check_heap(line!()));

        // The same slot is handed straight back.
        let p2 = alloc.malloc(4096);
        assert_eq!(p2, p);
    }
}

#[test]
fn calloc_overflow_yields_null() {
    let mut alloc = new_alloc();
    unsafe {
        assert!(alloc.calloc(1, usize::MAX).is_null());
        assert!(alloc.calloc(usize::MAX, usize::MAX).is_null());
        assert!(alloc.calloc(usize::MAX / 2, 3).is_null());
        assert!(alloc.check_heap(line!()));
    }
}

#[test]
fn calloc_returns_zeroed_memory() {
    let mut alloc = new_alloc();
    unsafe {
        // Dirty a block, free it, and have calloc reuse the bytes.
        let p = alloc.malloc(64);
        for i in 0..64 {
            p.add(i).write(0xAB);
        }
        alloc.free(p);

        let q = alloc.calloc(8, 8);
        assert!(!q.is_null());
        for i in 0..64 {
            assert_eq!(q.add(i).read(), 0);
        }
    }
}

#[test]
fn realloc_moves_and_preserves_contents() {
    let mut alloc = new_alloc();
    unsafe {
        let p = alloc.malloc(100);
        assert!(!p.is_null());
        for i in 0..100 {
            p.add(i).write((i * 7) as u8);
        }

        let q = alloc.realloc(p, 200);
        assert!(!q.is_null());
        for i in 0..100 {
            assert_eq!(q.add(i).read(), (i * 7) as u8);
        }

        // The reallocation freed the original slot for reuse.
        let r = alloc.malloc(100);
        assert_eq!(r, p);
        assert!(alloc.check_heap(line!()));
    }
}

#[test]
fn mini_blocks_recycle_in_lifo_order() {
    let mut alloc = new_alloc();
    unsafe {
        let p1 = alloc.malloc(8);
        let p2 = alloc.malloc(8);
        let p3 = alloc.malloc(8);
        let p4 = alloc.malloc(8);
        assert!(!p1.is_null() && !p2.is_null() && !p3.is_null() && !p4.is_null());

        // Free a middle one; the next minimum-sized request gets it back.
        alloc.free(p2);
        assert_eq!(alloc.malloc(8), p2);

        // Two non-adjacent frees stack, and come back most-recent-first.
        // (Adjacent ones would coalesce out of the mini-list.)
        alloc.free(p1);
        alloc.free(p3);
        assert_eq!(alloc.malloc(8), p3);
        assert_eq!(alloc.malloc(8), p1);
        assert!(alloc.check_heap(line!()));
    }
}

#[test]
fn conventional_edge_cases() {
    let mut alloc = new_alloc();
    unsafe {
        // Zero-size requests yield null; freeing null does nothing.
        assert!(alloc.malloc(0).is_null());
        alloc.free(null_mut());
        assert!(alloc.calloc(0, 16).is_null());

        // realloc(null, n) allocates; realloc(p, 0) frees.
        let p = alloc.realloc(null_mut(), 48);
        assert!(!p.is_null());
        assert!(alloc.realloc(p, 0).is_null());
        assert!(alloc.check_heap(line!()));

        let (_, stats) = alloc.audit();
        assert_eq!(stats.free_blocks, 1);
    }
}

#[test]
fn failed_allocation_leaves_the_original_intact() {
    let mut alloc = new_alloc();
    unsafe {
        let p = alloc.malloc(32);
        assert!(!p.is_null());
        for i in 0..32 {
            p.add(i).write(i as u8);
        }

        // Far beyond the toy heap's capacity: realloc fails and the old
        // block is untouched.
        let q = alloc.realloc(p, ToyHeap::CAPACITY);
        assert!(q.is_null());
        for i in 0..32 {
            assert_eq!(p.add(i).read(), i as u8);
        }
        assert!(alloc.check_heap(line!()));

        alloc.free(p);
    }
}
