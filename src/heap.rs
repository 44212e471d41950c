//! The block-management engine.
//!
//! [`RawAlloc`] owns the heap bookkeeping: it grows one contiguous region at
//! its high end through a [`HeapGrower`], carves the region into
//! boundary-tagged blocks, and services allocate / free / reallocate /
//! zeroed-allocate requests with bounded best-fit placement, splitting, and
//! immediate coalescing.
//!
//! The heap has the shape
//!
//! ```text
//! [prologue footer][block 1][block 2]...[block n][epilogue header]
//! ```
//!
//! where the prologue and epilogue are zero-size allocated sentinels. Growth
//! replaces the epilogue with a new block's header and writes a fresh
//! epilogue at the new high end, so the region between the sentinels is
//! always wall-to-wall blocks.

use core::ops::Range;
use core::ptr::{self, null_mut};

use log::{debug, error, trace};

use crate::allocators::HeapGrower;
use crate::block::{Block, Tag, ALIGN, CHUNK, MIN_BLOCK, WORD};
use crate::freelist::{class_of, FreeLists, NUM_CLASSES};

/// Round a request up to a whole block: one header word plus the payload,
/// on the 16-byte grid. `None` when the padded size overflows.
fn block_size_for(request: usize) -> Option<usize> {
    let padded = request.checked_add(WORD + (ALIGN - 1))?;
    Some(padded & !(ALIGN - 1))
}

/// A raw allocator: grows the heap through `G`, tracks and reuses freed
/// blocks, and hands out 16-aligned payload pointers.
///
/// Not thread-safe on its own; see
/// [`GenericAllocator`](crate::allocators::GenericAllocator) for the
/// lockable wrapper. Memory is never returned to the grower: the heap only
/// grows.
pub struct RawAlloc<G> {
    pub grower: G,
    /// Low end of the committed heap (the prologue footer). Null until the
    /// heap is initialized.
    lo: *mut u8,
    /// One past the high end of the committed heap. The epilogue header is
    /// the word just below this.
    hi: *mut u8,
    lists: FreeLists,
}

// A RawAlloc is sendable: the heap region it indexes moves with it, and
// nothing else holds block handles once the allocator does.
unsafe impl<G: Send> Send for RawAlloc<G> {}

impl<G: HeapGrower + Default> Default for RawAlloc<G> {
    fn default() -> Self {
        RawAlloc::new(G::default())
    }
}

impl<G> RawAlloc<G> {
    pub fn new(grower: G) -> Self {
        RawAlloc {
            grower,
            lo: null_mut(),
            hi: null_mut(),
            lists: FreeLists::new(),
        }
    }

    /// The committed heap bounds, from the prologue footer to one past the
    /// epilogue header. Empty until the heap is initialized.
    pub fn heap_range(&self) -> Range<*const u8> {
        self.lo as *const u8..self.hi as *const u8
    }

    unsafe fn epilogue(&self) -> Block {
        Block::from_head_unchecked(self.hi.cast::<u64>().sub(1))
    }

    unsafe fn first_block(&self) -> Block {
        Block::from_head_unchecked(self.lo.cast::<u64>().add(1))
    }
}

impl<G: HeapGrower> RawAlloc<G> {
    /// Set up the prologue, the epilogue, and empty free lists, then extend
    /// the heap by one chunk. Idempotent: initializing an initialized heap
    /// is a no-op returning true.
    ///
    /// # Safety
    ///
    /// See [`HeapGrower::sbrk`]; the grower's region must be untracked by
    /// any other code.
    pub unsafe fn init(&mut self) -> bool {
        if !self.lo.is_null() {
            return true;
        }

        let base = match self.grower.sbrk(2 * WORD) {
            Ok(base) => base.as_ptr(),
            Err(_) => return false,
        };

        // The prologue must sit on a 16-byte boundary so that every header
        // lands at an address of 8 (mod 16) and every payload at 0 (mod 16).
        // Pad the break when the provider hands us an unaligned region.
        let pad = base.align_offset(ALIGN);
        if pad != 0 && self.grower.sbrk(pad).is_err() {
            return false;
        }
        let pro = base.add(pad);

        // Prologue footer, with the initial epilogue header directly above
        // it. The epilogue records the prologue as an allocated, non-mini
        // left neighbor.
        pro.cast::<u64>().write(Tag::new(0, true, false, false).raw());
        pro.cast::<u64>()
            .add(1)
            .write(Tag::new(0, true, true, false).raw());

        self.lo = pro;
        self.hi = pro.add(2 * WORD);
        self.lists = FreeLists::new();

        // Start out with one chunk of free space.
        if self.extend_heap(CHUNK).is_none() {
            return false;
        }

        debug_assert!(self.check_heap(line!()));
        true
    }

    /// Allocate at least `size` bytes. Returns a 16-aligned payload pointer,
    /// or null when the request is zero or memory is exhausted.
    ///
    /// # Safety
    ///
    /// See [`HeapGrower::sbrk`]. The returned bytes are uninitialized.
    pub unsafe fn malloc(&mut self, size: usize) -> *mut u8 {
        if self.lo.is_null() && !self.init() {
            return null_mut();
        }

        debug_assert!(self.check_heap(line!()));

        if size == 0 {
            return null_mut();
        }

        let asize = match block_size_for(size) {
            Some(asize) => asize,
            None => return null_mut(),
        };
        debug!("allocating {} bytes ({} byte block)", size, asize);

        let block = match self.find_fit(asize) {
            Some(block) => block,
            None => {
                // No fit anywhere: grow by at least one chunk.
                match self.extend_heap(asize.max(CHUNK)) {
                    Some(block) => block,
                    None => return null_mut(),
                }
            }
        };

        debug_assert!(!block.is_alloc());
        self.lists.remove(block);

        let tag = block.tag();
        block.write(tag.size(), true, tag.prev_alloc(), tag.prev_mini());
        block.next().set_prev_flags(true, block.is_mini());

        if let Some(rest) = self.split_block(block, asize) {
            self.coalesce(rest);
        }

        debug_assert!(self.check_heap(line!()));
        block.payload()
    }

    /// Release an allocation. Null is accepted as a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a payload pointer returned by this allocator
    /// and not freed since.
    pub unsafe fn free(&mut self, ptr: *mut u8) {
        if ptr.is_null() {
            return;
        }

        debug_assert!(self.check_heap(line!()));

        let block = Block::from_payload(ptr);
        debug_assert!(block.is_alloc(), "freeing a block that is not allocated");

        let tag = block.tag();
        trace!("freeing a {} byte block", tag.size());
        block.write(tag.size(), false, tag.prev_alloc(), tag.prev_mini());
        block.next().set_prev_flags(false, block.is_mini());

        self.coalesce(block);

        debug_assert!(self.check_heap(line!()));
    }

    /// Resize an allocation, moving it when necessary.
    ///
    /// Null behaves as [`malloc`](RawAlloc::malloc); size zero frees `ptr`
    /// and returns null. On failure the original allocation is untouched and
    /// null is returned. The first `min(size, old capacity)` payload bytes
    /// are preserved.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live payload pointer from this allocator.
    pub unsafe fn realloc(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.free(ptr);
            return null_mut();
        }
        if ptr.is_null() {
            return self.malloc(size);
        }

        let new_ptr = self.malloc(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        // The old payload capacity is the block size minus its header word.
        let block = Block::from_payload(ptr);
        let copy = size.min(block.size() - WORD);
        ptr::copy_nonoverlapping(ptr, new_ptr, copy);

        self.free(ptr);
        new_ptr
    }

    /// Allocate zeroed space for `count` elements of `elem_size` bytes each.
    ///
    /// Returns null when `count` is zero, when the total byte count
    /// overflows, or when memory is exhausted.
    ///
    /// # Safety
    ///
    /// See [`HeapGrower::sbrk`].
    pub unsafe fn calloc(&mut self, count: usize, elem_size: usize) -> *mut u8 {
        if count == 0 {
            return null_mut();
        }
        let total = match count.checked_mul(elem_size) {
            Some(total) => total,
            None => return null_mut(),
        };

        let ptr = self.malloc(total);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, total);
        }
        ptr
    }

    /// Grow the heap and shape the new bytes into one free block.
    ///
    /// The old epilogue word becomes the new block's header (its
    /// previous-block flags are already correct for that position), a fresh
    /// epilogue is written at the new high end, and the block is coalesced
    /// with a free predecessor before being filed.
    unsafe fn extend_heap(&mut self, size: usize) -> Option<Block> {
        debug_assert_eq!(size % ALIGN, 0);

        let bp = match self.grower.sbrk(size) {
            Ok(bp) => bp.as_ptr(),
            Err(_) => {
                debug!("sbrk refused a {} byte extension", size);
                return None;
            }
        };
        if bp != self.hi {
            // Someone else moved the break; the heap cannot keep growing
            // contiguously.
            error!("non-contiguous sbrk: expected {:p}, got {:p}", self.hi, bp);
            return None;
        }

        trace!("extending the heap by {} bytes", size);

        let block = self.epilogue();
        let tag = block.tag();
        self.hi = self.hi.add(size);
        block.write(size, false, tag.prev_alloc(), tag.prev_mini());

        let epilogue = block.next();
        epilogue.write(0, true, false, block.is_mini());

        Some(self.coalesce(block))
    }

    /// Merge a just-freed (or just-extended) block with any free neighbors.
    ///
    /// Every case removes the merged neighbors from their lists, rewrites
    /// the merged block's boundary words, rewrites the right neighbor's
    /// previous-block flags, and files the result. Returns the merged block.
    unsafe fn coalesce(&mut self, block: Block) -> Block {
        debug_assert!(!block.is_alloc());

        let size = block.size();
        let tag = block.tag();
        let next = block.next();
        let next_alloc = next.is_alloc();

        let prev = if tag.prev_alloc() {
            None
        } else {
            Some(block.prev().expect("a free predecessor is a real block"))
        };

        match (prev, next_alloc) {
            // Both neighbors allocated: nothing merges. The caller already
            // wrote the block free, so only the neighbor flags and the
            // lists need attention.
            (None, true) => {
                next.set_prev_flags(false, block.is_mini());
                self.lists.insert(block);
                block
            }
            // Free predecessor only: grow it over this block.
            (Some(prev), true) => {
                self.lists.remove(prev);
                let merged = size + prev.size();
                let prev_tag = prev.tag();
                prev.write(merged, false, prev_tag.prev_alloc(), prev_tag.prev_mini());
                next.set_prev_flags(false, false);
                self.lists.insert(prev);
                prev
            }
            // Free successor only: grow this block over it.
            (None, false) => {
                self.lists.remove(next);
                let after = next.next();
                let merged = size + next.size();
                block.write(merged, false, tag.prev_alloc(), tag.prev_mini());
                after.set_prev_flags(false, false);
                self.lists.insert(block);
                block
            }
            // Free on both sides: one block spanning all three.
            (Some(prev), false) => {
                self.lists.remove(prev);
                self.lists.remove(next);
                let after = next.next();
                let merged = size + prev.size() + next.size();
                let prev_tag = prev.tag();
                prev.write(merged, false, prev_tag.prev_alloc(), prev_tag.prev_mini());
                after.set_prev_flags(false, false);
                self.lists.insert(prev);
                prev
            }
        }
    }

    /// Bounded best-fit search.
    ///
    /// A minimum-sized request is served straight from the mini-list when it
    /// has an entry. Otherwise buckets are scanned in ascending class order;
    /// inside the first bucket holding any fit, the scan tracks the smallest
    /// fitting block so far and stops at the first fitting block that is no
    /// smaller than it. On a LIFO list this approximates best-fit without
    /// walking the whole bucket.
    unsafe fn find_fit(&self, asize: usize) -> Option<Block> {
        if asize == MIN_BLOCK {
            if let Some(head) = self.lists.mini_head() {
                return Some(head);
            }
        }

        for class in class_of(asize)..NUM_CLASSES {
            let mut best: Option<Block> = None;
            let mut cursor = self.lists.class_head(class);

            while let Some(block) = cursor {
                if block.size() >= asize {
                    match best {
                        None => best = Some(block),
                        Some(b) if block.size() < b.size() => best = Some(block),
                        // A fit no better than the current best ends the
                        // scan.
                        Some(_) => return best,
                    }
                }
                cursor = block.list_next();
            }

            if best.is_some() {
                return best;
            }
        }

        None
    }

    /// Carve `asize` bytes off the front of an allocated block.
    ///
    /// When the remainder can stand alone it becomes a new free block, the
    /// right neighbor's previous-block flags are rewritten, and the
    /// remainder is returned for the caller to coalesce and file. Returns
    /// `None` when the block is too small to split.
    unsafe fn split_block(&mut self, block: Block, asize: usize) -> Option<Block> {
        debug_assert!(block.is_alloc());

        let size = block.size();
        if size - asize < MIN_BLOCK {
            return None;
        }

        let tag = block.tag();
        block.write(asize, true, tag.prev_alloc(), tag.prev_mini());

        let rest = block.next();
        rest.write(size - asize, false, true, asize == MIN_BLOCK);

        let after = rest.next();
        after.set_prev_flags(false, rest.is_mini());

        Some(rest)
    }
}

/// Counts of invariant violations found by [`RawAlloc::audit`].
///
/// Anything nonzero means the heap or its free lists are inconsistent.
#[derive(Default, Debug, Clone)]
pub struct Validity {
    /// Prologue or epilogue with the wrong size or allocation bit.
    pub bad_sentinels: usize,
    /// Blocks whose payload is off the 16-byte grid.
    pub misaligned: usize,
    /// Blocks with a size below the minimum or off the 16-byte grid.
    pub bad_sizes: usize,
    /// Free non-mini blocks whose header and footer words differ.
    pub mismatched_footers: usize,
    /// Pairs of adjacent blocks that are both free.
    pub adjacent_frees: usize,
    /// Headers whose previous-block flags contradict the block before them.
    pub bad_neighbor_flags: usize,
    /// Blocks lying outside the committed heap.
    pub out_of_bounds: usize,
    /// Doubly-linked nodes whose successor does not point back at them.
    pub broken_links: usize,
    /// Listed blocks filed under the wrong size class, or non-mini blocks on
    /// the mini-list.
    pub misfiled: usize,
    /// Disagreement between the free blocks found in the heap and the blocks
    /// on the lists.
    pub unlisted: usize,
}

impl Validity {
    /// A simple check that no violations were counted.
    pub fn is_valid(&self) -> bool {
        self.bad_sentinels == 0
            && self.misaligned == 0
            && self.bad_sizes == 0
            && self.mismatched_footers == 0
            && self.adjacent_frees == 0
            && self.bad_neighbor_flags == 0
            && self.out_of_bounds == 0
            && self.broken_links == 0
            && self.misfiled == 0
            && self.unlisted == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

/// Whole-heap counters gathered by [`RawAlloc::audit`].
#[derive(Default, Debug, Clone)]
pub struct Stats {
    /// Blocks between the prologue and the epilogue.
    pub blocks: usize,
    /// How many of those are free.
    pub free_blocks: usize,
    /// Free bytes, boundary words included.
    pub free_bytes: usize,
    /// Free mini blocks.
    pub mini_blocks: usize,
}

impl<G> RawAlloc<G> {
    /// Sweep the whole heap and every free list, verifying the block and
    /// list invariants.
    ///
    /// The first pass walks blocks in address order checking boundary-word
    /// consistency; the second walks the lists checking membership, link
    /// symmetry, and class filing. An uninitialized heap is trivially valid.
    pub fn audit(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();

        if self.lo.is_null() {
            return (validity, stats);
        }

        unsafe {
            self.sweep_blocks(&mut validity, &mut stats);
            let listed = self.sweep_lists(&mut validity);
            if listed != stats.free_blocks {
                validity.unlisted += 1;
            }
        }

        (validity, stats)
    }

    /// Whole-heap invariant predicate.
    ///
    /// True when every block and list invariant holds. On failure the
    /// violation counters are logged along with `line`, which callers pass
    /// as `line!()` for diagnostics.
    pub fn check_heap(&self, line: u32) -> bool {
        let (validity, _) = self.audit();
        if !validity.is_valid() {
            error!("heap check at line {} failed: {:?}", line, validity);
            return false;
        }
        true
    }

    unsafe fn sweep_blocks(&self, validity: &mut Validity, stats: &mut Stats) {
        let prologue = Tag::from_raw(self.lo.cast::<u64>().read());
        if prologue.size() != 0 || !prologue.is_alloc() {
            validity.bad_sentinels += 1;
        }
        let epilogue = self.epilogue();
        if epilogue.size() != 0 || !epilogue.is_alloc() {
            validity.bad_sentinels += 1;
        }

        // Walk the implicit list, remembering the previous block's status to
        // check the flag propagation into each header.
        let mut prev_alloc = true; // the prologue counts as allocated
        let mut prev_mini = false;
        let mut block = self.first_block();

        while block != epilogue {
            let tag = block.tag();
            let size = tag.size();

            if (block.payload() as usize) % ALIGN != 0 {
                validity.misaligned += 1;
            }
            if size < MIN_BLOCK || size % ALIGN != 0 {
                // The size cannot be trusted to reach the next header.
                validity.bad_sizes += 1;
                break;
            }
            if block.addr() + size > self.hi as usize {
                validity.out_of_bounds += 1;
                break;
            }
            if !tag.is_alloc() && size != MIN_BLOCK && block.footer().raw() != tag.raw() {
                validity.mismatched_footers += 1;
            }
            if tag.prev_alloc() != prev_alloc || tag.prev_mini() != prev_mini {
                validity.bad_neighbor_flags += 1;
            }
            if !prev_alloc && !tag.is_alloc() {
                validity.adjacent_frees += 1;
            }

            stats.blocks += 1;
            if !tag.is_alloc() {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if size == MIN_BLOCK {
                    stats.mini_blocks += 1;
                }
            }

            prev_alloc = tag.is_alloc();
            prev_mini = size == MIN_BLOCK;
            block = block.next();
        }

        // The epilogue's flags must describe the final real block.
        let etag = epilogue.tag();
        if etag.prev_alloc() != prev_alloc || etag.prev_mini() != prev_mini {
            validity.bad_neighbor_flags += 1;
        }
    }

    unsafe fn sweep_lists(&self, validity: &mut Validity) -> usize {
        let range = self.heap_range();
        let mut listed = 0;

        for class in 0..NUM_CLASSES {
            let mut cursor = self.lists.class_head(class);
            while let Some(block) = cursor {
                listed += 1;
                if !range.contains(&(block.head_ptr() as *const u8)) {
                    validity.out_of_bounds += 1;
                    break;
                }
                if block.is_mini() || class_of(block.size()) != class {
                    validity.misfiled += 1;
                }
                if let Some(next) = block.list_next() {
                    if next.list_prev() != Some(block) {
                        validity.broken_links += 1;
                    }
                }
                cursor = block.list_next();
            }
        }

        let mut cursor = self.lists.mini_head();
        while let Some(block) = cursor {
            listed += 1;
            if !range.contains(&(block.head_ptr() as *const u8)) {
                validity.out_of_bounds += 1;
                break;
            }
            if !block.is_mini() {
                validity.misfiled += 1;
            }
            cursor = block.mini_next();
        }

        listed
    }
}
