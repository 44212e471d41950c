//! Boundary tags and raw block navigation.
//!
//! Every block in the heap starts with a single 64-bit boundary word packing
//! `{size, alloc, prev_alloc, prev_mini}`. Free non-mini blocks repeat that
//! word as a footer in their last eight bytes, so the previous block can be
//! reached from a header alone. [`Block`] is a non-owning handle to a block's
//! header word; all traversal and boundary rewriting goes through it.

use core::ptr::{null_mut, NonNull};

use static_assertions::const_assert;

/// Header, footer, prologue, and epilogue word size (bytes).
pub const WORD: usize = 8;

/// Payload alignment, and the granularity of all block sizes (bytes).
pub const ALIGN: usize = 16;

/// Minimum block size (bytes). A block of exactly this size is a "mini"
/// block: a header plus one payload word, with no room for a footer.
pub const MIN_BLOCK: usize = 16;

/// Smallest extension requested from the grower when the free lists hold no
/// fit (bytes).
pub const CHUNK: usize = 4096;

const ALLOC_MASK: u64 = 0x1;
const PREV_ALLOC_MASK: u64 = 0x2;
const PREV_MINI_MASK: u64 = 0x4;
const SIZE_MASK: u64 = !0xF;

const_assert!(MIN_BLOCK == 2 * WORD);
const_assert!(CHUNK % ALIGN == 0);

/// A packed boundary word.
///
/// Bit 0 is the block's own allocation status, bit 1 the previous block's
/// allocation status, and bit 2 records whether the previous block is mini.
/// Bit 3 is reserved zero. The upper bits carry the block size, which is
/// always a multiple of [`ALIGN`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Tag(u64);

impl Tag {
    /// Pack a boundary word. `size` must be a multiple of [`ALIGN`].
    pub fn new(size: usize, alloc: bool, prev_alloc: bool, prev_mini: bool) -> Tag {
        debug_assert_eq!(size & 0xF, 0, "block sizes are 16-byte granular");
        let mut word = size as u64;
        if alloc {
            word |= ALLOC_MASK;
        }
        if prev_alloc {
            word |= PREV_ALLOC_MASK;
        }
        if prev_mini {
            word |= PREV_MINI_MASK;
        }
        Tag(word)
    }

    pub fn from_raw(word: u64) -> Tag {
        Tag(word)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub fn is_alloc(self) -> bool {
        self.0 & ALLOC_MASK != 0
    }

    pub fn prev_alloc(self) -> bool {
        self.0 & PREV_ALLOC_MASK != 0
    }

    pub fn prev_mini(self) -> bool {
        self.0 & PREV_MINI_MASK != 0
    }

    /// The same word with both previous-block flags replaced.
    pub fn with_prev(self, prev_alloc: bool, prev_mini: bool) -> Tag {
        Tag::new(self.size(), self.is_alloc(), prev_alloc, prev_mini)
    }
}

/// A non-owning handle to a block, pointing at its header word.
///
/// The heap byte region owns every block; a `Block` (and the free lists
/// built from them) only indexes into it. Copying a `Block` copies the
/// address, not the block.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Block {
    head: NonNull<u64>,
}

// Blocks are plain addresses into a heap whose exclusive owner is the
// allocator that produced them; sending one along with its allocator is
// fine.
unsafe impl Send for Block {}

impl Block {
    /// Wrap a header address. Returns `None` for null.
    pub fn from_head(ptr: *mut u64) -> Option<Block> {
        NonNull::new(ptr).map(|head| Block { head })
    }

    /// Wrap a header address known to be non-null.
    ///
    /// # Safety
    ///
    /// `ptr` must not be null.
    pub unsafe fn from_head_unchecked(ptr: *mut u64) -> Block {
        Block {
            head: NonNull::new_unchecked(ptr),
        }
    }

    /// Recover a block from the payload pointer handed to client code.
    ///
    /// # Safety
    ///
    /// `payload` must be a pointer previously produced by [`Block::payload`]
    /// for a live block.
    pub unsafe fn from_payload(payload: *mut u8) -> Block {
        Block {
            head: NonNull::new_unchecked(payload.cast::<u64>().sub(1)),
        }
    }

    pub fn head_ptr(self) -> *mut u64 {
        self.head.as_ptr()
    }

    pub fn addr(self) -> usize {
        self.head.as_ptr() as usize
    }

    /// Read the boundary word at the head of the block.
    ///
    /// # Safety
    ///
    /// The handle must point into a live heap.
    pub unsafe fn tag(self) -> Tag {
        Tag::from_raw(self.head.as_ptr().read())
    }

    pub unsafe fn size(self) -> usize {
        self.tag().size()
    }

    pub unsafe fn is_alloc(self) -> bool {
        self.tag().is_alloc()
    }

    pub unsafe fn prev_alloc(self) -> bool {
        self.tag().prev_alloc()
    }

    pub unsafe fn prev_mini(self) -> bool {
        self.tag().prev_mini()
    }

    /// Whether this is a minimum-sized block.
    pub unsafe fn is_mini(self) -> bool {
        self.size() == MIN_BLOCK
    }

    /// The payload address handed to client code: one word past the header.
    pub unsafe fn payload(self) -> *mut u8 {
        self.head.as_ptr().add(1).cast()
    }

    unsafe fn footer_ptr(self) -> *mut u64 {
        // The last word of the block.
        self.head
            .as_ptr()
            .cast::<u8>()
            .add(self.size() - WORD)
            .cast()
    }

    /// Read the footer word. Only meaningful for free non-mini blocks; no
    /// other kind of block carries one.
    pub unsafe fn footer(self) -> Tag {
        Tag::from_raw(self.footer_ptr().read())
    }

    /// Write this block's boundary words.
    ///
    /// Writes the header and, for a free non-mini block, an identical footer
    /// in the block's last word. An allocated block gives the footer word
    /// back to the payload; a mini block has no room for one.
    pub unsafe fn write(self, size: usize, alloc: bool, prev_alloc: bool, prev_mini: bool) {
        let tag = Tag::new(size, alloc, prev_alloc, prev_mini);
        self.head.as_ptr().write(tag.raw());
        if !alloc && size != MIN_BLOCK {
            self.footer_ptr().write(tag.raw());
        }
    }

    /// Rewrite both previous-block flags, leaving size and allocation status
    /// untouched. The change is mirrored into the footer when one is
    /// present.
    pub unsafe fn set_prev_flags(self, prev_alloc: bool, prev_mini: bool) {
        let tag = self.tag().with_prev(prev_alloc, prev_mini);
        self.head.as_ptr().write(tag.raw());
        if !tag.is_alloc() && tag.size() != MIN_BLOCK {
            self.footer_ptr().write(tag.raw());
        }
    }

    /// The next block in address order, found by skipping `size` bytes.
    ///
    /// # Safety
    ///
    /// Must not be called on the epilogue (size 0).
    pub unsafe fn next(self) -> Block {
        debug_assert!(self.size() != 0, "next() called on the epilogue");
        Block {
            head: NonNull::new_unchecked(self.head.as_ptr().cast::<u8>().add(self.size()).cast()),
        }
    }

    /// The previous block in address order.
    ///
    /// A mini predecessor sits at the fixed offset [`MIN_BLOCK`]; any other
    /// predecessor is located through its footer. Returns `None` when the
    /// word below is the prologue.
    ///
    /// # Safety
    ///
    /// The previous block must be mini or free; an allocated non-mini
    /// predecessor has no footer and cannot be navigated to.
    pub unsafe fn prev(self) -> Option<Block> {
        if self.prev_mini() {
            let head = self.head.as_ptr().cast::<u8>().sub(MIN_BLOCK).cast();
            return Some(Block {
                head: NonNull::new_unchecked(head),
            });
        }

        let footer = Tag::from_raw(self.head.as_ptr().sub(1).read());
        if footer.size() == 0 {
            // The word below is the prologue; there is no previous block.
            return None;
        }
        let head = self.head.as_ptr().cast::<u8>().sub(footer.size()).cast();
        Some(Block {
            head: NonNull::new_unchecked(head),
        })
    }

    // Free-list links live in the payload area: a free non-mini block keeps
    // its list predecessor in the first payload word and its successor in
    // the second. A free mini block only has room for a successor.

    unsafe fn link_ptr(self, index: usize) -> *mut *mut u64 {
        self.head.as_ptr().add(1 + index).cast()
    }

    pub unsafe fn list_prev(self) -> Option<Block> {
        Block::from_head(self.link_ptr(0).read())
    }

    pub unsafe fn set_list_prev(self, prev: Option<Block>) {
        self.link_ptr(0).write(prev.map_or(null_mut(), Block::head_ptr));
    }

    pub unsafe fn list_next(self) -> Option<Block> {
        Block::from_head(self.link_ptr(1).read())
    }

    pub unsafe fn set_list_next(self, next: Option<Block>) {
        self.link_ptr(1).write(next.map_or(null_mut(), Block::head_ptr));
    }

    /// Successor link of a free mini block.
    pub unsafe fn mini_next(self) -> Option<Block> {
        Block::from_head(self.link_ptr(0).read())
    }

    pub unsafe fn set_mini_next(self, next: Option<Block>) {
        self.link_ptr(0).write(next.map_or(null_mut(), Block::head_ptr));
    }
}
