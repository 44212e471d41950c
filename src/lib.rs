#![no_std]

//! A segregated-fit memory allocator.
//!
//! The heap is one contiguous region, grown only at its high end through an
//! sbrk-style primitive and carved into 16-byte-granular blocks. All
//! bookkeeping is in-band: each block starts with a 64-bit boundary word
//! packing its size with three flag bits (own allocation status, previous
//! block's allocation status, and whether the previous block is
//! minimum-sized), and free non-mini blocks repeat that word as a footer so
//! neighbors can be found in both directions.
//!
//! ```text
//! [prologue][hdr|payload][hdr|payload]...[hdr|payload][epilogue]
//! ```
//!
//! Freed blocks are filed into fourteen segregated LIFO lists by size class,
//! except for 16-byte "mini" blocks, which have room for only one link word
//! and live on a dedicated singly-linked list. Placement is a bounded
//! best-fit inside the first class with a fit; oversized blocks are split
//! and freed blocks are immediately coalesced with free neighbors.
//!
//! ## Types
//!
//! ### [`RawAlloc`]
//!
//! The engine: a single-threaded heap manager over a pluggable
//! [`HeapGrower`], exposing `malloc` / `free` / `realloc` / `calloc` with
//! the conventional contracts, plus an invariant audit for debugging.
//!
//! ### [`UnixAllocator`]
//!
//! A spin-locked front end over the platform grower, implementing
//! [`GlobalAlloc`](core::alloc::GlobalAlloc):
//!
//! ```rust,ignore
//! use seg_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```
//!
//! ### [`HeapGrower`] / [`ToyHeap`]
//!
//! `HeapGrower` abstracts the call that moves the program break. `ToyHeap`
//! implements it over a fixed array, which keeps the engine fully testable
//! in user space.
//!
//! ## Features
//!
//! By default the heap grows with a direct `brk` system call (Linux only).
//! Enable `use_libc` to go through `libc::sbrk` instead; that is also the
//! route on other unixes.

#[cfg(test)]
extern crate std;

pub mod allocators;
pub mod block;
pub mod freelist;
pub mod heap;
#[cfg(all(not(feature = "use_libc"), target_os = "linux"))]
pub mod unix;

pub use allocators::{GenericAllocator, HeapGrower, ToyHeap, UnixAllocator};
pub use heap::{RawAlloc, Stats, Validity};
