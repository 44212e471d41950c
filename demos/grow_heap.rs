//! A very minimal example of calling a grower directly: move the break,
//! print where the new bytes landed.

#[cfg(feature = "use_libc")]
use seg_allocator::allocators::LibcHeapGrower;
#[cfg(not(feature = "use_libc"))]
use seg_allocator::allocators::SyscallHeapGrower;
use seg_allocator::HeapGrower;

fn main() {
    #[cfg(feature = "use_libc")]
    let mut grower = LibcHeapGrower::default();
    #[cfg(not(feature = "use_libc"))]
    let mut grower = SyscallHeapGrower::default();

    let first = unsafe { grower.sbrk(64) }.expect("sbrk failed");
    println!("First region:  {:p}", first.as_ptr());

    let second = unsafe { grower.sbrk(64) }.expect("sbrk failed");
    println!("Second region: {:p}", second.as_ptr());

    // sbrk-style growth is contiguous.
    assert_eq!(unsafe { first.as_ptr().add(64) }, second.as_ptr());
    println!("Grew twice, contiguously.");
}
