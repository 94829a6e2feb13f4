//! Process-wide entry points.
//!
//! One [`Allocator`] grows the program break for the whole process. The
//! `*_locked` functions share its free list across all threads; the
//! `*_unlocked` functions use a free list private to the calling thread, kept
//! in thread-local storage, and only lock to grow the heap.
//!
//! Memory must be released through the same variant that allocated it.

use core::cell::RefCell;
use core::ptr::NonNull;

use crate::allocators::Allocator;
use crate::block::Block;
use crate::freelist::{FreeList, Stats, Validity};
use crate::heap::{HeapStats, SbrkHeapGrower};

/// An allocator over the program break, suitable for `#[global_allocator]`.
///
/// Any number of these can live beside the process-wide heap used by this
/// module: growing the break is serialized across all of them, so none ever
/// hands out memory another owns. Each keeps its own free list.
pub type SbrkAllocator = Allocator<SbrkHeapGrower>;

static HEAP: SbrkAllocator = Allocator::new(SbrkHeapGrower::new());

std::thread_local! {
    static LOCAL: RefCell<FreeList> = const { RefCell::new(FreeList::new()) };
}

/// Allocate `size` bytes from the process-wide shared free list.
pub fn allocate_locked(size: usize) -> Option<NonNull<u8>> {
    HEAP.allocate_locked(size)
}

/// Release memory from [`allocate_locked`]. A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must be null or have come from `allocate_locked`, and not been
/// released since.
pub unsafe fn release_locked(ptr: *mut u8) {
    HEAP.release_locked(ptr)
}

/// Allocate `size` bytes from the calling thread's private free list.
///
/// Returns `None` as well if the thread's storage has already been torn down.
pub fn allocate_unlocked(size: usize) -> Option<NonNull<u8>> {
    LOCAL
        .try_with(|blocks| HEAP.allocate_from(&mut blocks.borrow_mut(), size))
        .ok()
        .flatten()
}

/// Release memory from [`allocate_unlocked`] to the calling thread's private
/// free list. A null `ptr` is ignored.
///
/// # Safety
///
/// `ptr` must be null or have come from `allocate_unlocked` on this same
/// thread, and not been released since.
pub unsafe fn release_unlocked(ptr: *mut u8) {
    let ptr = match NonNull::new(ptr) {
        None => return,
        Some(ptr) => ptr,
    };

    // If the thread is already exiting, its list is gone and the block leaks.
    let _ = LOCAL.try_with(|blocks| {
        blocks.borrow_mut().reclaim(Block::from_payload(ptr));
    });
}

/// Statistics and validity of the process-wide shared free list.
pub fn shared_stats() -> (Validity, Stats) {
    HEAP.stats()
}

/// Statistics and validity of the calling thread's private free list.
pub fn local_stats() -> (Validity, Stats) {
    LOCAL.with(|blocks| blocks.borrow().stats())
}

/// How far the process heap has been grown through these functions.
pub fn heap_stats() -> HeapStats {
    HEAP.heap_stats()
}
