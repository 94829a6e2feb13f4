//! The two allocator variants.
//!
//! ## [`Allocator`](struct.Allocator.html)
//!
//! An `Allocator` owns the heap boundary and one shared free list, both behind
//! a single spin lock. Its `allocate_locked` / `release_locked` hold that lock
//! for the whole operation, so every call through it is serialized.
//!
//! It also implements
//! [`core::alloc::GlobalAlloc`](https://doc.rust-lang.org/core/alloc/trait.GlobalAlloc.html)
//! through the locked variant, and can be constructed in a `static`.
//!
//! ## [`LocalAllocator`](struct.LocalAllocator.html)
//!
//! A `LocalAllocator` is a per-thread private free list attached to an
//! `Allocator`. Searching, splitting and releasing touch only the private list
//! and take no lock; only growing the heap goes through the `Allocator`'s lock.
//! It cannot be sent to or shared with another thread, so a block released on
//! one thread is never handed out on another.
//!
//! Both variants return `None` for a zero-sized request, or one too large to
//! ever satisfy, without touching any list or the heap boundary.

use core::alloc::{GlobalAlloc, Layout};
use core::marker::PhantomData;
use core::ptr::{null_mut, NonNull};

use spin::{Mutex, MutexGuard};

use crate::block::{round_to_align, Block, HEADER_ALIGN, HEADER_SIZE};
use crate::freelist::{FreeList, Stats, Validity};
use crate::heap::{HeapExtender, HeapGrower, HeapStats};

/// Turn a requested size into the payload size we actually hand out, or `None`
/// if the request is invalid: zero, or too large to ever fit in a heap.
pub fn payload_size(size: usize) -> Option<usize> {
    if size == 0 {
        return None;
    }
    let rounded = round_to_align(size)?;
    let total = rounded.checked_add(HEADER_SIZE)?;
    if total > isize::MAX as usize {
        return None;
    }
    Some(rounded)
}

struct HeapState<G> {
    extender: HeapExtender<G>,
    shared: FreeList,
}

/// A heap boundary plus a shared free list, behind one lock.
///
/// Note: it never returns memory to the OS.
pub struct Allocator<G> {
    state: Mutex<HeapState<G>>,
}

impl<G: HeapGrower + Default> Default for Allocator<G> {
    fn default() -> Self {
        Self::new(G::default())
    }
}

impl<G> Allocator<G> {
    pub const fn new(grower: G) -> Self {
        Allocator {
            state: Mutex::new(HeapState {
                extender: HeapExtender::new(grower),
                shared: FreeList::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapState<G>> {
        self.state.lock()
    }

    /// Get statistics on the shared free list, and verify its validity.
    pub fn stats(&self) -> (Validity, Stats) {
        self.lock().shared.stats()
    }

    /// How much the heap has been grown so far.
    pub fn heap_stats(&self) -> HeapStats {
        self.lock().extender.stats()
    }

    /// Look at the shared free list under the lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&FreeList) -> R) -> R {
        f(&self.lock().shared)
    }

    /// Look at the heap grower under the lock.
    pub fn with_grower<R>(&self, f: impl FnOnce(&G) -> R) -> R {
        f(self.lock().extender.grower())
    }
}

impl<G: HeapGrower> Allocator<G> {
    /// Allocate `size` bytes from the shared free list, growing the heap if no
    /// free block is big enough.
    ///
    /// The lock is held across the search, the split or extension, and nothing
    /// else can touch the shared list meanwhile.
    pub fn allocate_locked(&self, size: usize) -> Option<NonNull<u8>> {
        let size = payload_size(size)?;

        let mut state = self.lock();
        let HeapState { extender, shared } = &mut *state;
        let block = match shared.take(size) {
            Some(block) => block,
            None => grow(extender, size)?,
        };

        Some(block.payload())
    }

    /// Return memory obtained from [`allocate_locked`](Allocator::allocate_locked)
    /// to the shared free list. A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by `allocate_locked` on this
    /// allocator, and not released since. Releasing anything else, or releasing
    /// twice, corrupts the free list. In debug builds, releasing a block that
    /// is still on the free list panics.
    pub unsafe fn release_locked(&self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            None => return,
            Some(ptr) => ptr,
        };

        let block = Block::from_payload(ptr);
        self.lock().shared.reclaim(block);
    }

    /// Grow the heap by one block for the thread-local variant. The lock is
    /// held only for the extension.
    fn extend(&self, size: usize) -> Option<Block> {
        grow(&mut self.lock().extender, size)
    }

    /// Allocate from a caller-owned free list, falling back on the heap.
    pub(crate) fn allocate_from(&self, blocks: &mut FreeList, size: usize) -> Option<NonNull<u8>> {
        let size = payload_size(size)?;

        let block = match blocks.take(size) {
            Some(block) => block,
            None => self.extend(size)?,
        };

        Some(block.payload())
    }

    /// Create a private free list attached to this allocator, for use on the
    /// current thread only.
    pub fn local(&self) -> LocalAllocator<'_, G> {
        LocalAllocator {
            heap: self,
            blocks: FreeList::new(),
            _not_send: PhantomData,
        }
    }
}

fn grow<G: HeapGrower>(extender: &mut HeapExtender<G>, size: usize) -> Option<Block> {
    match extender.extend(size) {
        Ok(block) => Some(block),
        Err(_err) => {
            warn!("could not grow heap by {} bytes: {:?}", size + HEADER_SIZE, _err);
            None
        }
    }
}

unsafe impl<G: HeapGrower + Send> GlobalAlloc for Allocator<G> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > HEADER_ALIGN {
            return null_mut();
        }
        self.allocate_locked(layout.size())
            .map(NonNull::as_ptr)
            .unwrap_or(null_mut())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        self.release_locked(ptr)
    }
}

/// A free list private to one thread, growing the heap of a shared
/// [`Allocator`] when it runs dry.
///
/// Blocks still on this list when it is dropped are leaked; they never move to
/// the shared list or to another thread.
pub struct LocalAllocator<'heap, G> {
    heap: &'heap Allocator<G>,
    blocks: FreeList,
    // Keeps this !Send and !Sync.
    _not_send: PhantomData<*mut ()>,
}

impl<'heap, G: HeapGrower> LocalAllocator<'heap, G> {
    /// Allocate `size` bytes from this thread's free list, growing the shared
    /// heap if no free block is big enough. Only the growth takes a lock.
    pub fn allocate_unlocked(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.heap.allocate_from(&mut self.blocks, size)
    }

    /// Return memory to this thread's free list. A null `ptr` is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or have been returned by `allocate_unlocked` on this
    /// `LocalAllocator`, and not released since.
    pub unsafe fn release_unlocked(&mut self, ptr: *mut u8) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.blocks.reclaim(Block::from_payload(ptr));
        }
    }

    pub fn free_list(&self) -> &FreeList {
        &self.blocks
    }

    /// Get statistics on this thread's free list, and verify its validity.
    pub fn stats(&self) -> (Validity, Stats) {
        self.blocks.stats()
    }
}
