//! Growing the heap.
//!
//! ## [`HeapGrower`](trait.HeapGrower.html)
//!
//! `HeapGrower` abstracts over the one call we make to the OS: move the heap
//! boundary up by some number of bytes. It can fail, and we never give memory
//! back.
//!
//! Inside the crate, a `HeapExtender` owns a grower and turns a successful
//! growth into a fresh, allocated [`Block`]. It is the heap boundary shared by
//! every thread of an [`Allocator`](crate::Allocator).
//!
//! ## [`SbrkHeapGrower`](struct.SbrkHeapGrower.html)
//!
//! Grows the program break with `sbrk(2)`. There is only one program break per
//! process, so every `SbrkHeapGrower` moves it under the same process-wide
//! lock, however many allocators are built on one.
//!
//! ## [`ToyHeap`](struct.ToyHeap.html)
//!
//! `ToyHeap` is a static array that can pretend to be a heap, and implements
//! `HeapGrower` for such a purpose. It is mainly useful for testing.

use core::fmt;
use core::ptr::NonNull;

use crate::block::{Block, HEADER_ALIGN, HEADER_SIZE};

pub trait HeapGrower {
    type Err: fmt::Debug;

    /// Grow the heap by exactly `size` bytes, returning the start of the new
    /// region.
    ///
    /// # Safety
    ///
    /// This is pretty much entirely unsafe.
    ///
    /// For this to function properly with the other types in this crate, a
    /// returned pointer must be aligned to [`HEADER_ALIGN`], and the `size`
    /// bytes behind it must be writable and untracked by any other code,
    /// including the allocator itself.
    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;
}

/// Counters kept by a [`HeapExtender`].
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Number of successful extensions.
    pub extensions: usize,
    /// Total bytes obtained from the grower, headers included.
    pub bytes: usize,
}

/// The heap boundary: the only thing that ever asks the OS for memory.
pub(crate) struct HeapExtender<G> {
    grower: G,
    stats: HeapStats,
}

impl<G> HeapExtender<G> {
    pub const fn new(grower: G) -> Self {
        HeapExtender {
            grower,
            stats: HeapStats {
                extensions: 0,
                bytes: 0,
            },
        }
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    pub fn grower(&self) -> &G {
        &self.grower
    }
}

impl<G: HeapGrower> HeapExtender<G> {
    /// Grow the heap by one header plus `payload_size` bytes, and return the
    /// new block. The block goes straight to the caller: it is never put on a
    /// free list.
    ///
    /// `payload_size` must be a multiple of [`HEADER_ALIGN`] and small enough
    /// that adding a header cannot overflow.
    pub fn extend(&mut self, payload_size: usize) -> Result<Block, G::Err> {
        debug_assert_eq!(payload_size % HEADER_ALIGN, 0);
        let total = payload_size + HEADER_SIZE;

        // Safety: the grower hands back `total` fresh, aligned bytes.
        let block = unsafe {
            let base = self.grower.grow_heap(total)?;
            Block::init(base, payload_size)
        };

        self.stats.extensions += 1;
        self.stats.bytes += total;
        trace!("extended heap by {} bytes: {:?}", total, block);
        Ok(block)
    }
}

/// SbrkHeapGrower moves the program break to grow the heap upon request.
#[cfg(unix)]
#[derive(Default, Debug)]
pub struct SbrkHeapGrower;

// Held across every sequence of sbrk calls, whichever grower makes them.
#[cfg(unix)]
static BREAK: spin::Mutex<()> = spin::Mutex::new(());

#[cfg(unix)]
impl SbrkHeapGrower {
    pub const fn new() -> Self {
        SbrkHeapGrower
    }

    unsafe fn sbrk(increment: usize) -> Result<*mut u8, errno::Errno> {
        let ptr = libc::sbrk(increment as _);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }
        Ok(ptr as *mut u8)
    }
}

#[cfg(unix)]
impl HeapGrower for SbrkHeapGrower {
    type Err = errno::Errno;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, errno::Errno> {
        if size > isize::MAX as usize {
            return Err(errno::Errno(libc::ENOMEM));
        }

        let _break = BREAK.lock();

        // Anyone else moving the break may leave it unaligned, so pad the
        // request up to the next aligned address.
        let current = Self::sbrk(0)?;
        let pad = current.align_offset(HEADER_ALIGN);
        let base = Self::sbrk(pad + size)?;
        let offset = base.align_offset(HEADER_ALIGN);

        if offset > pad {
            // The break moved between the two calls. Ask for the shortfall,
            // which must land right where the last request ended.
            let extra = Self::sbrk(offset - pad)?;
            if extra != base.add(pad + size) {
                return Err(errno::Errno(libc::ENOMEM));
            }
        }

        Ok(NonNull::new_unchecked(base.add(offset)))
    }
}

/// Size of the arena inside a [`ToyHeap`].
pub const TOY_HEAP_SIZE: usize = 64 * 1024;

/// A fixed arena that hands out its bytes in order, like a tiny program break.
///
/// `limit` caps how many bytes it will hand out, to simulate running out of
/// address space.
#[repr(C, align(16))]
pub struct ToyHeap {
    pub size: usize,
    pub limit: usize,
    heap: [u8; TOY_HEAP_SIZE],
}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap {
            size: 0,
            limit: TOY_HEAP_SIZE,
            heap: [0; TOY_HEAP_SIZE],
        }
    }
}

impl ToyHeap {
    pub fn with_limit(limit: usize) -> Self {
        ToyHeap {
            limit: limit.min(TOY_HEAP_SIZE),
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
    pub available: usize,
}

impl HeapGrower for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn grow_heap(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        let available = self
            .limit
            .min(TOY_HEAP_SIZE)
            .checked_sub(self.size)
            .unwrap_or(0);
        if size > available {
            return Err(ToyHeapOverflowError {
                requested: size,
                available,
            });
        }

        let ptr = self.heap.as_mut_ptr().add(self.size);
        self.size += size;
        Ok(NonNull::new_unchecked(ptr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn extend_builds_a_detached_block() {
        let mut extender = HeapExtender::new(ToyHeap::default());

        let first = extender.extend(64).unwrap();
        let second = extender.extend(128).unwrap();

        assert_eq!(first.payload_size(), 64);
        assert_eq!(second.payload_size(), 128);
        assert!(first.is_followed_by(second));
        assert!(first.next().is_none() && first.prev().is_none());
        assert_eq!(first.payload().as_ptr() as usize % HEADER_ALIGN, 0);

        let stats = extender.stats();
        assert_eq!(stats.extensions, 2);
        assert_eq!(stats.bytes, 64 + 128 + 2 * HEADER_SIZE);
        assert_eq!(extender.grower().size, stats.bytes);
    }

    #[test]
    fn extend_reports_exhaustion() {
        let mut extender = HeapExtender::new(ToyHeap::with_limit(256));

        assert!(extender.extend(128).is_ok());
        let err = extender.extend(128).unwrap_err();
        log::info!("expected failure: {:?}", err);
        assert_eq!(err.requested, 128 + HEADER_SIZE);
        assert_eq!(err.available, 256 - 128 - HEADER_SIZE);

        // A failed extension leaves the boundary where it was
        assert_eq!(extender.stats().extensions, 1);
        assert_eq!(extender.grower().size, 128 + HEADER_SIZE);
    }

    #[test]
    fn toy_heap_never_hands_out_past_its_arena() {
        let mut heap = ToyHeap::default();
        heap.size = 256;
        heap.limit = 128;
        let err = unsafe { heap.grow_heap(HEADER_SIZE) }.unwrap_err();
        assert_eq!(err.available, 0);
        assert_eq!(heap.size, 256);

        let mut heap = ToyHeap::default();
        heap.limit = usize::MAX;
        let err = unsafe { heap.grow_heap(TOY_HEAP_SIZE + HEADER_SIZE) }.unwrap_err();
        assert_eq!(err.available, TOY_HEAP_SIZE);
        assert!(unsafe { heap.grow_heap(TOY_HEAP_SIZE) }.is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn sbrk_grows_aligned() {
        let mut grower = SbrkHeapGrower::new();
        let ptr = unsafe { grower.grow_heap(4 * HEADER_SIZE) }.unwrap();
        assert_eq!(ptr.as_ptr() as usize % HEADER_ALIGN, 0);
        unsafe { ptr.as_ptr().write_bytes(0xAB, 4 * HEADER_SIZE) };
    }
}
