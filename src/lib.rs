#![cfg_attr(not(any(feature = "std", test)), no_std)]

//! A best-fit free-list allocator.
//!
//! Memory comes from the OS through a [`HeapGrower`](heap::HeapGrower) and is
//! never given back. Released blocks go on an address-ordered free list, merge
//! with any neighbour they touch, and are handed out again by best fit,
//! splitting off whatever is not needed.
//!
//! There are two ways to use it, over the same heap:
//!
//! - [`Allocator::allocate_locked`] / [`Allocator::release_locked`] share one
//!   free list between all threads, with every call serialized by a lock.
//! - [`LocalAllocator::allocate_unlocked`] /
//!   [`LocalAllocator::release_unlocked`] keep a free list private to one
//!   thread and take no lock, except when the heap has to grow.
//!
//! With the `std` feature, the [`global`] module provides both over a single
//! process-wide heap grown with `sbrk`, with the private lists in thread-local
//! storage.
//!
//! ```
//! use bestfit_allocator::{Allocator, ToyHeap};
//!
//! let allocator = Allocator::new(ToyHeap::default());
//! let p = allocator.allocate_locked(100).unwrap();
//! unsafe { allocator.release_locked(p.as_ptr()) };
//!
//! let mut local = allocator.local();
//! let q = local.allocate_unlocked(100).unwrap();
//! unsafe { local.release_unlocked(q.as_ptr()) };
//! ```

// Logging is opt-in: a logger that allocates would recurse into us when we
// are the global allocator. Without the `log` feature these only evaluate
// their arguments.
macro_rules! trace {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        log::trace!($($arg)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($arg)*);
    }};
}

macro_rules! warn {
    ($($arg:tt)*) => {{
        #[cfg(feature = "log")]
        log::warn!($($arg)*);
        #[cfg(not(feature = "log"))]
        let _ = format_args!($($arg)*);
    }};
}

pub mod allocators;
pub mod block;
pub mod freelist;
#[cfg(all(feature = "std", unix))]
pub mod global;
pub mod heap;

pub use allocators::{Allocator, LocalAllocator};
pub use block::{Block, HEADER_ALIGN, HEADER_SIZE};
pub use freelist::{FreeList, Stats, Validity};
#[cfg(unix)]
pub use heap::SbrkHeapGrower;
pub use heap::{HeapGrower, HeapStats, ToyHeap};
