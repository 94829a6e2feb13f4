//! Block headers, and the raw address arithmetic around them.
//!
//! Every region of heap memory handed out or held for reuse starts with a
//! [`BlockHeader`]. The caller only ever sees the payload, which begins exactly
//! [`HEADER_SIZE`] bytes after the header:
//!
//! ```text
//!   header                  payload                         end
//!   |                       |                               |
//!   v                       v                               v
//!   +-----------------------+-------------------------------+
//!   | size | next | prev    |   payload_size bytes          |
//!   +-----------------------+-------------------------------+
//! ```
//!
//! Everything else in the crate works in terms of [`Block`] handles. This is
//! the only module that adds or subtracts offsets from pointers.

use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

/// The header preceding every block, free or allocated.
///
/// `next` and `prev` are only meaningful while the block sits on a free list;
/// once handed to a caller they are stale and nothing reads them.
///
/// We use C representation and align to 16 bytes, which keeps every payload
/// 16-byte aligned as long as all sizes are multiples of 16.
#[repr(C, align(16))]
pub struct BlockHeader {
    payload_size: usize,
    next: Option<Block>,
    prev: Option<Block>,
}

/// Alignment of every header, and therefore of every payload.
pub const HEADER_ALIGN: usize = core::mem::align_of::<BlockHeader>();

/// Bytes occupied by a header in front of each payload.
pub const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

const_assert!(HEADER_ALIGN == 16);
const_assert!(HEADER_SIZE % HEADER_ALIGN == 0);

/// Round `size` up to a multiple of [`HEADER_ALIGN`].
///
/// Returns `None` on overflow.
pub const fn round_to_align(size: usize) -> Option<usize> {
    match size.checked_add(HEADER_ALIGN - 1) {
        Some(padded) => Some(padded & !(HEADER_ALIGN - 1)),
        None => None,
    }
}

/// A handle to a block header somewhere in the heap.
///
/// This is a plain pointer wrapper: it is `Copy`, compares by address, and
/// owns nothing. Whoever holds the block (a free list, or the caller that was
/// handed its payload) is responsible for it.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block {
    header: NonNull<BlockHeader>,
}

impl Block {
    /// Write a fresh header at `at`, with no links, and return its handle.
    ///
    /// # Safety
    ///
    /// `at` must be aligned to [`HEADER_ALIGN`] and point to at least
    /// `HEADER_SIZE + payload_size` bytes of memory that nothing else is using.
    pub unsafe fn init(at: NonNull<u8>, payload_size: usize) -> Block {
        debug_assert_eq!(at.as_ptr() as usize % HEADER_ALIGN, 0);
        let header: NonNull<BlockHeader> = at.cast();
        header.as_ptr().write(BlockHeader {
            payload_size,
            next: None,
            prev: None,
        });
        Block { header }
    }

    /// Recover the block from a payload address previously returned by
    /// [`Block::payload`].
    ///
    /// # Safety
    ///
    /// `payload` must have come from `Block::payload` of a block whose header
    /// is still intact.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Block {
        let header = payload.as_ptr().sub(HEADER_SIZE) as *mut BlockHeader;
        Block {
            header: NonNull::new_unchecked(header),
        }
    }

    /// The address handed out to callers: the first byte after the header.
    pub fn payload(self) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((self.header.as_ptr() as *mut u8).add(HEADER_SIZE)) }
    }

    /// Address of the header itself.
    pub fn addr(self) -> *const u8 {
        self.header.as_ptr() as *const u8
    }

    /// One past the last payload byte.
    pub fn end(self) -> *const u8 {
        unsafe { (self.payload().as_ptr() as *const u8).add(self.payload_size()) }
    }

    /// The whole region covered by this block, header included.
    pub fn span(self) -> Range<*const u8> {
        self.addr()..self.end()
    }

    /// Whether `other`'s header starts exactly where this block's payload ends.
    pub fn is_followed_by(self, other: Block) -> bool {
        self.end() == other.addr()
    }

    /// Bytes usable by the caller, excluding the header.
    pub fn payload_size(self) -> usize {
        self.header_view().payload_size
    }

    pub(crate) fn next(self) -> Option<Block> {
        self.header_view().next
    }

    pub(crate) fn prev(self) -> Option<Block> {
        self.header_view().prev
    }

    /// # Safety
    ///
    /// Changing the size of a block changes what memory it claims.
    pub(crate) unsafe fn set_payload_size(self, size: usize) {
        (*self.header.as_ptr()).payload_size = size;
    }

    /// # Safety
    ///
    /// The caller keeps the owning free list consistent.
    pub(crate) unsafe fn set_next(self, next: Option<Block>) {
        (*self.header.as_ptr()).next = next;
    }

    /// # Safety
    ///
    /// The caller keeps the owning free list consistent.
    pub(crate) unsafe fn set_prev(self, prev: Option<Block>) {
        (*self.header.as_ptr()).prev = prev;
    }

    /// Write a new header `offset` bytes into this block's payload, covering
    /// everything from there to the end of this block. This block is left
    /// untouched; the caller truncates it.
    ///
    /// # Safety
    ///
    /// `offset + HEADER_SIZE` must be strictly less than `payload_size`, and
    /// `offset` a multiple of [`HEADER_ALIGN`].
    pub(crate) unsafe fn carve(self, offset: usize) -> Block {
        let size = self.payload_size();
        debug_assert!(offset + HEADER_SIZE < size);
        let at = NonNull::new_unchecked(self.payload().as_ptr().add(offset));
        Block::init(at, size - offset - HEADER_SIZE)
    }

    fn header_view(&self) -> &BlockHeader {
        unsafe { self.header.as_ref() }
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:?}, {})", self.header, self.payload_size())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[repr(C, align(16))]
    struct Arena([u8; 512]);

    #[test]
    fn header_and_payload_are_one_header_apart() {
        let mut arena = Arena([0; 512]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();

        let block = unsafe { Block::init(base, 128) };
        let payload = block.payload();
        assert_eq!(payload.as_ptr() as usize - base.as_ptr() as usize, HEADER_SIZE);

        let back = unsafe { Block::from_payload(payload) };
        assert_eq!(back, block);
        assert_eq!(back.payload_size(), 128);
        assert_eq!(back.end() as usize, base.as_ptr() as usize + HEADER_SIZE + 128);
        assert_eq!(payload.as_ptr() as usize % HEADER_ALIGN, 0);
    }

    #[test]
    fn carve_leaves_contiguous_blocks() {
        let mut arena = Arena([0; 512]);
        let base = NonNull::new(arena.0.as_mut_ptr()).unwrap();

        let block = unsafe { Block::init(base, 512 - HEADER_SIZE) };
        let rest = unsafe { block.carve(64) };
        unsafe { block.set_payload_size(64) };

        assert!(block.is_followed_by(rest));
        assert!(!rest.is_followed_by(block));
        assert_eq!(rest.payload_size(), 512 - 2 * HEADER_SIZE - 64);
        assert_eq!(rest.end() as usize, base.as_ptr() as usize + 512);
        assert!(rest.next().is_none() && rest.prev().is_none());
    }

    #[test]
    fn rounding() {
        assert_eq!(round_to_align(1), Some(16));
        assert_eq!(round_to_align(16), Some(16));
        assert_eq!(round_to_align(50), Some(64));
        assert_eq!(round_to_align(0), Some(0));
        assert_eq!(round_to_align(usize::MAX), None);
    }
}
