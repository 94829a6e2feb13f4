use core::fmt;

use crate::block::{round_to_align, Block, HEADER_SIZE};

/// An enum for easy comparison of blocks and their order
enum Relation {
    Before,
    AdjacentBefore,
    Overlapping,
    AdjacentAfter,
    After,
}

fn relation(this: Block, other: Block) -> Relation {
    let this_range = this.span();
    let other_range = other.span();

    if this_range.end < other_range.start {
        Relation::Before
    } else if this_range.end == other_range.start {
        Relation::AdjacentBefore
    } else if this_range.start < other_range.end {
        Relation::Overlapping
    } else if this_range.start == other_range.end {
        Relation::AdjacentAfter
    } else {
        Relation::After
    }
}

/// A `FreeList` is a doubly-linked list of currently unused blocks, threaded
/// through the blocks' own headers.
///
/// Each block should be considered "owned" by the list while it is inserted.
/// Blocks may be split or merged internally.
///
/// It maintains a few internal invariants:
///
/// - Blocks are ordered by ascending address, head to tail.
/// - Each block's `prev` is the block whose `next` points at it; the head has
///   no `prev`.
/// - No two blocks are precisely adjacent once a release has finished
///   (`combine` merges them).
pub struct FreeList {
    head: Option<Block>,
}

// A FreeList is sendable - as long as the whole chain moves with it, it's fine.
// It is not Sync; sharing one between threads needs a lock around it.
unsafe impl Send for FreeList {}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BlockIter<'list> {
    next: Option<Block>,
    _list: core::marker::PhantomData<&'list FreeList>,
}

impl<'list> Iterator for BlockIter<'list> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next.take()?;
        self.next = block.next();
        Some(block)
    }
}

impl<'list> IntoIterator for &'list FreeList {
    type Item = Block;
    type IntoIter = BlockIter<'list>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FreeList(")?;
        let mut start = true;
        for block in self {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

/// Validity contains a representation of all invalid states found in a
/// FreeList.
#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Validity {
    /// Number of blocks overlapping other blocks.
    ///
    /// This likely indicates corruption, or a double free.
    ///
    /// If there are also out of order blocks, this might undercount.
    pub overlaps: usize,

    /// Number of blocks that are directly adjacent to each other, and not
    /// merged.
    pub adjacents: usize,

    /// Number of blocks that do not have an address less than their next.
    pub out_of_orders: usize,

    /// Number of blocks whose `prev` does not point back at the block before
    /// them.
    pub broken_links: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.overlaps == 0 && self.adjacents == 0 && self.out_of_orders == 0 && self.broken_links == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Stats {
    /// Number of free blocks.
    pub length: usize,
    /// Total payload bytes across all free blocks.
    pub size: usize,
    /// Payload size of the largest free block.
    pub largest: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        FreeList { head: None }
    }

    pub fn iter(&self) -> BlockIter<'_> {
        BlockIter {
            next: self.head,
            _list: core::marker::PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Check current size of the list, and whether it's valid.
    pub fn stats(&self) -> (Validity, Stats) {
        let mut validity: Validity = Default::default();
        let mut stats: Stats = Default::default();

        let mut previous: Option<Block> = None;
        for block in self.iter() {
            if block.prev() != previous {
                validity.broken_links += 1;
            }

            match previous.map(|p| relation(p, block)) {
                Some(Relation::Before) => {
                    // This is valid, do nothing.
                }
                Some(Relation::AdjacentBefore) => {
                    // Right order, but these should be merged.
                    validity.adjacents += 1;
                }
                Some(Relation::Overlapping) => {
                    // This is really bad.
                    validity.overlaps += 1;
                }
                Some(Relation::AdjacentAfter) => {
                    // Wrong order, and these should be merged.
                    validity.out_of_orders += 1;
                    validity.adjacents += 1;
                }
                Some(Relation::After) => {
                    // Wrong order.
                    validity.out_of_orders += 1;
                }
                None => {
                    // This is the first in the list. Valid, do nothing.
                }
            }

            stats.length += 1;
            stats.size += block.payload_size();
            stats.largest = stats.largest.max(block.payload_size());
            previous = Some(block);
        }

        (validity, stats)
    }

    /// Link `block` into the list, keeping ascending address order.
    ///
    /// Walks from the head to the first block at a higher address and splices
    /// `block` in front of it, or appends at the tail. No merging happens here;
    /// see [`combine`](FreeList::combine).
    ///
    /// # Safety
    ///
    /// `block` must have an intact header, must not already be on any free
    /// list, and its memory must not be in use by anything else. Ownership of
    /// that memory passes to the list.
    pub unsafe fn insert(&mut self, block: Block) {
        let mut prev: Option<Block> = None;
        let mut next = self.head;
        while let Some(candidate) = next {
            if candidate > block {
                break;
            }
            prev = Some(candidate);
            next = candidate.next();
        }

        debug_assert!(
            prev.map_or(true, |p| !matches!(relation(p, block), Relation::Overlapping)),
            "Overlapping memory blocks: {:?} and {:?}",
            prev,
            block,
        );
        debug_assert!(
            next.map_or(true, |n| !matches!(relation(block, n), Relation::Overlapping)),
            "Overlapping memory blocks: {:?} and {:?}",
            block,
            next,
        );

        block.set_prev(prev);
        block.set_next(next);
        match prev {
            None => self.head = Some(block),
            Some(p) => p.set_next(Some(block)),
        }
        if let Some(n) = next {
            n.set_prev(Some(block));
        }
    }

    /// Unlink `block`, wherever it sits, and clear its links.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list.
    pub unsafe fn remove(&mut self, block: Block) {
        let prev = block.prev();
        let next = block.next();

        match prev {
            None => {
                debug_assert_eq!(self.head, Some(block), "Removing a block not on this list");
                self.head = next;
            }
            Some(p) => p.set_next(next),
        }
        if let Some(n) = next {
            n.set_prev(prev);
        }

        block.set_prev(None);
        block.set_next(None);
    }

    /// Find the smallest block whose payload holds at least `size` bytes.
    ///
    /// An exact fit ends the search at once. Otherwise the smallest candidate
    /// wins, and among equally small candidates the lowest address does, as
    /// only a strictly smaller block replaces the current best.
    pub fn find_best_fit(&self, size: usize) -> Option<Block> {
        let mut best: Option<Block> = None;
        for block in self.iter() {
            let block_size = block.payload_size();
            if block_size == size {
                return Some(block);
            }
            if block_size > size && best.map_or(true, |b| block_size < b.payload_size()) {
                best = Some(block);
            }
        }
        best
    }

    /// Take `requested` bytes out of `block`, which leaves the list.
    ///
    /// If carving would not leave room for a new header plus at least one
    /// payload byte, the whole block is handed out uncut. Otherwise a new block
    /// starts `requested` bytes into the payload, takes the remainder, and
    /// replaces `block` on the list. Returns `block`, no longer on the list.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list, hold at least `requested`
    /// bytes, and `requested` must be a multiple of
    /// [`HEADER_ALIGN`](crate::block::HEADER_ALIGN).
    pub unsafe fn split(&mut self, block: Block, requested: usize) -> Block {
        debug_assert!(block.payload_size() >= requested);

        if block.payload_size() <= requested + HEADER_SIZE {
            self.remove(block);
            return block;
        }

        let rest = block.carve(requested);
        block.set_payload_size(requested);
        self.remove(block);
        self.insert(rest);
        trace!("split {:?} off, leaving {:?}", block, rest);
        block
    }

    /// Merge a just-inserted `block` with its list neighbours where they are
    /// contiguous in memory. Returns the block that now covers `block`'s
    /// memory: `block` itself, or its predecessor if it was absorbed.
    ///
    /// This relies on address order: list neighbours are the only candidates
    /// for address neighbours.
    ///
    /// # Safety
    ///
    /// `block` must currently be on this list.
    pub unsafe fn combine(&mut self, block: Block) -> Block {
        if let Some(next) = block.next() {
            if block.is_followed_by(next) {
                self.remove(next);
                block.set_payload_size(block.payload_size() + HEADER_SIZE + next.payload_size());
            }
        }

        if let Some(prev) = block.prev() {
            if prev.is_followed_by(block) {
                self.remove(block);
                prev.set_payload_size(prev.payload_size() + HEADER_SIZE + block.payload_size());
                return prev;
            }
        }

        block
    }

    /// Best fit followed by split: remove and return a block of at least
    /// `size` bytes, or `None` if `size` is zero or nothing on the list is big
    /// enough.
    ///
    /// `size` is first rounded up to a multiple of
    /// [`HEADER_ALIGN`](crate::block::HEADER_ALIGN), so any remainder left on
    /// the list starts on an aligned header.
    pub fn take(&mut self, size: usize) -> Option<Block> {
        if size == 0 {
            return None;
        }
        let size = round_to_align(size)?;
        let found = self.find_best_fit(size)?;
        // Safety: found came off this list and holds at least `size` bytes.
        Some(unsafe { self.split(found, size) })
    }

    /// Return a released block to the list, merging it with its neighbours.
    ///
    /// # Safety
    ///
    /// As for [`insert`](FreeList::insert).
    pub unsafe fn reclaim(&mut self, block: Block) -> Block {
        self.insert(block);
        self.combine(block)
    }
}
