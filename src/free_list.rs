//! The address-ordered free list.
//!
//! The list is intrusive: the `prev`/`next` links live inside the headers of the free blocks,
//! so the list itself is nothing but a head and a tail. Every block reachable from a
//! [`FreeList`] is an initialised header that the list owns exclusively. Only the `unsafe`
//! entry points can add blocks, so everything that merely walks the list is safe.

use core::iter::FusedIterator;

use crate::block::{BlockRef, HEADER_SIZE, is_adjacent};

/// A doubly-linked list of free blocks, sorted by ascending address.
///
/// A list is the only handle to the headers it links, so it cannot be copied out of the heap
/// that owns it:
///
/// ```compile_fail,E0507
/// fn keep(heap: &bfalloc::Heap<bfalloc::Region>) -> bfalloc::FreeList {
///     heap.inspect(|free| *free)
/// }
/// ```
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<BlockRef>,
    tail: Option<BlockRef>,
}

impl FreeList {
    /// Creates an empty free list.
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
        }
    }

    /// The lowest-addressed free block.
    pub fn head(&self) -> Option<BlockRef> {
        self.head
    }

    /// The highest-addressed free block.
    pub fn tail(&self) -> Option<BlockRef> {
        self.tail
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Count of free blocks.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Total payload bytes held by free blocks. Headers are not counted.
    pub fn free_bytes(&self) -> usize {
        self.iter().map(|(_, size)| size).sum()
    }

    /// Iterates `(block, data_size)` pairs from head to tail.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            next: self.head,
            _list: self,
        }
    }

    /// Finds the free block with the smallest `data_size` that still holds `size` bytes.
    ///
    /// An exact fit ends the scan early. Among equally sized candidates the lowest address wins.
    pub fn best_fit(&self, size: usize) -> Option<BlockRef> {
        let mut candidate: Option<(BlockRef, usize)> = None;
        for (block, data_size) in self.iter() {
            if data_size == size {
                return Some(block);
            }
            if data_size > size && candidate.is_none_or(|(_, best)| data_size < best) {
                candidate = Some((block, data_size));
            }
        }
        candidate.map(|(block, _)| block)
    }

    /// Inserts `block` at its address-ordered position.
    ///
    /// # Safety
    ///
    /// `block` must be an initialised header that is not in any free list and is owned by the
    /// caller. Ownership passes to the list.
    pub unsafe fn insert(&mut self, block: BlockRef) {
        // SAFETY: forwarded from the caller.
        unsafe { self.link(block) };
        self.debug_check();
    }

    /// Insertion without the trailing consistency check, which would trip over the adjacent
    /// blocks that [`FreeList::release`] is about to merge.
    ///
    /// # Safety
    ///
    /// Same as [`FreeList::insert`].
    unsafe fn link(&mut self, block: BlockRef) {
        // SAFETY: the caller hands us `block`; every other header touched is a list member.
        unsafe {
            block.unlink();
            match (self.head, self.tail) {
                (Some(head), Some(tail)) => {
                    if block < head {
                        block.set_next(Some(head));
                        head.set_prev(Some(block));
                        self.head = Some(block);
                    } else if block > tail {
                        block.set_prev(Some(tail));
                        tail.set_next(Some(block));
                        self.tail = Some(block);
                    } else {
                        // head < block < tail, so a successor always exists.
                        let mut prev = head;
                        while let Some(next) = prev.next() {
                            if next > block {
                                break;
                            }
                            prev = next;
                        }
                        let next = prev.next();
                        block.set_prev(Some(prev));
                        block.set_next(next);
                        prev.set_next(Some(block));
                        if let Some(next) = next {
                            next.set_prev(Some(block));
                        }
                    }
                }
                _ => {
                    self.head = Some(block);
                    self.tail = Some(block);
                }
            }
        }
        atrace!("Inserted free block {:?}", block);
    }

    /// Detaches `block` from the list and clears its links. Ownership passes back to the caller.
    ///
    /// # Safety
    ///
    /// `block` must currently be a member of this list.
    pub unsafe fn remove(&mut self, block: BlockRef) {
        // SAFETY: `block` and its neighbours are list members.
        unsafe {
            let prev = block.prev();
            let next = block.next();
            match prev {
                Some(prev) => prev.set_next(next),
                None => self.head = next,
            }
            match next {
                Some(next) => next.set_prev(prev),
                None => self.tail = prev,
            }
            block.unlink();
        }
        atrace!("Removed free block {:?}", block);
        self.debug_check();
    }

    /// Puts `new` into the list position currently held by `old`.
    ///
    /// # Safety
    ///
    /// `old` must be a member of this list and `new` an owned header whose address keeps the
    /// list sorted at that position.
    unsafe fn replace(&mut self, old: BlockRef, new: BlockRef) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            let prev = old.prev();
            let next = old.next();
            new.set_prev(prev);
            new.set_next(next);
            match prev {
                Some(prev) => prev.set_next(Some(new)),
                None => self.head = Some(new),
            }
            match next {
                Some(next) => next.set_prev(Some(new)),
                None => self.tail = Some(new),
            }
            old.unlink();
        }
    }

    /// Splits `block` so that it holds exactly `size` bytes, leaving the remainder free.
    ///
    /// The remainder header sits right after the shrunk payload and takes over `block`'s list
    /// position. Does nothing and returns `None` if `block` cannot hold both `size` bytes and a
    /// remainder header.
    ///
    /// # Safety
    ///
    /// `block` must be a member of this list and `size` a multiple of
    /// [`ALIGN`](crate::block::ALIGN). On success `block` is no longer a member.
    pub unsafe fn split(&mut self, block: BlockRef, size: usize) -> Option<BlockRef> {
        // SAFETY: `block` is a list member.
        let data_size = unsafe { block.data_size() };
        let remainder_size = data_size.checked_sub(HEADER_SIZE.checked_add(size)?)?;
        let remainder = block.offset(HEADER_SIZE + size)?;
        // SAFETY: the remainder lies inside `block`'s payload, which the list owns, and is
        // aligned because both the header and `size` are multiples of `ALIGN`. Its address
        // is above `block` and below `block`'s successor.
        unsafe {
            remainder.init(remainder_size);
            block.set_data_size(size);
            self.replace(block, remainder);
        }
        atrace!(
            "Split {:?} into {} bytes and remainder {:?} ({} bytes)",
            block,
            size,
            remainder,
            remainder_size
        );
        self.debug_check();
        Some(remainder)
    }

    /// Takes `block` out of the list for an allocation of `size` bytes.
    ///
    /// The block is split when it has room for a remainder header. Otherwise it is consumed
    /// whole and keeps its original `data_size`.
    ///
    /// # Safety
    ///
    /// `block` must be a member of this list holding at least `size` bytes, and `size` a
    /// multiple of [`ALIGN`](crate::block::ALIGN).
    pub unsafe fn take(&mut self, block: BlockRef, size: usize) -> BlockRef {
        // SAFETY: forwarded from the caller.
        unsafe {
            if self.split(block, size).is_none() {
                self.remove(block);
            }
        }
        block
    }

    /// Merges `second` into `first` if they are physically adjacent.
    ///
    /// # Safety
    ///
    /// `first` and `second` must be members of this list with `second` directly after `first`.
    unsafe fn coalesce(&mut self, first: BlockRef, second: BlockRef) -> bool {
        // SAFETY: both blocks are list members.
        unsafe {
            let first_size = first.data_size();
            if !is_adjacent(first.addr(), first_size, second.addr()) {
                return false;
            }
            let second_size = second.data_size();
            first.set_data_size(first_size + HEADER_SIZE + second_size);
            let next = second.next();
            first.set_next(next);
            match next {
                Some(next) => next.set_prev(Some(first)),
                None => self.tail = Some(first),
            }
            second.unlink();
        }
        atrace!("Coalesced {:?} into {:?}", second, first);
        true
    }

    /// Returns a released block to the list and merges it with adjacent free neighbours.
    ///
    /// The successor is tried first, then the predecessor, so a block released between two
    /// free neighbours ends up as one block starting at the predecessor.
    ///
    /// # Safety
    ///
    /// Same as [`FreeList::insert`].
    pub unsafe fn release(&mut self, block: BlockRef) {
        // SAFETY: after insertion `block` and its neighbours are list members.
        unsafe {
            self.link(block);
            if let Some(next) = block.next() {
                self.coalesce(block, next);
            }
            if let Some(prev) = block.prev() {
                self.coalesce(prev, block);
            }
        }
        self.debug_check();
    }

    fn debug_check(&self) {
        #[cfg(debug_assertions)]
        self.condition_check();
    }

    /// Walks the list and panics if it is unsorted, holds two adjacent blocks, or has
    /// inconsistent links.
    #[track_caller]
    pub fn condition_check(&self) {
        assert_eq!(
            self.head.is_none(),
            self.tail.is_none(),
            "Free list head and tail disagree on emptiness"
        );

        let mut forward = 0usize;
        let mut prev: Option<(BlockRef, usize)> = None;
        for (block, data_size) in self.iter() {
            // SAFETY: every block reachable from the list is an initialised header.
            let back = unsafe { block.prev() };
            assert_eq!(
                back,
                prev.map(|(prev, _)| prev),
                "Broken back link at {block:?}"
            );
            if let Some((prev, prev_size)) = prev {
                assert!(prev < block, "Free list out of order at {block:?}");
                assert!(
                    !is_adjacent(prev.addr(), prev_size, block.addr()),
                    "Adjacent free blocks {prev:?} and {block:?} were not merged"
                );
            }
            prev = Some((block, data_size));
            forward += 1;
        }
        assert_eq!(
            prev.map(|(block, _)| block),
            self.tail,
            "Free list tail is not the last block"
        );

        let mut backward = 0usize;
        let mut cursor = self.tail;
        while let Some(block) = cursor {
            backward += 1;
            // SAFETY: every block reachable from the list is an initialised header.
            cursor = unsafe { block.prev() };
        }
        assert_eq!(forward, backward, "Forward and backward walks differ");
    }
}

/// Iterator over the blocks of a [`FreeList`].
#[derive(Debug)]
pub struct Iter<'a> {
    next: Option<BlockRef>,
    _list: &'a FreeList,
}

impl Iterator for Iter<'_> {
    type Item = (BlockRef, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let block = self.next?;
        // SAFETY: every block reachable from the list is an initialised header, and the borrow
        // of the list keeps it from changing underneath us.
        let header = unsafe { block.read() };
        self.next = header.next;
        Some((block, header.data_size))
    }
}

impl FusedIterator for Iter<'_> {}
