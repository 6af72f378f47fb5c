//! Heap growth.
//!
//! All new block storage comes out of a [`HeapSource`], a region that only ever grows. The
//! allocator never hands memory back, so a source is free to be as simple as a moving break.

use core::{fmt, mem::MaybeUninit, ptr::NonNull};

use thiserror::Error;

use crate::block::{ALIGN, BlockRef, HEADER_SIZE};

/// Why the backing region could not be extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GrowError {
    /// The request does not fit in the address space.
    #[error("a request of {requested:#x} bytes does not fit in the address space")]
    TooLarge {
        /// Payload or increment size that overflowed.
        requested: usize,
    },
    /// A fixed region has run out of room.
    #[error("region exhausted: {requested:#x} bytes requested, {available:#x} left")]
    Exhausted {
        /// Bytes the gateway asked for.
        requested: usize,
        /// Bytes still left in the region.
        available: usize,
    },
    /// The operating system refused to move the program break.
    #[error("sbrk refused to grow the data segment by {requested:#x} bytes (errno {errno})")]
    Refused {
        /// Bytes the gateway asked for.
        requested: usize,
        /// `errno` reported by `sbrk`.
        errno: i32,
    },
}

/// A contiguous region that can be extended at its end.
///
/// # Safety
///
/// A successful `grow(n)` must return the start of `n` writable bytes, aligned to [`ALIGN`],
/// that nobody else reads or writes for as long as the source's owner is alive. Bytes already
/// handed out are never handed out again.
pub unsafe trait HeapSource {
    /// Extends the region by exactly `increment` bytes and returns the start of the new bytes.
    fn grow(&mut self, increment: usize) -> Result<NonNull<u8>, GrowError>;
}

/// Carves a fresh block with room for `size` payload bytes out of `source`.
///
/// The block gets an initialised, unlinked header and is not put in any free list.
pub(crate) fn carve<S: HeapSource>(source: &mut S, size: usize) -> Result<BlockRef, GrowError> {
    let total = HEADER_SIZE
        .checked_add(size)
        .ok_or(GrowError::TooLarge { requested: size })?;
    let start = source.grow(total).inspect_err(|err| {
        aerror!("Failed to grow heap by {:#x} bytes: {}", total, err);
    })?;
    let block = BlockRef::from_header_ptr(start);
    // SAFETY: `start` is the beginning of `total` fresh, aligned bytes we now own.
    unsafe { block.init(size) };
    adebug!("Grew heap by {:#x} bytes, new block {:?}", total, block);
    Ok(block)
}

/// A fixed byte range handed out front to back.
///
/// Useful when the process break is off limits, e.g. for tests or when carving a heap out of a
/// static buffer.
pub struct Region {
    base: NonNull<u8>,
    len: usize,
    brk: usize,
}

// SAFETY: a region is a plain range of memory that the region owns exclusively.
unsafe impl Send for Region {}

impl Region {
    /// Creates a region covering `len` bytes starting at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`ALIGN`] and point to `len` writable bytes that stay valid, and
    /// are accessed through nothing but this region's allocations, for the region's whole life
    /// and that of any heap built on it.
    pub const unsafe fn new(base: NonNull<u8>, len: usize) -> Self {
        Self { base, len, brk: 0 }
    }

    /// Creates a region over a leaked or static buffer. Leading bytes are skipped to reach
    /// alignment.
    pub fn from_static(bytes: &'static mut [MaybeUninit<u8>]) -> Self {
        let ptr = bytes.as_mut_ptr().cast::<u8>();
        let skip = ptr.align_offset(ALIGN).min(bytes.len());
        let len = bytes.len() - skip;
        // SAFETY: the slice is never null, `skip` keeps us inside it, and the `'static` borrow
        // gives us exclusive use of the bytes forever.
        unsafe { Self::new(NonNull::new_unchecked(ptr.add(skip)), len) }
    }

    /// Bytes handed out so far.
    pub fn used(&self) -> usize {
        self.brk
    }

    /// Total size of the region.
    pub fn capacity(&self) -> usize {
        self.len
    }
}

// SAFETY: every increment is carved from the unused tail of the range, so no byte is handed
// out twice. Alignment holds as long as increments are multiples of `ALIGN`, which the heap
// always requests.
unsafe impl HeapSource for Region {
    fn grow(&mut self, increment: usize) -> Result<NonNull<u8>, GrowError> {
        debug_assert!(increment % ALIGN == 0, "Unaligned region increment");
        let available = self.len - self.brk;
        if increment > available {
            return Err(GrowError::Exhausted {
                requested: increment,
                available,
            });
        }
        // SAFETY: `brk + increment <= len`, so the result stays inside the range.
        let start = unsafe { self.base.add(self.brk) };
        self.brk += increment;
        Ok(start)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len)
            .field("brk", &self.brk)
            .finish()
    }
}

#[cfg(unix)]
pub use self::sbrk::Sbrk;

#[cfg(unix)]
mod sbrk {
    use core::ptr::NonNull;

    use super::{GrowError, HeapSource};
    use crate::block::ALIGN;

    /// The process data segment, grown with `sbrk(2)`.
    #[derive(Debug)]
    pub struct Sbrk {
        _private: (),
    }

    impl Sbrk {
        /// Creates a handle to the program break.
        ///
        /// # Safety
        ///
        /// At most one `Sbrk` may be in use at a time, and nothing else in the process may
        /// move the break while it grows.
        pub const unsafe fn new() -> Self {
            Self { _private: () }
        }
    }

    fn refused(requested: usize) -> GrowError {
        GrowError::Refused {
            requested,
            errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
        }
    }

    fn failed(brk: *mut libc::c_void) -> bool {
        brk as usize == usize::MAX
    }

    // SAFETY: the bytes between the old and the new break belong to whoever moved it, which is
    // us as long as the contract of `Sbrk::new` holds. The start is padded up to `ALIGN` in
    // case a foreign caller left the break unaligned.
    unsafe impl HeapSource for Sbrk {
        fn grow(&mut self, increment: usize) -> Result<NonNull<u8>, GrowError> {
            // SAFETY: `sbrk(0)` only reports the current break.
            let current = unsafe { libc::sbrk(0) };
            if failed(current) {
                return Err(refused(increment));
            }
            let pad = current.cast::<u8>().align_offset(ALIGN);
            let total = increment
                .checked_add(pad)
                .and_then(|total| libc::intptr_t::try_from(total).ok())
                .ok_or(GrowError::TooLarge {
                    requested: increment,
                })?;

            // SAFETY: moving the break has no effect on memory we do not own.
            let start = unsafe { libc::sbrk(total) };
            if failed(start) {
                return Err(refused(increment));
            }
            NonNull::new(start.cast::<u8>().wrapping_add(pad)).ok_or_else(|| refused(increment))
        }
    }

}
