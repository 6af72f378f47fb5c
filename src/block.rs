//! Block headers and block handles.

use core::{fmt, mem, num::NonZeroUsize, ptr::NonNull};

/// The header placed in front of every payload handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)] // Prevent field reordering
pub struct BlockHeader {
    /// Usable payload bytes following the header.
    pub data_size: usize,
    /// Previous block in the free list. Only meaningful while the block is free.
    pub prev: Option<BlockRef>,
    /// Next block in the free list. Only meaningful while the block is free.
    pub next: Option<BlockRef>,
}

/// Size of a block header in bytes.
pub const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();
/// Alignment of every header, and the granularity that payload sizes are rounded up to.
pub const ALIGN: usize = mem::align_of::<BlockHeader>();

impl BlockHeader {
    /// Creates an unlinked header for a payload of `data_size` bytes.
    pub const fn new(data_size: usize) -> Self {
        Self {
            data_size,
            prev: None,
            next: None,
        }
    }
}

/// The address of a block header.
///
/// Blocks are identified by address alone. The handle carries no lifetime and does not
/// guarantee the memory behind it is a header; that is up to whoever created it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlockRef(NonZeroUsize);

impl BlockRef {
    /// Wraps a header address. Returns `None` for address zero.
    pub const fn new(addr: usize) -> Option<Self> {
        match NonZeroUsize::new(addr) {
            Some(addr) => Some(Self(addr)),
            None => None,
        }
    }

    /// Returns the handle for the header placed at `ptr`.
    pub fn from_header_ptr(ptr: NonNull<u8>) -> Self {
        let addr = ptr.as_ptr().expose_provenance();
        // SAFETY: `ptr` is non-null.
        Self(unsafe { NonZeroUsize::new_unchecked(addr) })
    }

    /// Returns the handle of the block whose payload starts at `payload`.
    ///
    /// The result is only a real block if `payload` was handed out by this allocator.
    pub fn from_payload(payload: NonNull<u8>) -> Option<Self> {
        let addr = payload.as_ptr().expose_provenance();
        Self::new(addr.checked_sub(HEADER_SIZE)?)
    }

    /// The header address.
    pub const fn addr(self) -> usize {
        self.0.get()
    }

    /// Pointer to the first payload byte.
    pub fn payload(self) -> NonNull<u8> {
        let ptr = self.as_ptr().cast::<u8>().wrapping_add(HEADER_SIZE);
        // SAFETY: `addr + HEADER_SIZE` is non-zero because `addr` is, and blocks never wrap.
        unsafe { NonNull::new_unchecked(ptr) }
    }

    /// Address of the header `offset` bytes past this one.
    pub(crate) const fn offset(self, offset: usize) -> Option<Self> {
        Self::new(self.addr() + offset)
    }

    pub(crate) fn as_ptr(self) -> *mut BlockHeader {
        core::ptr::with_exposed_provenance_mut(self.addr())
    }

    /// Writes a fresh unlinked header of `data_size` bytes at this address.
    ///
    /// # Safety
    ///
    /// `self` must point to at least `HEADER_SIZE` writable bytes, aligned to [`ALIGN`], that
    /// are owned by the caller.
    pub(crate) unsafe fn init(self, data_size: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { self.as_ptr().write(BlockHeader::new(data_size)) };
    }

    /// Reads the header.
    ///
    /// # Safety
    ///
    /// `self` must point to an initialised header.
    pub unsafe fn read(self) -> BlockHeader {
        // SAFETY: guaranteed by the caller.
        unsafe { self.as_ptr().read() }
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header.
    pub(crate) unsafe fn data_size(self) -> usize {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).data_size }
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header that is not borrowed elsewhere.
    pub(crate) unsafe fn set_data_size(self, data_size: usize) {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).data_size = data_size };
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header.
    pub(crate) unsafe fn prev(self) -> Option<BlockRef> {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).prev }
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header that is not borrowed elsewhere.
    pub(crate) unsafe fn set_prev(self, prev: Option<BlockRef>) {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).prev = prev };
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header.
    pub(crate) unsafe fn next(self) -> Option<BlockRef> {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).next }
    }

    /// # Safety
    ///
    /// `self` must point to an initialised header that is not borrowed elsewhere.
    pub(crate) unsafe fn set_next(self, next: Option<BlockRef>) {
        // SAFETY: guaranteed by the caller.
        unsafe { (*self.as_ptr()).next = next };
    }

    /// Clears both free-list links.
    ///
    /// # Safety
    ///
    /// `self` must point to an initialised header that is not borrowed elsewhere.
    pub(crate) unsafe fn unlink(self) {
        // SAFETY: guaranteed by the caller.
        unsafe {
            self.set_prev(None);
            self.set_next(None);
        }
    }
}

impl fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockRef({:#x})", self.addr())
    }
}

/// Address one past the end of a block at `addr` carrying `data_size` payload bytes.
#[inline]
pub const fn block_end(addr: usize, data_size: usize) -> usize {
    addr + HEADER_SIZE + data_size
}

/// Whether a block at `second` starts exactly where the block at `first` ends.
#[inline]
pub const fn is_adjacent(first: usize, first_size: usize, second: usize) -> bool {
    block_end(first, first_size) == second
}

/// Rounds a requested payload size up to the allocator's granularity.
///
/// Zero is treated as one byte. Returns `None` if rounding overflows.
#[inline]
pub const fn round_request(size: usize) -> Option<usize> {
    let size = if size == 0 { 1 } else { size };
    size.checked_next_multiple_of(ALIGN)
}
