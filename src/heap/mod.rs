//! The allocator front ends.
//!
//! A [`Heap`] owns a backing [`HeapSource`] and a shared free list behind one lock. A
//! [`LocalHeap`] keeps a private free list and only touches the shared heap, and therefore the
//! lock, when it needs fresh memory.

use core::{
    cell::Cell,
    fmt,
    ops::{Deref, DerefMut},
    ptr::{self, NonNull},
};

use spin::{Mutex, MutexGuard};

use crate::{
    block::{BlockRef, round_request},
    free_list::FreeList,
    gateway::{GrowError, HeapSource, carve},
};

#[cfg(test)]
mod alloc_tests;

struct Shared<S> {
    free: FreeList,
    source: S,
}

impl<S: HeapSource> Shared<S> {
    fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let Self { free, source } = self;
        // The lock is already held, so grow in place rather than through `Heap::grow`.
        allocate_in(free, size, |size| carve(source, size))
    }
}

thread_local! {
    /// Address of the heap whose lock the current thread holds, or 0.
    static HELD: Cell<usize> = const { Cell::new(0) };
}

/// A locked heap that the current thread is known to hold.
struct Held<'h, S> {
    shared: MutexGuard<'h, Shared<S>>,
    prev: usize,
}

impl<S> Deref for Held<'_, S> {
    type Target = Shared<S>;

    fn deref(&self) -> &Self::Target {
        &self.shared
    }
}

impl<S> DerefMut for Held<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.shared
    }
}

impl<S> Drop for Held<'_, S> {
    fn drop(&mut self) {
        HELD.set(self.prev);
    }
}

/// A best-fit heap shared between threads.
///
/// Every operation holds the heap's lock from start to finish, including any growth of the
/// backing source.
pub struct Heap<S> {
    shared: Mutex<Shared<S>>,
}

impl<S> Heap<S> {
    /// Creates an empty heap that takes all of its memory from `source`.
    pub const fn new(source: S) -> Self {
        Self {
            shared: Mutex::new(Shared {
                free: FreeList::new(),
                source,
            }),
        }
    }

    fn lock(&self) -> Held<'_, S> {
        let shared = self.shared.lock();
        Held {
            shared,
            prev: HELD.replace(ptr::from_ref(self).addr()),
        }
    }

    /// Does the current thread hold this heap's lock?
    pub(crate) fn held_by_current_thread(&self) -> bool {
        HELD.get() == ptr::from_ref(self).addr()
    }

    /// Runs `f` against the shared free list while holding the lock.
    ///
    /// The lock is not reentrant. Allocating from or releasing into this heap inside `f`
    /// deadlocks, except through its `GlobalAlloc` impl, which fails instead.
    pub fn inspect<R>(&self, f: impl FnOnce(&FreeList) -> R) -> R {
        f(&self.lock().free)
    }

    /// Returns a thread-local front end that grows through this heap.
    pub fn local(&self) -> LocalHeap<'_, S> {
        LocalHeap::new(self)
    }
}

impl<S: HeapSource> Heap<S> {
    /// Allocates `size` bytes. Returns null if the backing source cannot grow.
    #[must_use = "Returned pointer must be released with Heap::release"]
    pub fn allocate(&self, size: usize) -> *mut u8 {
        self.try_allocate(size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocates `size` bytes, reporting why the backing source could not grow.
    pub fn try_allocate(&self, size: usize) -> Result<NonNull<u8>, GrowError> {
        self.lock().allocate(size)
    }

    /// Returns `ptr` to the shared free list. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer handed out by this heap, through
    /// [`Heap::allocate`], [`Heap::try_allocate`] or its `GlobalAlloc` impl. It must not be used
    /// afterwards.
    pub unsafe fn release(&self, ptr: *mut u8) {
        let mut shared = self.lock();
        // SAFETY: forwarded from the caller.
        unsafe { release_in(&mut shared.free, ptr) };
    }

    /// Carves a fresh block of `size` payload bytes from the backing source.
    ///
    /// This is the only place where [`LocalHeap`]s take the lock. The block does not go
    /// through the shared free list.
    pub(crate) fn grow(&self, size: usize) -> Result<BlockRef, GrowError> {
        carve(&mut self.lock().source, size)
    }
}

impl<S> fmt::Debug for Heap<S>
where
    S: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.shared.try_lock() {
            Some(shared) => f
                .debug_struct("Heap")
                .field("source", &shared.source)
                .field("free_blocks", &shared.free.len())
                .field("free_bytes", &shared.free.free_bytes())
                .finish(),
            None => write!(f, "Heap {{ <locked> }}"),
        }
    }
}

/// A heap front end owned by a single thread.
///
/// Allocation and release only touch the private free list. Fresh memory still comes from the
/// shared [`Heap`], whose lock is held for the growth alone. Blocks parked in a local heap stay
/// reserved for it until it is dropped, after which they are never reused.
pub struct LocalHeap<'h, S> {
    heap: &'h Heap<S>,
    free: FreeList,
}

impl<'h, S> LocalHeap<'h, S> {
    /// Creates a local front end with an empty free list.
    pub const fn new(heap: &'h Heap<S>) -> Self {
        Self {
            heap,
            free: FreeList::new(),
        }
    }

    /// The private free list.
    pub fn free_list(&self) -> &FreeList {
        &self.free
    }
}

impl<S: HeapSource> LocalHeap<'_, S> {
    /// Allocates `size` bytes. Returns null if the backing source cannot grow.
    #[must_use = "Returned pointer must be released with LocalHeap::release"]
    pub fn allocate(&mut self, size: usize) -> *mut u8 {
        self.try_allocate(size)
            .map_or(ptr::null_mut(), NonNull::as_ptr)
    }

    /// Allocates `size` bytes, reporting why the backing source could not grow.
    pub fn try_allocate(&mut self, size: usize) -> Result<NonNull<u8>, GrowError> {
        let heap = self.heap;
        allocate_in(&mut self.free, size, |size| heap.grow(size))
    }

    /// Returns `ptr` to the private free list. Null is ignored.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer returned by [`LocalHeap::allocate`] or
    /// [`LocalHeap::try_allocate`] on this local heap. It must not be used afterwards.
    pub unsafe fn release(&mut self, ptr: *mut u8) {
        // SAFETY: forwarded from the caller.
        unsafe { release_in(&mut self.free, ptr) };
    }
}

impl<S> fmt::Debug for LocalHeap<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalHeap")
            .field("free_blocks", &self.free.len())
            .field("free_bytes", &self.free.free_bytes())
            .finish()
    }
}

/// Serves an allocation from `free`, falling back to `grow` when nothing fits.
pub(crate) fn allocate_in(
    free: &mut FreeList,
    size: usize,
    grow: impl FnOnce(usize) -> Result<BlockRef, GrowError>,
) -> Result<NonNull<u8>, GrowError> {
    let Some(size) = round_request(size) else {
        aerror!("Rejecting allocation of {:#x} bytes", size);
        return Err(GrowError::TooLarge { requested: size });
    };

    let block = match free.best_fit(size) {
        Some(block) => {
            atrace!("Reusing {:?} for {} bytes", block, size);
            // SAFETY: `best_fit` only returns list members holding at least `size` bytes, and
            // `round_request` keeps `size` a multiple of `ALIGN`.
            unsafe { free.take(block, size) }
        }
        None => grow(size)?,
    };
    Ok(block.payload())
}

/// Returns the block behind `ptr` to `free`. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live payload pointer of a block that is in no free list.
pub(crate) unsafe fn release_in(free: &mut FreeList, ptr: *mut u8) {
    let Some(block) = NonNull::new(ptr).and_then(BlockRef::from_payload) else {
        return;
    };
    atrace!("Releasing {:?}", block);
    // SAFETY: a live payload pointer sits right after the header of a block we handed out.
    unsafe { free.release(block) };
}
