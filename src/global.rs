//! Process-wide entry points backed by the program break.
//!
//! [`malloc_lock`]/[`free_lock`] share one free list behind the global lock.
//! [`malloc_nolock`]/[`free_nolock`] use a free list private to the calling thread and only
//! take the global lock while moving the break. Pointers must be released through the pair
//! that allocated them.
//!
//! `sbrk` is not thread safe. Anything else in the process that moves the break (the system
//! allocator included) must not do so while one of these calls is growing the heap.

use core::{cell::RefCell, ptr};

use crate::{
    free_list::FreeList,
    gateway::Sbrk,
    heap::{Heap, allocate_in, release_in},
};

// SAFETY: this is the only `Sbrk` the crate creates, and every growth goes through `HEAP`.
static HEAP: Heap<Sbrk> = Heap::new(unsafe { Sbrk::new() });

thread_local! {
    static LOCAL: RefCell<FreeList> = const { RefCell::new(FreeList::new()) };
}

/// The heap shared by the locking entry points.
pub fn heap() -> &'static Heap<Sbrk> {
    &HEAP
}

/// Allocates `size` bytes from the shared free list, holding the global lock throughout.
///
/// Returns null if the break cannot be moved.
#[must_use = "Returned pointer must be released with free_lock"]
pub fn malloc_lock(size: usize) -> *mut u8 {
    HEAP.allocate(size)
}

/// Releases a pointer from [`malloc_lock`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by [`malloc_lock`].
pub unsafe fn free_lock(ptr: *mut u8) {
    // SAFETY: forwarded from the caller.
    unsafe { HEAP.release(ptr) }
}

/// Allocates `size` bytes from the calling thread's free list. The global lock is only taken
/// if the heap has to grow.
///
/// Returns null if the break cannot be moved, or if the thread's storage is already gone.
#[must_use = "Returned pointer must be released with free_nolock on the same thread"]
pub fn malloc_nolock(size: usize) -> *mut u8 {
    let result = LOCAL.try_with(|local| {
        allocate_in(&mut local.borrow_mut(), size, |size| HEAP.grow(size))
    });
    match result {
        Ok(Ok(ptr)) => ptr.as_ptr(),
        Ok(Err(_)) => ptr::null_mut(),
        Err(_) => {
            awarn!("Thread-local heap used during thread teardown");
            ptr::null_mut()
        }
    }
}

/// Releases a pointer from [`malloc_nolock`] into the calling thread's free list. Null is
/// ignored.
///
/// # Safety
///
/// `ptr` must be null or a live pointer returned by [`malloc_nolock`] on the calling thread.
pub unsafe fn free_nolock(ptr: *mut u8) {
    let released = LOCAL.try_with(|local| {
        // SAFETY: forwarded from the caller.
        unsafe { release_in(&mut local.borrow_mut(), ptr) };
    });
    if released.is_err() {
        // The block stays reserved forever, same as anything left in a dead thread's list.
        awarn!("Leaking {:p} released during thread teardown", ptr);
    }
}

/// Runs `f` against the calling thread's free list.
///
/// Returns `None` if the thread's storage is already gone.
///
/// # Panics
///
/// If `f` calls [`malloc_nolock`] or [`free_nolock`], which need the list mutably.
pub fn with_local_free_list<R>(f: impl FnOnce(&FreeList) -> R) -> Option<R> {
    LOCAL.try_with(|local| f(&local.borrow())).ok()
}

/// C entry points, exported unmangled.
#[cfg(feature = "c-abi")]
pub mod c_abi {
    use libc::c_void;

    /// C entry point for [`malloc_lock`](super::malloc_lock).
    #[unsafe(no_mangle)]
    pub extern "C" fn ts_malloc_lock(size: usize) -> *mut c_void {
        super::malloc_lock(size).cast()
    }

    /// C entry point for [`free_lock`](super::free_lock).
    ///
    /// # Safety
    ///
    /// See [`free_lock`](super::free_lock).
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn ts_free_lock(ptr: *mut c_void) {
        // SAFETY: forwarded from the caller.
        unsafe { super::free_lock(ptr.cast()) }
    }

    /// C entry point for [`malloc_nolock`](super::malloc_nolock).
    #[unsafe(no_mangle)]
    pub extern "C" fn ts_malloc_nolock(size: usize) -> *mut c_void {
        super::malloc_nolock(size).cast()
    }

    /// C entry point for [`free_nolock`](super::free_nolock).
    ///
    /// # Safety
    ///
    /// See [`free_nolock`](super::free_nolock).
    #[unsafe(no_mangle)]
    pub unsafe extern "C" fn ts_free_nolock(ptr: *mut c_void) {
        // SAFETY: forwarded from the caller.
        unsafe { super::free_nolock(ptr.cast()) }
    }
}
