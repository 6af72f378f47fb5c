//! bfalloc - a best-fit allocator on top of a monotonically growing heap.
//!
//! Every allocation carries a small [`BlockHeader`] in front of its payload. Released blocks go
//! onto an address-ordered free list where they are merged with their physical neighbours, and
//! allocations pick the tightest free block that fits, splitting off whatever is left. When
//! nothing fits, the heap grows through its [`HeapSource`] (usually `sbrk`).
//!
//! There are two front ends:
//! - [`Heap`] keeps one free list behind a lock that every operation takes.
//! - [`LocalHeap`] keeps a free list private to one thread and only takes the lock to grow.
//!
//! On unix the [`global`] module wires both of them to the program break.
#![warn(missing_debug_implementations)]
#![forbid(unsafe_op_in_unsafe_fn)]

use core::sync::atomic::{AtomicBool, Ordering};

#[macro_use]
#[allow(unused_macros)]
pub(crate) mod alog;

mod alloc_wrap;
pub mod block;
pub mod free_list;
pub mod gateway;
#[cfg(unix)]
pub mod global;
pub mod heap;

pub use block::{ALIGN, BlockHeader, BlockRef, HEADER_SIZE};
pub use free_list::FreeList;
#[cfg(unix)]
pub use gateway::Sbrk;
pub use gateway::{GrowError, HeapSource, Region};
pub use heap::{Heap, LocalHeap};

pub(crate) static ALLOC_LOG: AtomicBool = AtomicBool::new(false);

/// Enables logging for the allocator.
pub fn enable_logging() {
    ALLOC_LOG.store(true, Ordering::Relaxed);
}

/// Disables logging for the allocator
pub fn disable_logging() {
    ALLOC_LOG.store(false, Ordering::Relaxed);
}

pub(crate) fn should_log() -> bool {
    ALLOC_LOG.load(Ordering::Relaxed)
}
