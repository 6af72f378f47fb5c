use core::{
    alloc::{GlobalAlloc, Layout},
    ptr,
};

use crate::{
    block::ALIGN,
    gateway::HeapSource,
    heap::Heap,
};

// SAFETY: payloads never overlap and stay valid until released. They are only ever aligned to
// the header, so stricter layouts are refused with null.
unsafe impl<S> GlobalAlloc for Heap<S>
where
    S: HeapSource + Send,
{
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGN {
            aerror!(
                "Refusing layout with alignment {} (max {})",
                layout.align(),
                ALIGN
            );
            return ptr::null_mut();
        }
        // We were re-entered from inside the heap, most likely by the logger. No logging on
        // this path: the logger would land right back in here.
        if self.held_by_current_thread() {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _: Layout) {
        // Leaked when re-entered, for the same reason `alloc` fails.
        if self.held_by_current_thread() {
            return;
        }
        // SAFETY: `GlobalAlloc` callers only pass pointers this heap handed out.
        unsafe { self.release(ptr) }
    }
}
