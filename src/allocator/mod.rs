//! ArrayBuffer allocator handed to V8, with an optional tracking mode.
//!
//! V8 calls into this allocator for the backing stores of `ArrayBuffer`,
//! `Uint8Array` and friends. The plain allocator delegates to the global heap;
//! the tracking variant additionally records every live pointer so that
//! double frees, mismatched-size frees and leaks are caught at the boundary.
//!
//! ## How it works
//!
//! 1. `allocate()` zero-fills when the process-wide `zero_fill_all_buffers`
//!    option OR the per-instance zero-fill toggle is set
//! 2. In tracking mode the returned pointer is recorded with its size
//! 3. `free()` checks the record (size must match unless 0), removes it, frees
//! 4. Dropping a tracking allocator with live records is fatal

mod tracking;

pub use tracking::AllocationTracker;

use std::alloc::Layout;
use std::ffi::c_void;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use v8::{RustAllocatorVtable, UniqueRef};

use crate::config::ProcessOptions;

/// Alignment of every backing store, matching what `malloc` guarantees.
const BACKING_STORE_ALIGN: usize = 16;

/// Allocator for engine-visible buffers.
///
/// # Example
///
/// ```rust,ignore
/// let allocator = ArrayBufferAllocator::create(true, &ProcessOptions::default());
///
/// let params = v8::CreateParams::default()
///     .array_buffer_allocator(allocator.clone().into_v8_allocator());
/// let isolate = v8::Isolate::new(params);
///
/// drop(isolate);
/// assert_eq!(allocator.outstanding_allocations(), Some(0));
/// ```
#[derive(Debug)]
pub struct ArrayBufferAllocator {
    /// Snapshot of the process-wide option at creation time
    zero_fill_all_buffers: bool,
    /// Per-instance toggle, on by default
    zero_fill: AtomicBool,
    /// Present only in tracking mode
    tracker: Option<AllocationTracker>,
}

impl ArrayBufferAllocator {
    /// Pick the plain or tracking allocator.
    ///
    /// Tracking is used when `debug` is set or when the process options
    /// request it (`debug_arraybuffer_allocations`).
    pub fn create(debug: bool, options: &ProcessOptions) -> Arc<Self> {
        let tracker = (debug || options.debug_arraybuffer_allocations).then(AllocationTracker::new);

        if tracker.is_some() {
            tracing::debug!("Using tracking ArrayBuffer allocator");
        }

        Arc::new(Self {
            zero_fill_all_buffers: options.zero_fill_all_buffers,
            zero_fill: AtomicBool::new(true),
            tracker,
        })
    }

    pub fn is_tracking(&self) -> bool {
        self.tracker.is_some()
    }

    /// Toggle zero-filling for this instance.
    ///
    /// Has no effect while the process-wide option is on.
    pub fn set_zero_fill(&self, enabled: bool) {
        self.zero_fill.store(enabled, Ordering::Relaxed);
    }

    fn should_zero_fill(&self) -> bool {
        self.zero_fill_all_buffers || self.zero_fill.load(Ordering::Relaxed)
    }

    pub fn allocate(&self, size: usize) -> *mut u8 {
        let ptr = heap_alloc(size, self.should_zero_fill());

        if let Some(tracker) = &self.tracker {
            tracker.register(ptr, size);
        }

        ptr
    }

    pub fn allocate_uninitialized(&self, size: usize) -> *mut u8 {
        let ptr = heap_alloc(size, self.zero_fill_all_buffers);

        if let Some(tracker) = &self.tracker {
            tracker.register(ptr, size);
        }

        ptr
    }

    /// Release a buffer.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this allocator and not have been freed. Unless
    /// tracking is on, `size` must be the size it was allocated with.
    pub unsafe fn free(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }

        let size = match &self.tracker {
            Some(tracker) => tracker.unregister(ptr, size),
            None => size,
        };

        unsafe { heap_free(ptr, size) };
    }

    /// Resize a buffer, preserving its contents and zeroing any growth.
    ///
    /// Returns null (and releases `ptr`) when `size` is 0.
    ///
    /// # Safety
    ///
    /// Same contract as [`free`](Self::free) for `ptr` and `old_size`.
    pub unsafe fn reallocate(&self, ptr: *mut u8, old_size: usize, size: usize) -> *mut u8 {
        match &self.tracker {
            // SAFETY: the tracker hands back the size `ptr` was recorded with
            Some(tracker) => tracker.reallocate(ptr, old_size, size, |ptr, old_size| unsafe {
                heap_realloc(ptr, old_size, size)
            }),
            None => unsafe { heap_realloc(ptr, old_size, size) },
        }
    }

    /// Track a buffer that was allocated elsewhere.
    pub fn register_pointer(&self, ptr: *mut u8, size: usize) {
        if let Some(tracker) = &self.tracker {
            tracker.register(ptr, size);
        }
    }

    /// Stop tracking a buffer registered with [`register_pointer`](Self::register_pointer).
    pub fn unregister_pointer(&self, ptr: *mut u8, size: usize) {
        if let Some(tracker) = &self.tracker {
            tracker.unregister(ptr, size);
        }
    }

    /// `None` unless tracking is on.
    pub fn outstanding_allocations(&self) -> Option<usize> {
        self.tracker.as_ref().map(AllocationTracker::outstanding_allocations)
    }

    pub fn recorded_size(&self, ptr: *const u8) -> Option<usize> {
        self.tracker.as_ref().and_then(|t| t.recorded_size(ptr))
    }

    /// Convert to a V8 allocator for use in `CreateParams`.
    ///
    /// V8 keeps one reference until the isolate and every backing store are gone.
    pub fn into_v8_allocator(self: Arc<Self>) -> UniqueRef<v8::Allocator> {
        let vtable: &'static RustAllocatorVtable<ArrayBufferAllocator> = &RustAllocatorVtable {
            allocate: v8_allocate,
            allocate_uninitialized: v8_allocate_uninitialized,
            free: v8_free,
            drop: v8_drop,
        };

        unsafe { v8::new_rust_allocator(Arc::into_raw(self), vtable) }
    }
}

fn layout_for(size: usize) -> Option<Layout> {
    // Zero-length buffers still get a unique, freeable pointer
    Layout::from_size_align(size.max(1), BACKING_STORE_ALIGN).ok()
}

fn heap_alloc(size: usize, zeroed: bool) -> *mut u8 {
    let Some(layout) = layout_for(size) else {
        return std::ptr::null_mut();
    };

    // SAFETY: layout has a non-zero size
    unsafe {
        if zeroed {
            std::alloc::alloc_zeroed(layout)
        } else {
            std::alloc::alloc(layout)
        }
    }
}

unsafe fn heap_free(ptr: *mut u8, size: usize) {
    if let Some(layout) = layout_for(size) {
        // SAFETY: ptr was allocated by heap_alloc with the same size
        unsafe { std::alloc::dealloc(ptr, layout) };
    }
}

unsafe fn heap_realloc(ptr: *mut u8, old_size: usize, size: usize) -> *mut u8 {
    if ptr.is_null() {
        return heap_alloc(size, true);
    }

    if size == 0 {
        unsafe { heap_free(ptr, old_size) };
        return std::ptr::null_mut();
    }

    let Some(layout) = layout_for(old_size) else {
        return std::ptr::null_mut();
    };

    // `realloc` requires the new size to form a valid layout; `ptr` stays live
    if Layout::from_size_align(size, BACKING_STORE_ALIGN).is_err() {
        return std::ptr::null_mut();
    }

    // SAFETY: ptr was allocated with `layout` and size is non-zero
    let new = unsafe { std::alloc::realloc(ptr, layout, size) };

    if !new.is_null() && size > old_size {
        // SAFETY: the grown region lies inside the new allocation
        unsafe { std::ptr::write_bytes(new.add(old_size), 0, size - old_size) };
    }

    new
}

/// Called by V8 for `new ArrayBuffer(n)`; memory is zeroed.
unsafe extern "C" fn v8_allocate(allocator: &ArrayBufferAllocator, n: usize) -> *mut c_void {
    allocator.allocate(n) as *mut c_void
}

unsafe extern "C" fn v8_allocate_uninitialized(allocator: &ArrayBufferAllocator, n: usize) -> *mut c_void {
    allocator.allocate_uninitialized(n) as *mut c_void
}

/// Called by V8 when a backing store is released.
unsafe extern "C" fn v8_free(allocator: &ArrayBufferAllocator, data: *mut c_void, n: usize) {
    // SAFETY: V8 only frees pointers it got from this allocator
    unsafe { allocator.free(data as *mut u8, n) };
}

/// Called when V8 releases its reference (isolate destroyed).
unsafe extern "C" fn v8_drop(allocator: *const ArrayBufferAllocator) {
    // SAFETY: allocator was created via Arc::into_raw in into_v8_allocator
    let _ = unsafe { Arc::from_raw(allocator) };
}
