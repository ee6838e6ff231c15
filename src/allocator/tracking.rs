//! Allocation records for the debug allocator.
//!
//! Every live pointer handed out by the tracking allocator has exactly one
//! record mapping it to the size it was requested with. The map is guarded by
//! a single mutex that is only held while the map is touched.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::fatal;

#[derive(Debug, Default)]
pub struct AllocationTracker {
    records: Mutex<HashMap<usize, usize>>,
}

impl AllocationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<usize, usize>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a freshly allocated pointer. Null pointers are ignored.
    pub fn register(&self, ptr: *mut u8, size: usize) {
        if ptr.is_null() {
            return;
        }

        let previous = self.records().insert(ptr as usize, size);

        if let Some(previous) = previous {
            fatal!("Allocation {ptr:p} ({size} bytes) is already tracked with {previous} bytes");
        }
    }

    /// Remove the record for `ptr`, returning the recorded size.
    ///
    /// A non-zero `size` must match the recorded size.
    pub fn unregister(&self, ptr: *mut u8, size: usize) -> usize {
        if ptr.is_null() {
            return 0;
        }

        let mut records = self.records();

        let Some(recorded) = records.get(&(ptr as usize)).copied() else {
            drop(records);
            fatal!("Free of untracked pointer {ptr:p} ({size} bytes)");
        };

        if size > 0 && size != recorded {
            drop(records);
            fatal!("Size mismatch freeing {ptr:p}: allocated {recorded} bytes, freed {size}");
        }

        records.remove(&(ptr as usize));
        recorded
    }

    /// Resize `ptr` through `realloc` while holding the lock.
    ///
    /// `realloc` receives the recorded size of `ptr` (or `old_size` for a null
    /// `ptr`). A null result with a non-zero `size` is a failed resize and
    /// leaves the record of `ptr` in place.
    pub fn reallocate<F>(&self, ptr: *mut u8, old_size: usize, size: usize, realloc: F) -> *mut u8
    where
        F: FnOnce(*mut u8, usize) -> *mut u8,
    {
        let mut records = self.records();

        let recorded = if ptr.is_null() {
            old_size
        } else {
            match records.get(&(ptr as usize)).copied() {
                Some(recorded) => recorded,
                None => {
                    drop(records);
                    fatal!("Reallocation of untracked pointer {ptr:p}");
                }
            }
        };

        let new = realloc(ptr, recorded);

        if new.is_null() {
            if size == 0 && !ptr.is_null() {
                records.remove(&(ptr as usize));
            }
            return new;
        }

        if !ptr.is_null() {
            records.remove(&(ptr as usize));
        }

        if let Some(previous) = records.insert(new as usize, size) {
            drop(records);
            fatal!("Reallocation returned {new:p} which is already tracked with {previous} bytes");
        }

        new
    }

    /// The recorded size of `ptr`, if it is live.
    pub fn recorded_size(&self, ptr: *const u8) -> Option<usize> {
        self.records().get(&(ptr as usize)).copied()
    }

    pub fn outstanding_allocations(&self) -> usize {
        self.records().len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.records().values().sum()
    }
}

impl Drop for AllocationTracker {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        let records = self.records.get_mut().unwrap_or_else(PoisonError::into_inner);

        if !records.is_empty() {
            let bytes: usize = records.values().sum();
            fatal!(
                "ArrayBuffer allocator destroyed with {} live allocations ({} bytes)",
                records.len(),
                bytes
            );
        }
    }
}
