//! Process-unique thread identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one thread of script execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(u64);

impl ThreadId {
    /// Never handed out by [`ThreadIdAllocator`].
    pub const INVALID: ThreadId = ThreadId(u64::MAX);

    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            f.write_str("invalid")
        }
    }
}

/// Hands out monotonically increasing ids starting at 0.
///
/// Ids are never reset or reused. Safe to call from any thread.
#[derive(Debug, Default)]
pub struct ThreadIdAllocator {
    next: AtomicU64,
}

impl ThreadIdAllocator {
    pub const fn new() -> Self {
        Self {
            next: AtomicU64::new(0),
        }
    }

    pub fn next(&self) -> ThreadId {
        let id = self.next.fetch_add(1, Ordering::Relaxed);

        if id == ThreadId::INVALID.0 {
            tracing::error!("Thread id space exhausted");
            panic!("thread id space exhausted");
        }

        ThreadId(id)
    }
}
