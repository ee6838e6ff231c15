//! Process-wide options and per-environment flags.
//!
//! These are read-only inputs: parsed once (usually from the environment at
//! startup) and then consumed by the allocator, the platform and the
//! environment constructors.

use std::ops::{BitOr, BitOrAssign};

const ENV_PREFIX: &str = "OPENWORKERS_";

/// Options that apply to every isolate and environment in the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Zero-fill every ArrayBuffer allocation, even uninitialized ones.
    pub zero_fill_all_buffers: bool,
    /// Use the tracking allocator regardless of what the embedder asks for.
    pub debug_arraybuffer_allocations: bool,
    /// Abort the process on uncaught exceptions (subject to the error policy).
    pub abort_on_uncaught_exception: bool,
    /// Extra V8 flags applied once, before V8 is initialized.
    pub v8_flags: Vec<String>,
    /// Worker threads for the V8 platform (0 = V8 default).
    pub thread_pool_size: u32,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            zero_fill_all_buffers: false,
            debug_arraybuffer_allocations: false,
            abort_on_uncaught_exception: false,
            v8_flags: Vec::new(),
            thread_pool_size: 0,
        }
    }
}

impl ProcessOptions {
    /// Read options from `OPENWORKERS_*` environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `OPENWORKERS_ZERO_FILL_BUFFERS` | `zero_fill_all_buffers` |
    /// | `OPENWORKERS_DEBUG_ARRAYBUFFER_ALLOCATIONS` | `debug_arraybuffer_allocations` |
    /// | `OPENWORKERS_ABORT_ON_UNCAUGHT_EXCEPTION` | `abort_on_uncaught_exception` |
    /// | `OPENWORKERS_V8_FLAGS` | `v8_flags` (whitespace separated) |
    /// | `OPENWORKERS_THREAD_POOL_SIZE` | `thread_pool_size` |
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut options = Self::default();
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = var("ZERO_FILL_BUFFERS") {
            options.zero_fill_all_buffers = parse_bool("ZERO_FILL_BUFFERS", &v);
        }

        if let Some(v) = var("DEBUG_ARRAYBUFFER_ALLOCATIONS") {
            options.debug_arraybuffer_allocations = parse_bool("DEBUG_ARRAYBUFFER_ALLOCATIONS", &v);
        }

        if let Some(v) = var("ABORT_ON_UNCAUGHT_EXCEPTION") {
            options.abort_on_uncaught_exception = parse_bool("ABORT_ON_UNCAUGHT_EXCEPTION", &v);
        }

        if let Some(v) = var("V8_FLAGS") {
            options.v8_flags = v.split_whitespace().map(str::to_string).collect();
        }

        if let Some(v) = var("THREAD_POOL_SIZE") {
            match v.trim().parse() {
                Ok(n) => options.thread_pool_size = n,
                Err(e) => tracing::warn!("Ignoring {ENV_PREFIX}THREAD_POOL_SIZE={v:?}: {e}"),
            }
        }

        options
    }
}

fn parse_bool(name: &str, value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        "0" | "false" | "no" | "off" | "" => false,
        other => {
            tracing::warn!("Ignoring {ENV_PREFIX}{name}={other:?}: expected a boolean");
            false
        }
    }
}

/// Explicit V8 heap limits in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapLimits {
    pub initial_bytes: usize,
    pub max_bytes: usize,
}

impl HeapLimits {
    pub fn from_mb(initial_mb: usize, max_mb: usize) -> Self {
        Self {
            initial_bytes: initial_mb * 1024 * 1024,
            max_bytes: max_mb * 1024 * 1024,
        }
    }
}

/// Flags controlling how an environment is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EnvironmentFlags(u32);

impl EnvironmentFlags {
    pub const NONE: Self = Self(0);
    /// The environment owns process-wide state (the main thread).
    pub const OWNS_PROCESS_STATE: Self = Self(1 << 0);
    /// The environment owns the inspector (can accept child sessions).
    pub const OWNS_INSPECTOR: Self = Self(1 << 1);
    /// Run the execution-preparation unit during construction.
    pub const PREPARE_FOR_EXECUTION: Self = Self(1 << 2);

    pub const DEFAULT: Self =
        Self(Self::OWNS_PROCESS_STATE.0 | Self::OWNS_INSPECTOR.0 | Self::PREPARE_FOR_EXECUTION.0);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl Default for EnvironmentFlags {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl BitOr for EnvironmentFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for EnvironmentFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}
