//! Heap sizing and out-of-memory reporting.
//!
//! Default heap limits are derived from the memory actually available to the
//! process: the lesser of the machine's total memory and any cgroup limit.
//! How that figure maps to V8 limits is a [`HeapSizingPolicy`]; when nothing
//! can be detected V8 keeps its built-in defaults.

use std::cell::RefCell;
use std::ffi::c_char;
use std::sync::Arc;

use crate::config::HeapLimits;

use super::policy::ErrorPolicy;

const MB: u64 = 1024 * 1024;

/// cgroup v1 reports "unlimited" as a page-aligned i64::MAX.
const CGROUP_UNLIMITED_THRESHOLD: u64 = 1 << 62;

pub trait HeapSizingPolicy: Send + Sync {
    /// Limits for an isolate given the effective memory in bytes.
    fn heap_limits(&self, effective_memory: u64) -> Option<HeapLimits>;
}

/// Old generation sized at a quarter of effective memory, clamped to
/// `[min_max_heap, max_max_heap]`.
#[derive(Debug, Clone)]
pub struct DefaultHeapSizing {
    pub min_max_heap: u64,
    pub max_max_heap: u64,
}

impl Default for DefaultHeapSizing {
    fn default() -> Self {
        Self {
            min_max_heap: 256 * MB,
            max_max_heap: 4096 * MB,
        }
    }
}

impl HeapSizingPolicy for DefaultHeapSizing {
    fn heap_limits(&self, effective_memory: u64) -> Option<HeapLimits> {
        if effective_memory == 0 {
            return None;
        }

        let max = (effective_memory / 4).clamp(self.min_max_heap, self.max_max_heap);

        Some(HeapLimits {
            initial_bytes: 0,
            max_bytes: usize::try_from(max).ok()?,
        })
    }
}

/// Total memory capped by any container constraint, in bytes.
pub fn detect_effective_memory() -> Option<u64> {
    let total = read_to_string("/proc/meminfo").and_then(|s| parse_meminfo_total(&s));
    let constrained = cgroup_memory_limit();

    match (total, constrained) {
        (Some(total), Some(constrained)) => Some(total.min(constrained)),
        (total, constrained) => total.or(constrained),
    }
}

fn read_to_string(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

fn cgroup_memory_limit() -> Option<u64> {
    // cgroup v2 first, then v1
    read_to_string("/sys/fs/cgroup/memory.max")
        .or_else(|| read_to_string("/sys/fs/cgroup/memory/memory.limit_in_bytes"))
        .and_then(|s| parse_cgroup_limit(&s))
}

pub(crate) fn parse_meminfo_total(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let mut parts = line.split_whitespace().skip(1);
    let value: u64 = parts.next()?.parse().ok()?;

    match parts.next() {
        Some("kB") | None => value.checked_mul(1024),
        Some(_) => None,
    }
}

pub(crate) fn parse_cgroup_limit(contents: &str) -> Option<u64> {
    let value = contents.trim();

    if value == "max" {
        return None;
    }

    value
        .parse::<u64>()
        .ok()
        .filter(|&v| v > 0 && v < CGROUP_UNLIMITED_THRESHOLD)
}

/// Limits for a new isolate: explicit limits win, then the sizing policy.
pub(crate) fn resolve_heap_limits(
    explicit: Option<HeapLimits>,
    policy: &dyn HeapSizingPolicy,
) -> Option<HeapLimits> {
    if explicit.is_some() {
        return explicit;
    }

    let memory = detect_effective_memory()?;
    let limits = policy.heap_limits(memory);

    if let Some(limits) = &limits {
        tracing::debug!(
            "Heap sized from {} MB effective memory: max {} MB",
            memory / MB,
            limits.max_bytes as u64 / MB
        );
    }

    limits
}

thread_local! {
    // V8's OOM handler carries no user data; the policy of the isolate
    // created on this thread is used.
    static FATAL_ERROR_POLICY: RefCell<Option<Arc<dyn ErrorPolicy>>> = const { RefCell::new(None) };
}

pub(crate) fn set_thread_fatal_error_policy(policy: Arc<dyn ErrorPolicy>) {
    FATAL_ERROR_POLICY.with(|slot| *slot.borrow_mut() = Some(policy));
}

/// OOM handler for V8 isolates.
///
/// By the time this is called V8 is unrecoverable; the handler only reports.
pub(crate) unsafe extern "C" fn oom_error_handler(location: *const c_char, details: &v8::OomDetails) {
    let location_str = if location.is_null() {
        "unknown".to_string()
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { std::ffi::CStr::from_ptr(location) }
            .to_string_lossy()
            .into_owned()
    };

    let detail_str = if details.detail.is_null() {
        String::new()
    } else {
        // SAFETY: V8 passes a valid C string
        unsafe { std::ffi::CStr::from_ptr(details.detail as *const c_char) }
            .to_string_lossy()
            .into_owned()
    };

    let oom_type = if details.is_heap_oom {
        "JavaScript heap"
    } else {
        "process/external memory"
    };

    let message = if detail_str.is_empty() {
        format!("{oom_type} out of memory")
    } else {
        format!("{oom_type} out of memory: {detail_str}")
    };

    let policy = FATAL_ERROR_POLICY.with(|slot| slot.borrow().clone());

    match policy {
        Some(policy) => policy.on_fatal_error(&location_str, &message),
        None => tracing::error!("V8 OOM at {location_str}: {message}"),
    }
}
