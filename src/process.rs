//! The process-scoped context passed to every construction call.

use std::sync::Arc;

use crate::allocator::ArrayBufferAllocator;
use crate::builtins::BuiltinRegistry;
use crate::config::ProcessOptions;
use crate::platform::Platform;
use crate::thread_id::{ThreadId, ThreadIdAllocator};

/// State shared by every isolate and environment in the process.
///
/// Create one per process. The thread-id counter is the only mutable state
/// here besides the registries, which have their own locks.
#[derive(Debug)]
pub struct ProcessContext {
    options: ProcessOptions,
    thread_ids: ThreadIdAllocator,
    builtins: BuiltinRegistry,
    platform: Arc<Platform>,
}

impl ProcessContext {
    /// Initialize V8 (once) and build the process context.
    pub fn new(options: ProcessOptions) -> Arc<Self> {
        let platform = Platform::new(&options);

        Arc::new(Self {
            options,
            thread_ids: ThreadIdAllocator::new(),
            builtins: BuiltinRegistry::new(),
            platform,
        })
    }

    pub fn options(&self) -> &ProcessOptions {
        &self.options
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn builtins(&self) -> &BuiltinRegistry {
        &self.builtins
    }

    /// Next process-unique thread id.
    pub fn allocate_thread_id(&self) -> ThreadId {
        self.thread_ids.next()
    }

    /// Plain or tracking allocator, according to `debug` and the options.
    pub fn create_array_buffer_allocator(&self, debug: bool) -> Arc<ArrayBufferAllocator> {
        ArrayBufferAllocator::create(debug, &self.options)
    }
}
