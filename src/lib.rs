pub mod allocator;
pub mod builtins;
pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod event_loop;
pub mod inspector;
pub mod isolate;
pub mod platform;
pub mod process;
pub mod thread_id;

// Core API
pub use allocator::ArrayBufferAllocator;
pub use config::{EnvironmentFlags, HeapLimits, ProcessOptions};
pub use context::{
    BootstrapContext, ContextFlags, get_per_context_exports, initialize_context,
    initialize_context_for_snapshot, initialize_context_runtime, new_context,
};
pub use environment::{
    CleanupHookId, Environment, EnvironmentBuilder, EnvironmentState, LinkedBindings,
    StartExecutionInfo, SubWorkerHandle, add_linked_binding, create_environment, free_environment,
    get_current_event_loop, get_inspector_parent_handle, load_environment,
    load_environment_from_unit, load_environment_with_source, spin_event_loop,
};
pub use error::{EnvironmentError, JsException, LifecycleState, Result};
pub use event_loop::{EventLoop, SpinOutcome, ThreadStopper};
pub use inspector::InspectorParentHandle;
pub use isolate::{Isolate, IsolateData, IsolateSettings, new_isolate};
pub use platform::Platform;
pub use process::ProcessContext;
pub use thread_id::ThreadId;
