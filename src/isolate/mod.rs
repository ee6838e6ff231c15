//! Engine instance creation and configuration.
//!
//! [`new_isolate`] registers the isolate with the [`Platform`], creates it with
//! the requested heap limits and allocator, then installs the error and misc
//! handlers described by [`IsolateSettings`].

pub(crate) mod callbacks;
pub mod heap;
pub mod policy;

use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::sync::Arc;

use crate::allocator::ArrayBufferAllocator;
use crate::config::HeapLimits;
use crate::error::{EnvironmentError, Result};
use crate::event_loop::EventLoop;
use crate::platform::{IsolateId, IsolateRegistration, Platform};
use crate::process::ProcessContext;

pub use heap::{DefaultHeapSizing, HeapSizingPolicy, detect_effective_memory};
pub use policy::{
    AbortContext, ContextFlagWasmGate, DefaultErrorPolicy, DefaultMicrotaskPolicy, ErrorPolicy,
    MicrotaskMode, MicrotaskPolicy, PromiseRejectPolicy, RejectionEvent, RejectionTracker,
    ReportedMessage, TrackingRejectPolicy, WasmCodegenPolicy, default_should_abort,
};

/// Frames captured for uncaught exceptions.
const STACK_TRACE_FRAME_LIMIT: i32 = 10;

#[derive(Clone)]
pub struct IsolateSettings {
    /// Explicit limits; skips the sizing policy when set.
    pub heap_limits: Option<HeapLimits>,
    pub heap_sizing: Arc<dyn HeapSizingPolicy>,
    /// Install V8's message listener (routed to [`ErrorPolicy::on_message`]).
    pub message_listener: bool,
    pub error_policy: Arc<dyn ErrorPolicy>,
    pub microtask_policy: Arc<dyn MicrotaskPolicy>,
    pub wasm_codegen_policy: Arc<dyn WasmCodegenPolicy>,
    pub promise_reject_policy: Arc<dyn PromiseRejectPolicy>,
}

impl Default for IsolateSettings {
    fn default() -> Self {
        Self {
            heap_limits: None,
            heap_sizing: Arc::new(DefaultHeapSizing::default()),
            message_listener: true,
            error_policy: Arc::new(DefaultErrorPolicy),
            microtask_policy: Arc::new(DefaultMicrotaskPolicy::default()),
            wasm_codegen_policy: Arc::new(ContextFlagWasmGate),
            promise_reject_policy: Arc::new(TrackingRejectPolicy),
        }
    }
}

impl std::fmt::Debug for IsolateSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateSettings")
            .field("heap_limits", &self.heap_limits)
            .field("message_listener", &self.message_listener)
            .field("microtask_mode", &self.microtask_policy.mode())
            .finish_non_exhaustive()
    }
}

impl IsolateSettings {
    pub fn with_heap_limits(mut self, limits: HeapLimits) -> Self {
        self.heap_limits = Some(limits);
        self
    }

    pub fn with_heap_sizing(mut self, policy: impl HeapSizingPolicy + 'static) -> Self {
        self.heap_sizing = Arc::new(policy);
        self
    }

    pub fn with_message_listener(mut self, enabled: bool) -> Self {
        self.message_listener = enabled;
        self
    }

    pub fn with_error_policy(mut self, policy: impl ErrorPolicy + 'static) -> Self {
        self.error_policy = Arc::new(policy);
        self
    }

    pub fn with_microtask_mode(mut self, mode: MicrotaskMode) -> Self {
        self.microtask_policy = Arc::new(DefaultMicrotaskPolicy(mode));
        self
    }

    pub fn with_wasm_codegen_policy(mut self, policy: impl WasmCodegenPolicy + 'static) -> Self {
        self.wasm_codegen_policy = Arc::new(policy);
        self
    }

    pub fn with_promise_reject_policy(mut self, policy: impl PromiseRejectPolicy + 'static) -> Self {
        self.promise_reject_policy = Arc::new(policy);
        self
    }
}

/// The policy set stored in the isolate slot for the callback trampolines.
#[derive(Clone)]
pub(crate) struct IsolatePolicies {
    pub(crate) error: Arc<dyn ErrorPolicy>,
    pub(crate) microtasks: MicrotaskMode,
    pub(crate) wasm: Arc<dyn WasmCodegenPolicy>,
    pub(crate) promise_reject: Arc<dyn PromiseRejectPolicy>,
}

impl From<&IsolateSettings> for IsolatePolicies {
    fn from(settings: &IsolateSettings) -> Self {
        Self {
            error: Arc::clone(&settings.error_policy),
            microtasks: settings.microtask_policy.mode(),
            wasm: Arc::clone(&settings.wasm_codegen_policy),
            promise_reject: Arc::clone(&settings.promise_reject_policy),
        }
    }
}

/// A configured V8 isolate registered with a [`Platform`].
///
/// Derefs to [`v8::Isolate`]. Isolates on one thread must be dropped in
/// reverse creation order.
pub struct Isolate {
    // Declared first: the isolate must be disposed before its registration and
    // allocator are released.
    inner: v8::OwnedIsolate,
    registration: IsolateRegistration,
    allocator: Option<Arc<ArrayBufferAllocator>>,
    policies: IsolatePolicies,
}

impl Isolate {
    pub fn id(&self) -> IsolateId {
        self.registration.id()
    }

    pub fn platform(&self) -> &Arc<Platform> {
        self.registration.platform()
    }

    pub fn allocator(&self) -> Option<&Arc<ArrayBufferAllocator>> {
        self.allocator.as_ref()
    }

    pub fn microtask_mode(&self) -> MicrotaskMode {
        self.policies.microtasks
    }

    /// Run pending platform tasks for this isolate.
    pub fn drain_tasks(&mut self) {
        let platform = Arc::clone(self.registration.platform());
        platform.drain_tasks(&mut self.inner, self.registration.id());
    }
}

impl Deref for Isolate {
    type Target = v8::Isolate;

    fn deref(&self) -> &v8::Isolate {
        &self.inner
    }
}

impl DerefMut for Isolate {
    fn deref_mut(&mut self) -> &mut v8::Isolate {
        &mut self.inner
    }
}

/// Create and configure an isolate.
///
/// `allocator` is used for every ArrayBuffer backing store; `None` keeps V8's
/// default allocator.
pub fn new_isolate(
    allocator: Option<Arc<ArrayBufferAllocator>>,
    event_loop: &EventLoop,
    platform: &Arc<Platform>,
    settings: IsolateSettings,
) -> Result<Isolate> {
    let registration = platform
        .register_isolate(event_loop.id())
        .map_err(|e| EnvironmentError::IsolateCreation(e.to_string()))?;

    let mut params = v8::CreateParams::default();

    if let Some(limits) = heap::resolve_heap_limits(settings.heap_limits, settings.heap_sizing.as_ref()) {
        params = params.heap_limits(limits.initial_bytes, limits.max_bytes);
    }

    if let Some(allocator) = &allocator {
        params = params.array_buffer_allocator(Arc::clone(allocator).into_v8_allocator());
    }

    let mut inner = v8::Isolate::new(params);
    registration.bind(inner.thread_safe_handle());

    let policies = IsolatePolicies::from(&settings);
    set_isolate_error_handlers(&mut inner, &settings);
    set_isolate_misc_handlers(&mut inner, &policies);
    inner.set_slot(policies.clone());

    tracing::debug!(
        "Created isolate {} (tracking allocator: {})",
        registration.id().as_u64(),
        allocator.as_ref().is_some_and(|a| a.is_tracking())
    );

    Ok(Isolate {
        inner,
        registration,
        allocator,
        policies,
    })
}

fn set_isolate_error_handlers(isolate: &mut v8::Isolate, settings: &IsolateSettings) {
    if settings.message_listener {
        isolate.add_message_listener(callbacks::message_listener);
    }

    heap::set_thread_fatal_error_policy(Arc::clone(&settings.error_policy));
    isolate.set_oom_error_handler(heap::oom_error_handler);

    isolate.set_prepare_stack_trace_callback(callbacks::prepare_stack_trace_callback);
    isolate.set_capture_stack_trace_for_uncaught_exceptions(true, STACK_TRACE_FRAME_LIMIT);
}

fn set_isolate_misc_handlers(isolate: &mut v8::Isolate, policies: &IsolatePolicies) {
    isolate.set_microtasks_policy(policies.microtasks.to_v8());
    isolate.set_allow_wasm_code_generation_callback(callbacks::allow_wasm_code_generation);
    isolate.set_promise_reject_callback(callbacks::promise_reject_callback);
}

/// Per-isolate data shared by every environment created on the isolate.
pub struct IsolateData {
    isolate_id: IsolateId,
    process: Arc<ProcessContext>,
    platform: Arc<Platform>,
    event_loop: Rc<EventLoop>,
    allocator: Option<Arc<ArrayBufferAllocator>>,
    error_policy: Arc<dyn ErrorPolicy>,
    microtask_mode: MicrotaskMode,
}

impl IsolateData {
    pub fn new(isolate: &Isolate, process: Arc<ProcessContext>, event_loop: Rc<EventLoop>) -> Rc<Self> {
        Rc::new(Self {
            isolate_id: isolate.id(),
            process,
            platform: Arc::clone(isolate.platform()),
            event_loop,
            allocator: isolate.allocator.clone(),
            error_policy: Arc::clone(&isolate.policies.error),
            microtask_mode: isolate.policies.microtasks,
        })
    }

    pub fn isolate_id(&self) -> IsolateId {
        self.isolate_id
    }

    pub fn process(&self) -> &Arc<ProcessContext> {
        &self.process
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        &self.event_loop
    }

    pub fn allocator(&self) -> Option<&Arc<ArrayBufferAllocator>> {
        self.allocator.as_ref()
    }

    pub fn error_policy(&self) -> &Arc<dyn ErrorPolicy> {
        &self.error_policy
    }

    pub fn microtask_mode(&self) -> MicrotaskMode {
        self.microtask_mode
    }
}

impl std::fmt::Debug for IsolateData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsolateData")
            .field("isolate_id", &self.isolate_id)
            .field("event_loop", &self.event_loop.id())
            .field("microtask_mode", &self.microtask_mode)
            .finish_non_exhaustive()
    }
}
