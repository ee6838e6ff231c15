use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Instant;

use crate::config::EnvironmentFlags;
use crate::error::{EnvironmentError, JsException, LifecycleState, Result};
use crate::event_loop::{EventLoop, ThreadStopper};
use crate::inspector::InspectorAgent;
use crate::isolate::{AbortContext, IsolateData, RejectionTracker};
use crate::thread_id::ThreadId;

use super::hooks::{AtExitCallbacks, CleanupHookId, CleanupHooks};
use super::linked_bindings::LinkedBindings;
use super::sub_workers::SubWorkerHandle;
use super::timers::TimerQueue;

pub(crate) type CleanupHook = Box<dyn for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>)>;
pub(crate) type AtExitCallback = Box<dyn FnOnce(&EnvironmentState)>;

/// Everything an environment tracks, stored in its context's slot.
///
/// Native callbacks reach it with
/// [`Environment::get_current`](super::Environment::get_current).
pub struct EnvironmentState {
    isolate_data: Rc<IsolateData>,
    thread_id: ThreadId,
    flags: EnvironmentFlags,
    args: Vec<String>,
    exec_args: Vec<String>,
    is_main_thread: bool,

    lifecycle: Cell<LifecycleState>,
    stopper: ThreadStopper,
    bootstrap_complete: Cell<bool>,

    abort_on_uncaught_exception: bool,
    abort_toggle: Cell<bool>,
    abort_suppression_depth: Cell<u32>,

    cleanup_hooks: RefCell<CleanupHooks<CleanupHook>>,
    at_exit: RefCell<AtExitCallbacks<AtExitCallback>>,
    timers: RefCell<TimerQueue<v8::Global<v8::Function>>>,
    rejections: RejectionTracker,
    sub_workers: RefCell<Vec<SubWorkerHandle>>,
    inspector: RefCell<InspectorAgent>,

    linked_bindings: LinkedBindings,
    linked_exports: RefCell<HashMap<String, v8::Global<v8::Object>>>,

    process_object: RefCell<Option<v8::Global<v8::Object>>>,
    require: RefCell<Option<v8::Global<v8::Function>>>,
    internal_binding: RefCell<Option<v8::Global<v8::Function>>>,
    prepare_stack_trace: RefCell<Option<v8::Global<v8::Function>>>,
    main_unit: RefCell<Option<String>>,
}

pub(crate) struct EnvironmentInit {
    pub(crate) isolate_data: Rc<IsolateData>,
    pub(crate) thread_id: ThreadId,
    pub(crate) flags: EnvironmentFlags,
    pub(crate) args: Vec<String>,
    pub(crate) exec_args: Vec<String>,
    pub(crate) is_main_thread: bool,
    pub(crate) linked_bindings: LinkedBindings,
}

impl EnvironmentState {
    pub(crate) fn new(init: EnvironmentInit) -> Self {
        let abort_on_uncaught_exception = init.isolate_data.process().options().abort_on_uncaught_exception
            && !init.flags.contains(EnvironmentFlags::OWNS_PROCESS_STATE);

        Self {
            thread_id: init.thread_id,
            flags: init.flags,
            args: init.args,
            exec_args: init.exec_args,
            is_main_thread: init.is_main_thread,
            lifecycle: Cell::new(LifecycleState::Constructed),
            stopper: ThreadStopper::new(),
            bootstrap_complete: Cell::new(false),
            abort_on_uncaught_exception,
            abort_toggle: Cell::new(true),
            abort_suppression_depth: Cell::new(0),
            cleanup_hooks: RefCell::new(CleanupHooks::new()),
            at_exit: RefCell::new(AtExitCallbacks::new()),
            timers: RefCell::new(TimerQueue::new()),
            rejections: RejectionTracker::new(),
            sub_workers: RefCell::new(Vec::new()),
            inspector: RefCell::new(InspectorAgent::new(init.thread_id)),
            linked_bindings: init.linked_bindings,
            linked_exports: RefCell::new(HashMap::new()),
            process_object: RefCell::new(None),
            require: RefCell::new(None),
            internal_binding: RefCell::new(None),
            prepare_stack_trace: RefCell::new(None),
            main_unit: RefCell::new(None),
            isolate_data: init.isolate_data,
        }
    }

    /// The environment bound to `context`, if any.
    pub fn from_context(context: v8::Local<v8::Context>) -> Option<Rc<Self>> {
        context.get_slot::<EnvironmentState>()
    }

    pub fn isolate_data(&self) -> &Rc<IsolateData> {
        &self.isolate_data
    }

    pub fn event_loop(&self) -> &Rc<EventLoop> {
        self.isolate_data.event_loop()
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn flags(&self) -> EnvironmentFlags {
        self.flags
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn exec_args(&self) -> &[String] {
        &self.exec_args
    }

    pub fn is_main_thread(&self) -> bool {
        self.is_main_thread
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.get()
    }

    /// Move forward to `to`; states are never re-entered.
    pub(crate) fn transition(&self, to: LifecycleState) -> Result<()> {
        let from = self.lifecycle.get();

        if to <= from {
            return Err(EnvironmentError::InvalidState { from, to });
        }

        tracing::debug!("Environment {} {:?} -> {:?}", self.thread_id, from, to);
        self.lifecycle.set(to);
        Ok(())
    }

    pub(crate) fn expect_state(&self, expected: LifecycleState, to: LifecycleState) -> Result<()> {
        let from = self.lifecycle.get();

        if from != expected {
            return Err(EnvironmentError::InvalidState { from, to });
        }

        Ok(())
    }

    pub fn stopper(&self) -> &ThreadStopper {
        &self.stopper
    }

    pub fn is_stopping(&self) -> bool {
        self.stopper.is_stopped()
    }

    pub fn is_bootstrap_complete(&self) -> bool {
        self.bootstrap_complete.get()
    }

    pub(crate) fn mark_bootstrap_complete(&self) {
        self.bootstrap_complete.set(true);
    }

    pub fn abort_on_uncaught_exception(&self) -> bool {
        self.abort_on_uncaught_exception
    }

    pub fn set_abort_on_uncaught_toggle(&self, enabled: bool) {
        self.abort_toggle.set(enabled);
    }

    pub fn abort_on_uncaught_toggle(&self) -> bool {
        self.abort_toggle.get()
    }

    /// Suppress abort-on-uncaught until the returned guard drops.
    pub fn suppress_abort_on_uncaught(&self) -> AbortSuppressionGuard<'_> {
        self.abort_suppression_depth.set(self.abort_suppression_depth.get() + 1);
        AbortSuppressionGuard { env: self }
    }

    pub fn is_abort_suppressed(&self) -> bool {
        self.abort_suppression_depth.get() > 0
    }

    pub fn should_abort_on_uncaught_exception(&self) -> bool {
        let ctx = AbortContext {
            enabled: self.abort_on_uncaught_exception,
            is_main_thread: self.is_main_thread,
            is_stopping: self.is_stopping(),
            toggle: self.abort_toggle.get(),
            suppressed: self.is_abort_suppressed(),
        };

        self.isolate_data
            .error_policy()
            .should_abort_on_uncaught_exception(&ctx)
    }

    /// Turn an uncaught exception into an error, aborting the process when
    /// the error policy asks for it.
    pub(crate) fn uncaught(&self, exception: JsException) -> EnvironmentError {
        if self.should_abort_on_uncaught_exception() {
            tracing::error!("Uncaught exception on thread {}: {exception}", self.thread_id);
            std::process::abort();
        }

        EnvironmentError::Script(exception)
    }

    pub fn add_cleanup_hook<F>(&self, hook: F) -> CleanupHookId
    where
        F: for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>) + 'static,
    {
        self.cleanup_hooks.borrow_mut().add(Box::new(hook))
    }

    /// Unregister a hook; `false` if it already ran or was removed.
    pub fn remove_cleanup_hook(&self, id: CleanupHookId) -> bool {
        self.cleanup_hooks.borrow_mut().remove(id).is_some()
    }

    pub fn at_exit<F>(&self, callback: F)
    where
        F: FnOnce(&EnvironmentState) + 'static,
    {
        self.at_exit.borrow_mut().push(Box::new(callback));
    }

    /// Run cleanup hooks newest first until none are left.
    ///
    /// Hooks may register further hooks; those run too.
    pub(crate) fn run_cleanup(&self, scope: &mut v8::PinScope) {
        let mut ran = 0usize;

        loop {
            // Release the borrow before running the hook
            let hook = self.cleanup_hooks.borrow_mut().pop_newest();
            let Some(hook) = hook else { break };
            hook(scope);
            ran += 1;
        }

        tracing::trace!("Ran {ran} cleanup hooks on thread {}", self.thread_id);
    }

    pub(crate) fn run_at_exit(&self) {
        loop {
            let callback = self.at_exit.borrow_mut().pop();
            let Some(callback) = callback else { break };
            callback(self);
        }
    }

    pub fn add_sub_worker(&self, worker: SubWorkerHandle) {
        self.sub_workers.borrow_mut().push(worker);
    }

    pub fn sub_worker_count(&self) -> usize {
        self.sub_workers.borrow().len()
    }

    pub(crate) fn stop_sub_worker_contexts(&self) {
        let workers: Vec<_> = self.sub_workers.borrow_mut().drain(..).collect();

        for mut worker in workers {
            worker.stop();
        }
    }

    pub fn rejections(&self) -> &RejectionTracker {
        &self.rejections
    }

    pub fn linked_bindings(&self) -> &LinkedBindings {
        &self.linked_bindings
    }

    pub(crate) fn cached_linked_binding(&self, name: &str) -> Option<v8::Global<v8::Object>> {
        self.linked_exports.borrow().get(name).cloned()
    }

    pub(crate) fn cache_linked_binding(&self, name: &str, exports: v8::Global<v8::Object>) {
        self.linked_exports.borrow_mut().insert(name.to_string(), exports);
    }

    pub fn inspector(&self) -> std::cell::Ref<'_, InspectorAgent> {
        self.inspector.borrow()
    }

    pub(crate) fn inspector_mut(&self) -> std::cell::RefMut<'_, InspectorAgent> {
        self.inspector.borrow_mut()
    }

    pub(crate) fn schedule_timer(&self, delay_ms: f64, repeat: bool, callback: v8::Global<v8::Function>) -> u32 {
        let delay = super::timers::delay_from_millis(delay_ms);
        self.timers
            .borrow_mut()
            .schedule(Instant::now(), delay, repeat, callback)
    }

    pub(crate) fn clear_timer(&self, id: u32) -> bool {
        self.timers.borrow_mut().clear(id)
    }

    pub(crate) fn pop_expired_timer(&self, now: Instant) -> Option<(u32, v8::Global<v8::Function>)> {
        self.timers.borrow_mut().pop_expired(now)
    }

    pub fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.borrow().next_deadline()
    }

    pub fn active_timers(&self) -> usize {
        self.timers.borrow().len()
    }

    pub(crate) fn clear_timers(&self) {
        self.timers.borrow_mut().clear_all();
    }

    pub fn process_object(&self) -> Option<v8::Global<v8::Object>> {
        self.process_object.borrow().clone()
    }

    pub(crate) fn set_process_object(&self, process: v8::Global<v8::Object>) {
        self.process_object.replace(Some(process));
    }

    pub fn require(&self) -> Option<v8::Global<v8::Function>> {
        self.require.borrow().clone()
    }

    pub fn internal_binding(&self) -> Option<v8::Global<v8::Function>> {
        self.internal_binding.borrow().clone()
    }

    pub(crate) fn set_loader_exports(&self, require: v8::Global<v8::Function>, internal_binding: v8::Global<v8::Function>) {
        self.require.replace(Some(require));
        self.internal_binding.replace(Some(internal_binding));
    }

    pub fn prepare_stack_trace_callback(&self) -> Option<v8::Global<v8::Function>> {
        self.prepare_stack_trace.borrow().clone()
    }

    pub(crate) fn set_prepare_stack_trace_callback(&self, callback: v8::Global<v8::Function>) {
        self.prepare_stack_trace.replace(Some(callback));
    }

    pub fn main_unit(&self) -> Option<String> {
        self.main_unit.borrow().clone()
    }

    pub(crate) fn set_main_unit(&self, unit: String) {
        self.main_unit.replace(Some(unit));
    }

    pub(crate) fn take_main_unit(&self) -> Option<String> {
        self.main_unit.take()
    }

    /// Drop every handle the environment holds into the heap.
    pub(crate) fn release_handles(&self) {
        self.clear_timers();
        self.rejections.clear();
        self.linked_exports.borrow_mut().clear();
        self.process_object.take();
        self.require.take();
        self.internal_binding.take();
        self.prepare_stack_trace.take();
    }
}

impl std::fmt::Debug for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentState")
            .field("thread_id", &self.thread_id)
            .field("flags", &self.flags)
            .field("state", &self.lifecycle.get())
            .field("stopping", &self.is_stopping())
            .finish_non_exhaustive()
    }
}

/// Keeps abort-on-uncaught suppressed while alive.
#[must_use = "suppression ends when the guard is dropped"]
pub struct AbortSuppressionGuard<'a> {
    env: &'a EnvironmentState,
}

impl Drop for AbortSuppressionGuard<'_> {
    fn drop(&mut self) {
        let depth = self.env.abort_suppression_depth.get();
        self.env.abort_suppression_depth.set(depth.saturating_sub(1));
    }
}
