//! The per-thread execution environment.
//!
//! An [`Environment`] is bound to one context and moves through
//! [`LifecycleState`] in order:
//!
//! 1. [`create_environment`] / [`EnvironmentBuilder::build`] binds it to the
//!    context and runs the loader unit (plus the prepare unit when
//!    [`EnvironmentFlags::PREPARE_FOR_EXECUTION`] is set).
//! 2. [`load_environment`] or [`load_environment_with_source`] starts
//!    execution.
//! 3. [`spin_event_loop`] runs timers, platform tasks and microtasks until idle.
//! 4. [`free_environment`] stops workers, runs cleanup hooks then at-exit
//!    callbacks, drains platform tasks and releases the environment.

mod bindings;
mod hooks;
mod linked_bindings;
mod state;
mod sub_workers;
mod timers;

use std::ops::Deref;
use std::pin::pin;
use std::rc::Rc;
use std::time::Instant;

use crate::builtins::{self, LOADER_PARAMETERS, LOADER_UNIT, MAIN_PARAMETERS, PREPARE_PARAMETERS, PREPARE_UNIT};
use crate::config::EnvironmentFlags;
use crate::context;
use crate::error::{EnvironmentError, JsException, LifecycleState, Result, caught};
use crate::event_loop::{EventLoop, EventLoopRuntime, SpinOutcome, ThreadStopper};
use crate::inspector::InspectorParentHandle;
use crate::isolate::{IsolateData, MicrotaskMode};
use crate::thread_id::ThreadId;

pub use hooks::CleanupHookId;
pub use linked_bindings::{LinkedBinding, LinkedBindingInit, LinkedBindings, add_linked_binding};
pub use state::{AbortSuppressionGuard, EnvironmentState};
pub use sub_workers::SubWorkerHandle;

use state::EnvironmentInit;

/// Prefix of the unit registered by [`load_environment_with_source`].
pub const EMBEDDER_MAIN_PREFIX: &str = "embedder_main_";

/// Globals handed to a start callback.
#[derive(Clone, Copy)]
pub struct StartExecutionInfo<'s> {
    pub process: v8::Local<'s, v8::Object>,
    pub require: v8::Local<'s, v8::Function>,
}

/// An environment bound to a context.
///
/// Derefs to its [`EnvironmentState`]. Release it with [`free_environment`].
pub struct Environment {
    state: Rc<EnvironmentState>,
    context: v8::Global<v8::Context>,
}

impl Environment {
    /// The environment bound to the current context of `scope`.
    pub fn get_current(scope: &v8::PinScope) -> Option<Rc<EnvironmentState>> {
        EnvironmentState::from_context(scope.get_current_context())
    }

    pub fn context(&self) -> &v8::Global<v8::Context> {
        &self.context
    }

    pub fn shared(&self) -> Rc<EnvironmentState> {
        Rc::clone(&self.state)
    }

    /// A handle for a child environment to attach its inspector to this one.
    pub fn get_inspector_parent_handle(&self, thread_id: ThreadId, url: &str) -> Option<InspectorParentHandle> {
        get_inspector_parent_handle(&self.state, thread_id, url)
    }
}

impl Deref for Environment {
    type Target = EnvironmentState;

    fn deref(&self) -> &EnvironmentState {
        &self.state
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        if self.state.state() != LifecycleState::Destroyed {
            tracing::warn!(
                "Environment {} dropped in state {:?} without free_environment",
                self.state.thread_id(),
                self.state.state()
            );
        }
    }
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.state.fmt(f)
    }
}

/// The event loop of the environment bound to the current context.
pub fn get_current_event_loop(scope: &v8::PinScope) -> Option<Rc<EventLoop>> {
    Environment::get_current(scope).map(|env| Rc::clone(env.event_loop()))
}

/// A handle linking a child on `thread_id` to `env`'s inspector.
///
/// `None` unless `env` was created with [`EnvironmentFlags::OWNS_INSPECTOR`].
/// `thread_id` must be valid.
pub fn get_inspector_parent_handle(
    env: &EnvironmentState,
    thread_id: ThreadId,
    url: &str,
) -> Option<InspectorParentHandle> {
    if !env.flags().contains(EnvironmentFlags::OWNS_INSPECTOR) {
        tracing::debug!(
            "Environment {} does not own an inspector, no parent handle for thread {}",
            env.thread_id(),
            thread_id
        );
        return None;
    }

    Some(env.inspector().parent_handle(thread_id, url))
}

pub struct EnvironmentBuilder {
    isolate_data: Rc<IsolateData>,
    context: v8::Global<v8::Context>,
    args: Vec<String>,
    exec_args: Vec<String>,
    flags: EnvironmentFlags,
    thread_id: Option<ThreadId>,
    is_main_thread: bool,
    linked_bindings: LinkedBindings,
}

impl EnvironmentBuilder {
    pub fn new(isolate_data: &Rc<IsolateData>, context: &v8::Global<v8::Context>) -> Self {
        Self {
            isolate_data: Rc::clone(isolate_data),
            context: context.clone(),
            args: Vec::new(),
            exec_args: Vec::new(),
            flags: EnvironmentFlags::default(),
            thread_id: None,
            is_main_thread: true,
            linked_bindings: LinkedBindings::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn exec_args<I, S>(mut self, exec_args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exec_args = exec_args.into_iter().map(Into::into).collect();
        self
    }

    pub fn flags(mut self, flags: EnvironmentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Use `thread_id` instead of allocating one.
    pub fn thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn main_thread(mut self, is_main_thread: bool) -> Self {
        self.is_main_thread = is_main_thread;
        self
    }

    /// Share an existing linked-binding list.
    pub fn linked_bindings(mut self, bindings: LinkedBindings) -> Self {
        self.linked_bindings = bindings;
        self
    }

    /// Bind to the context and bootstrap.
    ///
    /// On failure the partial environment is torn down before returning.
    pub fn build(self, isolate: &mut v8::Isolate) -> Result<Environment> {
        let thread_id = self
            .thread_id
            .filter(|id| id.is_valid())
            .unwrap_or_else(|| self.isolate_data.process().allocate_thread_id());
        let prepare = self.flags.contains(EnvironmentFlags::PREPARE_FOR_EXECUTION);

        let env = Environment {
            state: Rc::new(EnvironmentState::new(EnvironmentInit {
                isolate_data: self.isolate_data,
                thread_id,
                flags: self.flags,
                args: self.args,
                exec_args: self.exec_args,
                is_main_thread: self.is_main_thread,
                linked_bindings: self.linked_bindings,
            })),
            context: self.context,
        };

        let result = {
            let scope = pin!(v8::HandleScope::new(&mut *isolate));
            let mut scope = scope.init();
            let context = v8::Local::new(&scope, &env.context);
            let scope = &mut v8::ContextScope::new(&mut scope, context);

            if context.get_slot::<EnvironmentState>().is_some() {
                tracing::warn!("Context already has an environment; rebinding to thread {thread_id}");
            }
            context.set_slot(Rc::clone(&env.state));

            bootstrap(scope, &env.state, prepare)
        };

        if let Err(error) = result {
            tracing::warn!("Environment {thread_id} failed to bootstrap: {error}");
            teardown(isolate, &env);
            return Err(EnvironmentError::Construction(Box::new(error)));
        }

        tracing::debug!("Created environment {thread_id} ({:?})", env.flags());

        Ok(env)
    }
}

/// Create an environment on `context`.
///
/// `thread_id` of `None` (or [`ThreadId::INVALID`]) allocates a fresh id.
pub fn create_environment(
    isolate: &mut v8::Isolate,
    isolate_data: &Rc<IsolateData>,
    context: &v8::Global<v8::Context>,
    args: &[String],
    exec_args: &[String],
    flags: EnvironmentFlags,
    thread_id: Option<ThreadId>,
) -> Result<Environment> {
    let mut builder = EnvironmentBuilder::new(isolate_data, context)
        .args(args.iter().cloned())
        .exec_args(exec_args.iter().cloned())
        .flags(flags);

    if let Some(thread_id) = thread_id {
        builder = builder.thread_id(thread_id);
    }

    builder.build(isolate)
}

fn bootstrap(scope: &mut v8::PinScope, env: &EnvironmentState, prepare: bool) -> Result<()> {
    env.transition(LifecycleState::Bootstrapping)?;

    let registry = env.isolate_data().process().builtins();

    let process = bindings::create_process_object(scope, env);
    env.set_process_object(v8::Global::new(scope, process));

    let primordials = context::get_primordials(scope).ok_or(EnvironmentError::NotBound)?;

    let arguments: [v8::Local<v8::Value>; 5] = [
        process.into(),
        bindings::get_internal_binding_function(scope).into(),
        bindings::compile_builtin_function(scope).into(),
        bindings::mark_bootstrap_complete_function(scope).into(),
        primordials.into(),
    ];

    let exports = registry.execute(scope, LOADER_UNIT, LOADER_PARAMETERS, &arguments)?;

    let Some((require, internal_binding)) = loader_exports(scope, exports) else {
        return Err(EnvironmentError::BootstrapExecution {
            unit: LOADER_UNIT.to_string(),
            exception: JsException::new("loader did not return { require, internalBinding }"),
        });
    };

    env.set_loader_exports(v8::Global::new(scope, require), v8::Global::new(scope, internal_binding));

    if !env.is_bootstrap_complete() {
        tracing::warn!("{LOADER_UNIT} returned without marking bootstrap complete");
    }

    if prepare {
        let arguments: [v8::Local<v8::Value>; 4] = [
            process.into(),
            require.into(),
            internal_binding.into(),
            primordials.into(),
        ];

        registry.execute(scope, PREPARE_UNIT, PREPARE_PARAMETERS, &arguments)?;
    }

    env.transition(LifecycleState::Ready)
}

fn loader_exports<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    exports: v8::Local<'s, v8::Value>,
) -> Option<(v8::Local<'s, v8::Function>, v8::Local<'s, v8::Function>)> {
    let exports = v8::Local::<v8::Object>::try_from(exports).ok()?;

    let key = v8::String::new(scope, "require")?;
    let require = v8::Local::<v8::Function>::try_from(exports.get(scope, key.into())?).ok()?;

    let key = v8::String::new(scope, "internalBinding")?;
    let internal_binding = v8::Local::<v8::Function>::try_from(exports.get(scope, key.into())?).ok()?;

    Some((require, internal_binding))
}

/// Start execution with `start`.
///
/// Attaches the inspector to `inspector_parent` when given, then calls
/// `start` with the environment's `process` and `require`. An exception
/// thrown by `start` is returned as [`EnvironmentError::Script`].
pub fn load_environment<F>(
    isolate: &mut v8::Isolate,
    env: &Environment,
    start: F,
    inspector_parent: Option<InspectorParentHandle>,
) -> Result<v8::Global<v8::Value>>
where
    F: for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>, StartExecutionInfo<'s>) -> Option<v8::Local<'s, v8::Value>>,
{
    env.expect_state(LifecycleState::Ready, LifecycleState::Executing)?;
    env.transition(LifecycleState::Executing)?;

    initialize_loop_integration(env);
    env.inspector_mut().attach(inspector_parent);

    let process = env.process_object().ok_or(EnvironmentError::NotBound)?;
    let require = env.require().ok_or(EnvironmentError::NotBound)?;

    let scope = pin!(v8::HandleScope::new(isolate));
    let mut scope = scope.init();
    let context = v8::Local::new(&scope, &env.context);
    let scope = &mut v8::ContextScope::new(&mut scope, context);

    let tc = pin!(v8::TryCatch::new(scope));
    let tc = &mut tc.init();

    let info = StartExecutionInfo {
        process: v8::Local::new(tc, &process),
        require: v8::Local::new(tc, &require),
    };

    match start(tc, info) {
        Some(value) => Ok(v8::Global::new(tc, value)),
        None if tc.has_caught() || tc.has_terminated() => Err(caught!(tc, |exception| env.uncaught(exception))),
        None => Err(EnvironmentError::EmptyResult),
    }
}

/// Start execution by running registered unit `unit` with `(process, require)`.
pub fn load_environment_from_unit(
    isolate: &mut v8::Isolate,
    env: &Environment,
    unit: &str,
    inspector_parent: Option<InspectorParentHandle>,
) -> Result<v8::Global<v8::Value>> {
    let source = env
        .isolate_data()
        .process()
        .builtins()
        .source(unit)
        .ok_or_else(|| EnvironmentError::UnknownBootstrapUnit(unit.to_string()))?;

    load_environment(
        isolate,
        env,
        |scope, info| {
            // A compile error stays pending for the caller's try-catch
            let main = builtins::compile_function(scope, unit, &source, MAIN_PARAMETERS)?;
            let receiver = v8::undefined(scope).into();
            main.call(scope, receiver, &[info.process.into(), info.require.into()])
        },
        inspector_parent,
    )
}

/// Register `source` as `embedder_main_<thread id>` and run it.
pub fn load_environment_with_source(
    isolate: &mut v8::Isolate,
    env: &Environment,
    source: &str,
    inspector_parent: Option<InspectorParentHandle>,
) -> Result<v8::Global<v8::Value>> {
    env.expect_state(LifecycleState::Ready, LifecycleState::Executing)?;

    let unit = format!("{EMBEDDER_MAIN_PREFIX}{}", env.thread_id());
    env.isolate_data().process().builtins().replace(unit.clone(), source);
    env.set_main_unit(unit.clone());

    load_environment_from_unit(isolate, env, &unit, inspector_parent)
}

fn initialize_loop_integration(env: &EnvironmentState) {
    let data = env.isolate_data();
    let loop_id = data.event_loop().id();

    match data.platform().loop_of(data.isolate_id()) {
        Some(registered) if registered == loop_id => {}
        Some(registered) => tracing::warn!(
            "Isolate {} is registered on loop {} but environment {} runs loop {}",
            data.isolate_id().as_u64(),
            registered.as_u64(),
            env.thread_id(),
            loop_id.as_u64()
        ),
        None => tracing::warn!("Isolate {} is not registered with the platform", data.isolate_id().as_u64()),
    }

    tracing::debug!("Environment {} running on loop {}", env.thread_id(), loop_id.as_u64());
}

/// Run the environment's event loop until idle or stopped.
///
/// An exception thrown by a timer callback, or a promise rejection left
/// unhandled after a microtask checkpoint, ends the spin with
/// [`EnvironmentError::Script`].
pub fn spin_event_loop(isolate: &mut v8::Isolate, env: &Environment) -> Result<SpinOutcome> {
    env.expect_state(LifecycleState::Executing, LifecycleState::Executing)?;

    let mut driver = LoopDriver { isolate, env };
    let outcome = env.event_loop().spin(&mut driver)?;

    tracing::trace!("Environment {} loop finished: {:?}", env.thread_id(), outcome);

    Ok(outcome)
}

struct LoopDriver<'a> {
    isolate: &'a mut v8::Isolate,
    env: &'a Environment,
}

impl LoopDriver<'_> {
    fn checkpoint(&mut self) {
        if self.env.isolate_data().microtask_mode() == MicrotaskMode::Explicit {
            self.isolate.perform_microtask_checkpoint();
        }
    }

    fn report_rejections(&self) -> Result<()> {
        let unhandled = self.env.rejections().take_unhandled();

        for reason in &unhandled {
            tracing::warn!("Unhandled promise rejection on thread {}: {reason}", self.env.thread_id());
        }

        match unhandled.into_iter().next() {
            Some(reason) => Err(self
                .env
                .uncaught(JsException::new(format!("Unhandled promise rejection: {reason}")))),
            None => Ok(()),
        }
    }

    fn call_timer(&mut self, callback: &v8::Global<v8::Function>) -> Result<()> {
        let scope = pin!(v8::HandleScope::new(&mut *self.isolate));
        let mut scope = scope.init();
        let context = v8::Local::new(&scope, &self.env.context);
        let scope = &mut v8::ContextScope::new(&mut scope, context);

        let tc = pin!(v8::TryCatch::new(scope));
        let tc = &mut tc.init();

        let callback = v8::Local::new(tc, callback);
        let receiver = v8::undefined(tc).into();

        match callback.call(tc, receiver, &[]) {
            Some(_) => Ok(()),
            None => Err(caught!(tc, |exception| self.env.uncaught(exception))),
        }
    }
}

impl EventLoopRuntime for LoopDriver<'_> {
    fn stopper(&self) -> &ThreadStopper {
        self.env.stopper()
    }

    fn pump_and_checkpoint(&mut self) -> Result<()> {
        let data = self.env.isolate_data();
        data.platform().drain_tasks(self.isolate, data.isolate_id());
        self.checkpoint();
        self.report_rejections()
    }

    fn run_expired_timers(&mut self, now: Instant) -> Result<usize> {
        let mut ran = 0;

        while let Some((_id, callback)) = self.env.pop_expired_timer(now) {
            self.call_timer(&callback)?;
            self.checkpoint();
            ran += 1;

            if self.env.is_stopping() {
                break;
            }
        }

        Ok(ran)
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.env.next_timer_deadline()
    }
}

/// Tear down and release `env`.
///
/// In a scope on the environment's context: set the stop flag, stop
/// sub-workers, run cleanup hooks, run at-exit callbacks. Then drain the
/// isolate's platform tasks and release the environment.
pub fn free_environment(isolate: &mut v8::Isolate, env: Environment) {
    teardown(isolate, &env);
    tracing::debug!("Freed environment {}", env.thread_id());
    drop(env);
}

fn teardown(isolate: &mut v8::Isolate, env: &Environment) {
    if let Err(error) = env.transition(LifecycleState::CleaningUp) {
        tracing::warn!("Skipping teardown of environment {}: {error}", env.thread_id());
        return;
    }

    {
        let scope = pin!(v8::HandleScope::new(&mut *isolate));
        let mut scope = scope.init();
        let context = v8::Local::new(&scope, &env.context);
        let scope = &mut v8::ContextScope::new(&mut scope, context);

        env.stopper().set_stopped(true);
        env.stop_sub_worker_contexts();
        env.run_cleanup(scope);
        env.run_at_exit();
    }

    // Tasks may still look the environment up through the context slot
    let data = env.isolate_data();
    data.platform().drain_tasks(isolate, data.isolate_id());

    env.inspector_mut().detach();

    if let Some(unit) = env.take_main_unit() {
        data.process().builtins().remove(&unit);
    }

    env.release_handles();

    {
        let scope = pin!(v8::HandleScope::new(&mut *isolate));
        let scope = scope.init();
        let context = v8::Local::new(&scope, &env.context);
        context.remove_slot::<EnvironmentState>();
    }

    if let Err(error) = env.transition(LifecycleState::Destroyed) {
        tracing::warn!("Environment {}: {error}", env.thread_id());
    }
}
