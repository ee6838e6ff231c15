//! Natives handed to the bootstrap units and exposed on `process`.
//!
//! Every callback resolves its environment through the context slot, so none
//! of them capture state.

use crate::builtins::{self, MODULE_PARAMETERS};
use crate::context;

use super::Environment;

fn throw_error(scope: &mut v8::PinScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::error(scope, message);
    scope.throw_exception(exception);
}

fn throw_type_error(scope: &mut v8::PinScope, message: &str) {
    let message = v8::String::new(scope, message).unwrap();
    let exception = v8::Exception::type_error(scope, message);
    scope.throw_exception(exception);
}

macro_rules! set_method {
    ($scope:expr, $target:expr, $name:literal, $callback:expr) => {{
        let function = v8::Function::new($scope, $callback).unwrap();
        let key = v8::String::new($scope, $name).unwrap();
        function.set_name(key);
        $target.set($scope, key.into(), function.into());
    }};
}

macro_rules! current_env {
    ($scope:expr) => {
        match Environment::get_current($scope) {
            Some(env) => env,
            None => {
                throw_error($scope, "No environment is bound to the current context");
                return;
            }
        }
    };
}

fn string_array<'s>(scope: &mut v8::PinScope<'s, '_>, items: &[String]) -> v8::Local<'s, v8::Array> {
    let elements: Vec<v8::Local<v8::Value>> = items
        .iter()
        .map(|item| v8::String::new(scope, item).unwrap().into())
        .collect();

    v8::Array::new_with_elements(scope, &elements)
}

/// The `process` object passed to the bootstrap units.
pub(crate) fn create_process_object<'s>(scope: &mut v8::PinScope<'s, '_>, env: &super::EnvironmentState) -> v8::Local<'s, v8::Object> {
    let process = v8::Object::new(scope);

    let argv = string_array(scope, env.args());
    let key = v8::String::new(scope, "argv").unwrap();
    process.set(scope, key.into(), argv.into());

    let exec_argv = string_array(scope, env.exec_args());
    let key = v8::String::new(scope, "execArgv").unwrap();
    process.set(scope, key.into(), exec_argv.into());

    let thread_id = v8::Number::new(scope, env.thread_id().as_u64() as f64);
    let key = v8::String::new(scope, "threadId").unwrap();
    process.set(scope, key.into(), thread_id.into());

    let is_main_thread = v8::Boolean::new(scope, env.is_main_thread());
    let key = v8::String::new(scope, "isMainThread").unwrap();
    process.set(scope, key.into(), is_main_thread.into());

    set_method!(scope, process, "_linkedBinding", linked_binding);
    set_method!(scope, process, "_setPrepareStackTraceCallback", set_prepare_stack_trace_callback);

    process
}

pub(crate) fn get_internal_binding_function<'s>(scope: &mut v8::PinScope<'s, '_>) -> v8::Local<'s, v8::Function> {
    v8::Function::new(scope, get_internal_binding).unwrap()
}

pub(crate) fn compile_builtin_function<'s>(scope: &mut v8::PinScope<'s, '_>) -> v8::Local<'s, v8::Function> {
    v8::Function::new(scope, compile_builtin).unwrap()
}

pub(crate) fn mark_bootstrap_complete_function<'s>(scope: &mut v8::PinScope<'s, '_>) -> v8::Local<'s, v8::Function> {
    v8::Function::new(scope, mark_bootstrap_complete).unwrap()
}

/// `getInternalBinding(name)`
fn get_internal_binding(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let name = args.get(0).to_rust_string_lossy(scope);

    let binding = match name.as_str() {
        "timers" => {
            let binding = v8::Object::new(scope);
            set_method!(scope, binding, "scheduleTimer", schedule_timer);
            set_method!(scope, binding, "clearTimer", clear_timer);
            set_method!(scope, binding, "now", now);
            binding
        }
        "errors" => {
            let binding = v8::Object::new(scope);
            set_method!(scope, binding, "setPrepareStackTraceCallback", set_prepare_stack_trace_callback);
            binding
        }
        "per_context" => match context::get_per_context_exports(scope) {
            Some(exports) => exports,
            None => {
                throw_error(scope, "Per-context exports are not initialized");
                return;
            }
        },
        _ => {
            throw_error(scope, &format!("No such binding: {name}"));
            return;
        }
    };

    rv.set(binding.into());
}

/// `compileBuiltin(id)`: compile a registered unit as a built-in module.
fn compile_builtin(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let env = current_env!(scope);
    let id = args.get(0).to_rust_string_lossy(scope);

    let registry = env.isolate_data().process().builtins();

    let source = match registry.source(&id) {
        Some(source) if registry.can_be_required(&id) => source,
        _ => {
            throw_error(scope, &format!("No such built-in module: {id}"));
            return;
        }
    };

    // On failure the compile error stays pending and propagates to the caller
    if let Some(function) = builtins::compile_function(scope, &id, &source, MODULE_PARAMETERS) {
        rv.set(function.into());
    }
}

fn mark_bootstrap_complete(scope: &mut v8::PinScope, _args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let env = current_env!(scope);
    env.mark_bootstrap_complete();
}

/// `process._linkedBinding(name)`
fn linked_binding(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let env = current_env!(scope);
    let name = args.get(0).to_rust_string_lossy(scope);

    if let Some(exports) = env.cached_linked_binding(&name) {
        rv.set(v8::Local::new(scope, &exports).into());
        return;
    }

    // Clone the entry so no lock is held while the init runs
    let Some(binding) = env.linked_bindings().find(&name) else {
        throw_error(scope, &format!("No such binding: {name}"));
        return;
    };

    let exports = v8::Object::new(scope);
    (binding.init())(scope, exports);

    env.cache_linked_binding(&name, v8::Global::new(scope, exports));
    rv.set(exports.into());
}

fn set_prepare_stack_trace_callback(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let env = current_env!(scope);

    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw_type_error(scope, "The \"callback\" argument must be of type function");
        return;
    };

    env.set_prepare_stack_trace_callback(v8::Global::new(scope, callback));
}

/// `scheduleTimer(callback, delay, repeat)` -> id
fn schedule_timer(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let env = current_env!(scope);

    let Ok(callback) = v8::Local::<v8::Function>::try_from(args.get(0)) else {
        throw_type_error(scope, "The \"callback\" argument must be of type function");
        return;
    };

    let delay = args.get(1).number_value(scope).unwrap_or(0.0);
    let repeat = args.get(2).boolean_value(scope);

    let id = env.schedule_timer(delay, repeat, v8::Global::new(scope, callback));
    rv.set(v8::Number::new(scope, id as f64).into());
}

fn clear_timer(scope: &mut v8::PinScope, args: v8::FunctionCallbackArguments, _rv: v8::ReturnValue) {
    let env = current_env!(scope);

    if let Some(id) = args.get(0).uint32_value(scope) {
        env.clear_timer(id);
    }
}

fn now(scope: &mut v8::PinScope, _args: v8::FunctionCallbackArguments, mut rv: v8::ReturnValue) {
    let env = current_env!(scope);
    let now = env.event_loop().now_ms();
    rv.set(v8::Number::new(scope, now).into());
}
