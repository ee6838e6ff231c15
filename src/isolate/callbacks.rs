//! V8 callback trampolines.
//!
//! Each function here is registered with V8 once per isolate and forwards to
//! the policies stored in the isolate slot, or to the environment bound to the
//! current context.

use std::pin::pin;

use crate::context::ContextFlags;
use crate::environment::EnvironmentState;
use crate::error::JsException;

use super::IsolatePolicies;
use super::policy::{RejectionEvent, ReportedMessage};

pub(crate) extern "C" fn message_listener(message: v8::Local<v8::Message>, _data: v8::Local<v8::Value>) {
    let scope = pin!(unsafe { v8::CallbackScope::new(message) });
    let scope = &mut scope.init();

    let Some(policies) = scope.get_slot::<IsolatePolicies>().cloned() else {
        return;
    };

    let text = message.get(scope).to_rust_string_lossy(scope);
    let resource = message
        .get_script_resource_name(scope)
        .filter(|name| !name.is_undefined() && !name.is_null())
        .map(|name| name.to_rust_string_lossy(scope));
    let line = message.get_line_number(scope);

    policies.error.on_message(&ReportedMessage { text, resource, line });
}

pub(crate) extern "C" fn promise_reject_callback(message: v8::PromiseRejectMessage) {
    let scope = pin!(unsafe { v8::CallbackScope::new(&message) });
    let scope = &mut scope.init();

    let Some(policies) = scope.get_slot::<IsolatePolicies>().cloned() else {
        return;
    };

    let event = match message.get_event() {
        v8::PromiseRejectEvent::PromiseRejectWithNoHandler => RejectionEvent::Unhandled,
        v8::PromiseRejectEvent::PromiseHandlerAddedAfterReject => RejectionEvent::HandlerAdded,
        v8::PromiseRejectEvent::PromiseRejectAfterResolved => RejectionEvent::RejectAfterResolved,
        v8::PromiseRejectEvent::PromiseResolveAfterResolved => RejectionEvent::ResolveAfterResolved,
    };

    let promise = v8::Global::new(scope, message.get_promise());

    let reason = match event {
        RejectionEvent::Unhandled => message
            .get_value()
            .map(|value| JsException::from_value(scope, value).to_string()),
        _ => None,
    };

    let context = scope.get_current_context();
    let env = EnvironmentState::from_context(context);

    policies
        .promise_reject
        .on_rejection(event, promise, reason, env.as_deref().map(EnvironmentState::rejections));
}

pub(crate) extern "C" fn allow_wasm_code_generation(
    context: v8::Local<v8::Context>,
    _source: v8::Local<v8::String>,
) -> bool {
    let scope = pin!(unsafe { v8::CallbackScope::new(context) });
    let scope = &mut scope.init();

    let flag = context
        .get_slot::<ContextFlags>()
        .and_then(|flags| flags.allow_wasm_code_generation());

    match scope.get_slot::<IsolatePolicies>() {
        Some(policies) => policies.wasm.allow(flag),
        None => flag.unwrap_or(true),
    }
}

/// Format `error.stack`.
///
/// Uses the callback registered by the environment when there is one; an
/// exception thrown by it is re-thrown so V8 sees it as scheduled.
pub(crate) fn prepare_stack_trace_callback<'s, 'i>(
    scope: &mut v8::PinScope<'s, 'i>,
    error: v8::Local<'s, v8::Value>,
    sites: v8::Local<'s, v8::Array>,
) -> v8::Local<'s, v8::Value> {
    let context = scope.get_current_context();

    let callback = EnvironmentState::from_context(context)
        .and_then(|env| env.prepare_stack_trace_callback());

    let Some(callback) = callback else {
        return default_stack_trace(scope, error, sites);
    };

    let callback = v8::Local::new(scope, &callback);
    let global: v8::Local<v8::Value> = context.global(scope).into();
    let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();
    let args = [global, error, sites.into()];

    let tc = pin!(v8::TryCatch::new(scope));
    let tc = &mut tc.init();

    if let Some(result) = callback.call(tc, receiver, &args) {
        return result;
    }

    if tc.has_caught() && !tc.has_terminated() {
        tc.rethrow();
    }

    v8::undefined(tc).into()
}

/// `String(error)` followed by one `at` line per call site.
fn default_stack_trace<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    error: v8::Local<'s, v8::Value>,
    sites: v8::Local<'s, v8::Array>,
) -> v8::Local<'s, v8::Value> {
    let mut trace = error
        .to_string(scope)
        .map(|s| s.to_rust_string_lossy(scope))
        .unwrap_or_default();

    for index in 0..sites.length() {
        let site = sites
            .get_index(scope, index)
            .and_then(|site| site.to_string(scope))
            .map(|site| site.to_rust_string_lossy(scope));

        if let Some(site) = site {
            trace.push_str("\n    at ");
            trace.push_str(&site);
        }
    }

    match v8::String::new(scope, &trace) {
        Some(trace) => trace.into(),
        None => error,
    }
}
