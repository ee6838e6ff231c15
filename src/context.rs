//! Context creation and the two-stage per-context bootstrap.
//!
//! The snapshot-safe stage builds the `primordials` and per-context `exports`
//! objects and runs the per-context units against them. The runtime stage
//! removes engine surface that embedders should not expose. Both results are
//! reachable from native code through the [`BootstrapContext`] slot.

use std::cell::Cell;
use std::pin::pin;
use std::rc::Rc;

use crate::builtins::{BuiltinRegistry, PER_CONTEXT_PARAMETERS, PER_CONTEXT_UNITS};
use crate::error::{EnvironmentError, Result};

/// Per-context flags read by the isolate callbacks.
#[derive(Debug, Default)]
pub struct ContextFlags {
    allow_wasm_code_generation: Cell<Option<bool>>,
}

impl ContextFlags {
    /// `None` when never set; the wasm policy decides what that means.
    pub fn allow_wasm_code_generation(&self) -> Option<bool> {
        self.allow_wasm_code_generation.get()
    }

    pub fn set_allow_wasm_code_generation(&self, allow: bool) {
        self.allow_wasm_code_generation.set(Some(allow));
    }
}

/// Objects produced by the snapshot-safe stage.
#[derive(Debug)]
pub struct BootstrapContext {
    exports: v8::Global<v8::Object>,
    primordials: v8::Global<v8::Object>,
}

impl BootstrapContext {
    pub fn exports(&self) -> &v8::Global<v8::Object> {
        &self.exports
    }

    pub fn primordials(&self) -> &v8::Global<v8::Object> {
        &self.primordials
    }
}

/// Properties deleted from fresh contexts: (global, property).
const RUNTIME_DELETIONS: &[(&str, &str)] = &[("Intl", "v8BreakIterator"), ("Atomics", "wake")];

/// Create a context and run both bootstrap stages on it.
pub fn new_context(isolate: &mut v8::Isolate, builtins: &BuiltinRegistry) -> Result<v8::Global<v8::Context>> {
    let scope = pin!(v8::HandleScope::new(isolate));
    let mut scope = scope.init();
    let context = v8::Context::new(&scope, Default::default());
    let scope = &mut v8::ContextScope::new(&mut scope, context);

    initialize_context(scope, builtins)?;

    Ok(v8::Global::new(scope, context))
}

/// Run the snapshot-safe stage, then the runtime stage, on the current context.
pub fn initialize_context(scope: &mut v8::PinScope, builtins: &BuiltinRegistry) -> Result<()> {
    initialize_context_for_snapshot(scope, builtins)?;
    initialize_context_runtime(scope);
    Ok(())
}

/// Build `primordials` and per-context `exports`, then run the per-context units.
///
/// Contains nothing that cannot be serialized into a snapshot.
pub fn initialize_context_for_snapshot(scope: &mut v8::PinScope, builtins: &BuiltinRegistry) -> Result<()> {
    let context = scope.get_current_context();

    let flags = Rc::new(ContextFlags::default());
    flags.set_allow_wasm_code_generation(true);
    context.set_slot(flags);

    let global = context.global(scope);

    let primordials = v8::Object::new(scope);
    let null: v8::Local<v8::Value> = v8::null(scope).into();
    if primordials.set_prototype(scope, null) != Some(true) {
        return Err(EnvironmentError::ContextCreation);
    }

    let exports = v8::Object::new(scope);

    context.set_slot(Rc::new(BootstrapContext {
        exports: v8::Global::new(scope, exports),
        primordials: v8::Global::new(scope, primordials),
    }));

    let arguments = [global.into(), exports.into(), primordials.into()];

    for unit in PER_CONTEXT_UNITS {
        builtins.execute(scope, unit, PER_CONTEXT_PARAMETERS, &arguments)?;
    }

    tracing::trace!("Per-context units ran");

    Ok(())
}

/// Delete engine surface that fresh contexts should not expose.
///
/// Best-effort: a missing owner or a failed delete is not an error.
pub fn initialize_context_runtime(scope: &mut v8::PinScope) {
    let context = scope.get_current_context();
    let global = context.global(scope);

    for (owner, property) in RUNTIME_DELETIONS {
        let owner_key = v8::String::new(scope, owner).unwrap();

        let owner_obj = global
            .get(scope, owner_key.into())
            .filter(|v| v.is_object())
            .and_then(|v| v.to_object(scope));

        let Some(owner_obj) = owner_obj else {
            tracing::trace!("{owner} is not present, skipping {owner}.{property}");
            continue;
        };

        let property_key = v8::String::new(scope, property).unwrap();

        if owner_obj.delete(scope, property_key.into()) != Some(true) {
            tracing::trace!("Could not delete {owner}.{property}");
        }
    }
}

/// The per-context exports object (e.g. `DOMException`).
pub fn get_per_context_exports<'s>(scope: &mut v8::PinScope<'s, '_>) -> Option<v8::Local<'s, v8::Object>> {
    let bootstrap = scope.get_current_context().get_slot::<BootstrapContext>()?;
    Some(v8::Local::new(scope, &bootstrap.exports))
}

pub fn get_primordials<'s>(scope: &mut v8::PinScope<'s, '_>) -> Option<v8::Local<'s, v8::Object>> {
    let bootstrap = scope.get_current_context().get_slot::<BootstrapContext>()?;
    Some(v8::Local::new(scope, &bootstrap.primordials))
}
