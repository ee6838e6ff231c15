//! Named bootstrap units and the compile/execute primitives used to run them.
//!
//! A unit is a chunk of JavaScript compiled as the body of a function whose
//! parameter names are fixed by the caller, e.g.
//! `(global, exports, primordials)` for per-context units. Units are looked up
//! by id, so an environment can register additional ones (such as an
//! embedder-supplied main script) at runtime.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, RwLock};

use crate::error::{EnvironmentError, Result, caught};

/// Per-context units, run in this order.
pub const PER_CONTEXT_UNITS: &[&str] = &[
    "internal/per_context/primordials",
    "internal/per_context/domexception",
];

pub const PER_CONTEXT_PARAMETERS: &[&str] = &["global", "exports", "primordials"];

pub const LOADER_UNIT: &str = "internal/bootstrap/loaders";
pub const LOADER_PARAMETERS: &[&str] = &[
    "process",
    "getInternalBinding",
    "compileBuiltin",
    "markBootstrapComplete",
    "primordials",
];

pub const PREPARE_UNIT: &str = "internal/bootstrap/environment";
pub const PREPARE_PARAMETERS: &[&str] = &["process", "require", "internalBinding", "primordials"];

pub const MAIN_PARAMETERS: &[&str] = &["process", "require"];

pub const MODULE_PARAMETERS: &[&str] = &["exports", "require", "module", "process", "primordials"];

const INTERNAL_PREFIX: &str = "internal/";

const DEFAULT_UNITS: &[(&str, &str)] = &[
    (
        "internal/per_context/primordials",
        include_str!("js/per_context/primordials.js"),
    ),
    (
        "internal/per_context/domexception",
        include_str!("js/per_context/domexception.js"),
    ),
    (LOADER_UNIT, include_str!("js/bootstrap/loaders.js")),
    (PREPARE_UNIT, include_str!("js/bootstrap/environment.js")),
];

/// Registry of bootstrap units, shared by every environment in the process.
#[derive(Debug)]
pub struct BuiltinRegistry {
    units: RwLock<HashMap<String, Arc<str>>>,
}

impl Default for BuiltinRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinRegistry {
    /// A registry holding the built-in internal units.
    pub fn new() -> Self {
        let units = DEFAULT_UNITS
            .iter()
            .map(|(id, source)| (id.to_string(), Arc::<str>::from(*source)))
            .collect();

        Self {
            units: RwLock::new(units),
        }
    }

    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            units: RwLock::new(HashMap::new()),
        }
    }

    /// Register a unit. Returns `false` if `id` is already taken.
    pub fn add(&self, id: impl Into<String>, source: impl Into<Arc<str>>) -> bool {
        let id = id.into();
        let mut units = self.units.write().expect("builtin registry poisoned");

        if units.contains_key(&id) {
            tracing::warn!("Bootstrap unit '{id}' is already registered");
            return false;
        }

        tracing::trace!("Registered bootstrap unit '{id}'");
        units.insert(id, source.into());
        true
    }

    /// Register or overwrite a unit.
    pub fn replace(&self, id: impl Into<String>, source: impl Into<Arc<str>>) {
        self.units
            .write()
            .expect("builtin registry poisoned")
            .insert(id.into(), source.into());
    }

    /// Unregister `id`; returns whether it was present.
    pub fn remove(&self, id: &str) -> bool {
        self.units
            .write()
            .expect("builtin registry poisoned")
            .remove(id)
            .is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.units.read().expect("builtin registry poisoned").contains_key(id)
    }

    pub fn source(&self, id: &str) -> Option<Arc<str>> {
        self.units.read().expect("builtin registry poisoned").get(id).cloned()
    }

    /// Whether scripts may `require()` this unit.
    pub fn can_be_required(&self, id: &str) -> bool {
        !id.starts_with(INTERNAL_PREFIX) && self.contains(id)
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self
            .units
            .read()
            .expect("builtin registry poisoned")
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Compile unit `id` into a function taking `parameters`.
    pub fn lookup_and_compile<'s>(
        &self,
        scope: &mut v8::PinScope<'s, '_>,
        id: &str,
        parameters: &[&str],
    ) -> Result<v8::Local<'s, v8::Function>> {
        // Clone out of the lock before touching V8
        let source = self
            .source(id)
            .ok_or_else(|| EnvironmentError::UnknownBootstrapUnit(id.to_string()))?;

        let tc = pin!(v8::TryCatch::new(scope));
        let tc = &mut tc.init();

        match compile_function(tc, id, &source, parameters) {
            Some(function) => Ok(function),
            None => Err(caught!(tc, |exception| EnvironmentError::BootstrapCompile {
                unit: id.to_string(),
                exception,
            })),
        }
    }

    /// Compile unit `id` and call it with `arguments` bound to `parameters`.
    pub fn execute<'s>(
        &self,
        scope: &mut v8::PinScope<'s, '_>,
        id: &str,
        parameters: &[&str],
        arguments: &[v8::Local<'s, v8::Value>],
    ) -> Result<v8::Local<'s, v8::Value>> {
        debug_assert_eq!(parameters.len(), arguments.len());

        let function = self.lookup_and_compile(scope, id, parameters)?;
        let receiver: v8::Local<v8::Value> = v8::undefined(scope).into();

        let tc = pin!(v8::TryCatch::new(scope));
        let tc = &mut tc.init();

        match function.call(tc, receiver, arguments) {
            Some(result) => Ok(result),
            None => Err(caught!(tc, |exception| EnvironmentError::BootstrapExecution {
                unit: id.to_string(),
                exception,
            })),
        }
    }
}

/// Compile `source` as the body of a function taking `parameters`.
///
/// On `None` an exception is pending on `scope`.
pub(crate) fn compile_function<'s>(
    scope: &mut v8::PinScope<'s, '_>,
    id: &str,
    source: &str,
    parameters: &[&str],
) -> Option<v8::Local<'s, v8::Function>> {
    let wrapped = wrap_source(id, source, parameters);
    let code = v8::String::new(scope, &wrapped)?;
    let script = v8::Script::compile(scope, code, None)?;
    let value = script.run(scope)?;
    v8::Local::<v8::Function>::try_from(value).ok()
}

fn wrap_source(id: &str, source: &str, parameters: &[&str]) -> String {
    format!(
        "(function ({}) {{\n{}\n}})\n//# sourceURL=builtin:{}",
        parameters.join(", "),
        source,
        id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_registered() {
        let registry = BuiltinRegistry::new();

        for id in PER_CONTEXT_UNITS {
            assert!(registry.contains(id), "{id} missing");
        }
        assert!(registry.contains(LOADER_UNIT));
        assert!(registry.contains(PREPARE_UNIT));
    }

    #[test]
    fn test_add_refuses_duplicates() {
        let registry = BuiltinRegistry::empty();

        assert!(registry.add("embedder_main_0", "return 1;"));
        assert!(!registry.add("embedder_main_0", "return 2;"));
        assert_eq!(registry.source("embedder_main_0").as_deref(), Some("return 1;"));

        registry.replace("embedder_main_0", "return 3;");
        assert_eq!(registry.source("embedder_main_0").as_deref(), Some("return 3;"));
    }

    #[test]
    fn test_internal_units_cannot_be_required() {
        let registry = BuiltinRegistry::new();
        registry.add("greeting", "module.exports = 'hi';");

        assert!(!registry.can_be_required(LOADER_UNIT));
        assert!(registry.can_be_required("greeting"));
        assert!(!registry.can_be_required("missing"));
    }

    #[test]
    fn test_wrap_source_binds_parameters() {
        let wrapped = wrap_source("x", "return a + b;", &["a", "b"]);
        assert!(wrapped.starts_with("(function (a, b) {\nreturn a + b;\n})"));
        assert!(wrapped.ends_with("//# sourceURL=builtin:x"));
    }
}
