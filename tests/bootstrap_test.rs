mod common;

use common::Harness;
use openworkers_environment_v8::builtins::LOADER_UNIT;
use openworkers_environment_v8::context::get_primordials;
use openworkers_environment_v8::{Environment, EnvironmentError, free_environment, get_per_context_exports};

/// Apply the JS function `source` to `object` and stringify the result.
fn probe(scope: &mut v8::PinScope, source: &str, object: v8::Local<v8::Object>) -> String {
    let code = v8::String::new(scope, source).unwrap();
    let function = v8::Script::compile(scope, code, None).unwrap().run(scope).unwrap();
    let function = v8::Local::<v8::Function>::try_from(function).unwrap();
    let receiver = v8::undefined(scope).into();

    function
        .call(scope, receiver, &[object.into()])
        .unwrap()
        .to_rust_string_lossy(scope)
}

fn own_keys(scope: &mut v8::PinScope, object: v8::Local<v8::Object>) -> Vec<String> {
    probe(scope, "(o) => Object.getOwnPropertyNames(o).sort().join('\\n')", object)
        .split('\n')
        .map(str::to_string)
        .collect()
}

#[test]
fn test_two_contexts_have_identical_primordials() {
    let mut h = Harness::new();
    let first = h.context.clone();
    let second = h.new_context();

    let first_keys = h.run(&first, |scope| {
        let primordials = get_primordials(scope).expect("primordials");
        own_keys(scope, primordials)
    });
    let second_keys = h.run(&second, |scope| {
        let primordials = get_primordials(scope).expect("primordials");
        own_keys(scope, primordials)
    });

    assert!(first_keys.len() > 100, "only {} primordials", first_keys.len());
    assert!(first_keys.contains(&"ArrayPrototypePush".to_string()));
    assert!(first_keys.contains(&"SafeMap".to_string()));
    assert_eq!(first_keys, second_keys);
}

#[test]
fn test_primordials_are_frozen_with_null_prototype() {
    let mut h = Harness::new();
    let context = h.context.clone();

    let shape = h.run(&context, |scope| {
        let primordials = get_primordials(scope).expect("primordials");
        probe(scope, "(o) => [Object.isFrozen(o), Object.getPrototypeOf(o) === null].join()", primordials)
    });

    assert_eq!(shape, "true,true");
}

#[test]
fn test_per_context_exports_carry_domexception() {
    let mut h = Harness::new();
    let context = h.context.clone();

    let is_function = h.run(&context, |scope| {
        let exports = get_per_context_exports(scope).expect("exports");
        let key = v8::String::new(scope, "DOMException").unwrap();
        exports.get(scope, key.into()).is_some_and(|v| v.is_function())
    });

    assert!(is_function);
}

#[test]
fn test_runtime_stage_removes_legacy_surface() {
    let mut h = Harness::new();

    assert_eq!(h.eval_default("typeof Atomics.wake"), Ok("undefined".to_string()));
    assert_eq!(
        h.eval_default("typeof Intl === 'undefined' || typeof Intl.v8BreakIterator"),
        Ok("undefined".to_string())
    );
}

#[test]
fn test_domexception_codes() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = h.eval_default(
        "const e = new DOMException('gone', 'NotFoundError'); [e.name, e.code, e instanceof Error, DOMException.NOT_FOUND_ERR].join()",
    );
    assert_eq!(result, Ok("NotFoundError,8,true,8".to_string()));

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_user_patching_does_not_reach_primordials() {
    let mut h = Harness::new();
    let env = h.environment();

    h.eval_default("Array.prototype.push = () => { throw new Error('patched'); }; Map.prototype.get = null;")
        .expect("patch");

    // require() keeps working on its SafeMap cache
    h.process.builtins().add("patched_probe", "module.exports = 'ok';");
    assert_eq!(h.eval_default("require('patched_probe')"), Ok("ok".to_string()));
    assert_eq!(h.eval_default("require('patched_probe')"), Ok("ok".to_string()));

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_failing_bootstrap_unit_returns_error_without_leaks() {
    let mut h = Harness::new();
    h.process
        .builtins()
        .replace(LOADER_UNIT, "new Uint8Array(1024); throw new Error('loader exploded');");

    let result = h.builder().build(&mut h.isolate);

    match result {
        Err(EnvironmentError::Construction(inner)) => match *inner {
            EnvironmentError::BootstrapExecution { unit, exception } => {
                assert_eq!(unit, LOADER_UNIT);
                assert!(exception.message.contains("loader exploded"), "{exception:?}");
            }
            other => panic!("unexpected inner error: {other:?}"),
        },
        Err(other) => panic!("unexpected error: {other:?}"),
        Ok(_) => panic!("bootstrap should fail"),
    }

    let context = h.context.clone();
    let unbound = h.run(&context, |scope| Environment::get_current(scope).is_none());
    drop(context);
    assert!(unbound);

    let common::Harness {
        context,
        isolate_data,
        isolate,
        allocator,
        ..
    } = h;

    drop(context);
    drop(isolate_data);
    drop(isolate);

    assert_eq!(allocator.outstanding_allocations(), Some(0));
}

#[test]
fn test_loader_syntax_error_is_compile_error() {
    let mut h = Harness::new();
    h.process.builtins().replace(LOADER_UNIT, "return {;");

    let result = h.builder().build(&mut h.isolate);

    match result {
        Err(EnvironmentError::Construction(inner)) => {
            assert!(matches!(*inner, EnvironmentError::BootstrapCompile { .. }), "{inner:?}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_tracking_allocator_sees_v8_buffers() {
    let mut h = Harness::new();

    h.eval_default("globalThis.keep = new ArrayBuffer(4096);").expect("allocate");
    assert!(h.allocator.outstanding_allocations().unwrap_or(0) >= 1);

    assert_eq!(
        h.eval_default("new Uint8Array(64).every((b) => b === 0)"),
        Ok("true".to_string())
    );
}
