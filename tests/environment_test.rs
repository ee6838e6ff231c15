mod common;

use common::Harness;
use openworkers_environment_v8::environment::EMBEDDER_MAIN_PREFIX;
use openworkers_environment_v8::{
    EnvironmentError, EnvironmentFlags, LifecycleState, ProcessOptions, IsolateSettings,
    create_environment, free_environment, load_environment, load_environment_from_unit,
    load_environment_with_source,
};
use std::cell::RefCell;
use std::rc::Rc;

#[test]
fn test_create_environment_reaches_ready() {
    let mut h = Harness::new();
    let env = h.environment();

    assert_eq!(env.state(), LifecycleState::Ready);
    assert!(env.is_bootstrap_complete());
    assert!(env.require().is_some());
    assert_eq!(env.args(), ["embedder", "--test"]);

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_create_environment_free_function() {
    let mut h = Harness::new();
    let args = vec!["main".to_string()];
    let exec_args = vec!["--flag".to_string()];

    let env = create_environment(
        &mut h.isolate,
        &h.isolate_data,
        &h.context,
        &args,
        &exec_args,
        EnvironmentFlags::DEFAULT,
        None,
    )
    .expect("environment");

    assert_eq!(env.exec_args(), ["--flag"]);
    assert_eq!(h.eval_default("process.argv.join(',') + '|' + process.execArgv.join(',')"), Ok("main|--flag".to_string()));

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_prepare_installs_execution_globals() {
    let mut h = Harness::new();
    let env = h.environment();

    let globals = h.eval_default(
        "[typeof setTimeout, typeof queueMicrotask, typeof process, typeof require, typeof DOMException].join()",
    );
    assert_eq!(globals, Ok("function,function,object,function,function".to_string()));

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_without_prepare_no_execution_globals() {
    let mut h = Harness::new();
    let env = h.environment_on_new_context(EnvironmentFlags::OWNS_PROCESS_STATE);

    let context = env.context().clone();
    assert_eq!(h.eval(&context, "typeof setTimeout"), Ok("undefined".to_string()));
    assert_eq!(h.eval(&context, "typeof process"), Ok("undefined".to_string()));

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_load_environment_with_source_returns_value() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = load_environment_with_source(
        &mut h.isolate,
        &env,
        "return `${process.threadId}:${typeof require}`;",
        None,
    )
    .expect("load");

    let context = env.context().clone();
    assert_eq!(h.display(&context, &result), format!("{}:function", env.thread_id()));
    assert_eq!(env.state(), LifecycleState::Executing);

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_two_environments_run_their_own_units() {
    let mut h = Harness::new();
    let first = h.environment();
    let second = h.environment_on_new_context(EnvironmentFlags::DEFAULT);

    assert_ne!(first.thread_id(), second.thread_id());

    let first_unit = format!("{EMBEDDER_MAIN_PREFIX}{}", first.thread_id());
    let second_unit = format!("{EMBEDDER_MAIN_PREFIX}{}", second.thread_id());
    assert_ne!(first_unit, second_unit);

    // Both units are registered before either environment starts
    h.process.builtins().replace(first_unit.clone(), "return 'a:' + process.threadId;");
    h.process.builtins().replace(second_unit.clone(), "return 'b:' + process.threadId;");

    let first_result = load_environment_from_unit(&mut h.isolate, &first, &first_unit, None).expect("first");
    let second_result = load_environment_from_unit(&mut h.isolate, &second, &second_unit, None).expect("second");

    let first_context = first.context().clone();
    let second_context = second.context().clone();
    assert_eq!(h.display(&first_context, &first_result), format!("a:{}", first.thread_id()));
    assert_eq!(h.display(&second_context, &second_result), format!("b:{}", second.thread_id()));

    free_environment(&mut h.isolate, second);
    free_environment(&mut h.isolate, first);

    // Only units installed by load_environment_with_source belong to the environment
    assert!(h.process.builtins().remove(&first_unit));
    assert!(h.process.builtins().remove(&second_unit));
}

#[test]
fn test_main_units_removed_on_free() {
    let mut h = Harness::new();
    let first = h.environment();
    let second = h.environment_on_new_context(EnvironmentFlags::DEFAULT);

    let first_result =
        load_environment_with_source(&mut h.isolate, &first, "return 'a:' + process.threadId;", None).expect("first");
    let second_result =
        load_environment_with_source(&mut h.isolate, &second, "return 'b:' + process.threadId;", None).expect("second");

    let first_unit = format!("{EMBEDDER_MAIN_PREFIX}{}", first.thread_id());
    let second_unit = format!("{EMBEDDER_MAIN_PREFIX}{}", second.thread_id());
    assert!(h.process.builtins().contains(&first_unit));
    assert!(h.process.builtins().contains(&second_unit));

    let first_context = first.context().clone();
    let second_context = second.context().clone();
    assert_eq!(h.display(&first_context, &first_result), format!("a:{}", first.thread_id()));
    assert_eq!(h.display(&second_context, &second_result), format!("b:{}", second.thread_id()));

    free_environment(&mut h.isolate, second);
    assert!(h.process.builtins().contains(&first_unit));
    assert!(!h.process.builtins().contains(&second_unit));

    free_environment(&mut h.isolate, first);
    assert!(!h.process.builtins().contains(&first_unit));
}

#[test]
fn test_load_environment_start_callback() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = load_environment(
        &mut h.isolate,
        &env,
        |scope, info| {
            let key = v8::String::new(scope, "threadId").unwrap();
            info.process.get(scope, key.into())
        },
        None,
    )
    .expect("load");

    let context = env.context().clone();
    assert_eq!(h.display(&context, &result), env.thread_id().to_string());

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_main_script_exception_is_script_error() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = load_environment_with_source(&mut h.isolate, &env, "throw new TypeError('bad main');", None);

    match result {
        Err(EnvironmentError::Script(exception)) => {
            assert!(exception.message.contains("bad main"), "{exception:?}");
            assert!(exception.stack.is_some());
        }
        other => panic!("expected script error, got {other:?}"),
    }

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_main_script_syntax_error_is_script_error() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = load_environment_with_source(&mut h.isolate, &env, "return (;", None);
    assert!(matches!(result, Err(EnvironmentError::Script(_))), "{result:?}");

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_empty_start_result() {
    let mut h = Harness::new();
    let env = h.environment();

    let result = load_environment(&mut h.isolate, &env, |_scope, _info| None, None);
    assert!(matches!(result, Err(EnvironmentError::EmptyResult)), "{result:?}");

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_load_twice_is_invalid() {
    let mut h = Harness::new();
    let env = h.environment();

    load_environment_with_source(&mut h.isolate, &env, "return 1;", None).expect("load");
    let again = load_environment_with_source(&mut h.isolate, &env, "return 2;", None);

    assert!(
        matches!(
            again,
            Err(EnvironmentError::InvalidState {
                from: LifecycleState::Executing,
                to: LifecycleState::Executing,
            })
        ),
        "{again:?}"
    );

    free_environment(&mut h.isolate, env);
}

#[test]
fn test_teardown_order() {
    let mut h = Harness::new();
    let env = h.environment();
    let log = Rc::new(RefCell::new(Vec::<String>::new()));

    let stopper = env.stopper().clone();
    let l = Rc::clone(&log);
    env.add_cleanup_hook(move |_scope| l.borrow_mut().push(format!("hook-a stopped={}", stopper.is_stopped())));

    let l = Rc::clone(&log);
    let shared = env.shared();
    env.add_cleanup_hook(move |_scope| {
        l.borrow_mut().push("hook-b".to_string());

        // Registered during cleanup: runs before the remaining hooks
        let l = Rc::clone(&l);
        shared.add_cleanup_hook(move |_scope| l.borrow_mut().push("hook-late".to_string()));
    });

    let l = Rc::clone(&log);
    env.at_exit(move |_env| l.borrow_mut().push("exit-1".to_string()));
    let l = Rc::clone(&log);
    env.at_exit(move |env| l.borrow_mut().push(format!("exit-2 state={:?}", env.state())));

    free_environment(&mut h.isolate, env);

    assert_eq!(
        *log.borrow(),
        vec![
            "hook-b".to_string(),
            "hook-late".to_string(),
            "hook-a stopped=true".to_string(),
            "exit-2 state=CleaningUp".to_string(),
            "exit-1".to_string(),
        ]
    );
}

#[test]
fn test_cleanup_hook_runs_in_context() {
    let mut h = Harness::new();
    let env = h.environment();
    let seen = Rc::new(RefCell::new(None));

    let s = Rc::clone(&seen);
    env.add_cleanup_hook(move |scope| {
        let current = openworkers_environment_v8::Environment::get_current(scope).map(|env| env.thread_id());
        *s.borrow_mut() = current;
    });

    let thread_id = env.thread_id();
    free_environment(&mut h.isolate, env);

    assert_eq!(*seen.borrow(), Some(thread_id));
}

#[test]
fn test_removed_cleanup_hook_does_not_run() {
    let mut h = Harness::new();
    let env = h.environment();
    let ran = Rc::new(RefCell::new(false));

    let r = Rc::clone(&ran);
    let id = env.add_cleanup_hook(move |_scope| *r.borrow_mut() = true);

    assert!(env.remove_cleanup_hook(id));
    assert!(!env.remove_cleanup_hook(id));

    free_environment(&mut h.isolate, env);
    assert!(!*ran.borrow());
}

#[test]
fn test_environment_unbound_after_free() {
    let mut h = Harness::new();
    let env = h.environment();
    let context = env.context().clone();

    free_environment(&mut h.isolate, env);

    let bound = h.run(&context, |scope| openworkers_environment_v8::Environment::get_current(scope).is_some());
    assert!(!bound);
}

#[test]
fn test_owns_process_state_disables_abort() {
    let options = ProcessOptions {
        abort_on_uncaught_exception: true,
        ..Default::default()
    };
    let mut h = Harness::with(options, IsolateSettings::default());

    let owner = h.environment();
    assert!(!owner.abort_on_uncaught_exception());
    assert!(!owner.should_abort_on_uncaught_exception());

    let embedded = h.environment_on_new_context(EnvironmentFlags::PREPARE_FOR_EXECUTION);
    assert!(embedded.abort_on_uncaught_exception());
    assert!(embedded.should_abort_on_uncaught_exception());

    {
        let _guard = embedded.suppress_abort_on_uncaught();
        assert!(!embedded.should_abort_on_uncaught_exception());
    }
    assert!(embedded.should_abort_on_uncaught_exception());

    embedded.set_abort_on_uncaught_toggle(false);
    assert!(!embedded.should_abort_on_uncaught_exception());

    free_environment(&mut h.isolate, embedded);
    free_environment(&mut h.isolate, owner);
}

#[test]
fn test_explicit_thread_id_is_used() {
    let mut h = Harness::new();
    let thread_id = h.process.allocate_thread_id();

    let env = h.builder().thread_id(thread_id).build(&mut h.isolate).expect("environment");
    assert_eq!(env.thread_id(), thread_id);
    assert_eq!(h.eval_default("process.threadId"), Ok(thread_id.to_string()));

    free_environment(&mut h.isolate, env);
}
