#![allow(dead_code)]

use openworkers_environment_v8::{
    ArrayBufferAllocator, Environment, EnvironmentBuilder, EnvironmentFlags, EventLoop, Isolate,
    IsolateData, IsolateSettings, ProcessContext, ProcessOptions, new_context, new_isolate,
};
use std::pin::pin;
use std::rc::Rc;
use std::sync::Arc;

/// One isolate with a tracking allocator and a bootstrapped default context.
///
/// Fields drop in declaration order: handles first, the isolate after them.
pub struct Harness {
    pub context: v8::Global<v8::Context>,
    pub isolate_data: Rc<IsolateData>,
    pub isolate: Isolate,
    pub event_loop: Rc<EventLoop>,
    pub allocator: Arc<ArrayBufferAllocator>,
    pub process: Arc<ProcessContext>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(ProcessOptions::default(), IsolateSettings::default())
    }

    pub fn with(options: ProcessOptions, settings: IsolateSettings) -> Self {
        Self::in_process(ProcessContext::new(options), settings)
    }

    /// Another isolate in an existing process, e.g. for a worker thread.
    pub fn in_process(process: Arc<ProcessContext>, settings: IsolateSettings) -> Self {
        let allocator = process.create_array_buffer_allocator(true);
        let event_loop = Rc::new(EventLoop::new().expect("event loop"));

        let mut isolate = new_isolate(
            Some(Arc::clone(&allocator)),
            &event_loop,
            process.platform(),
            settings,
        )
        .expect("isolate");

        let isolate_data = IsolateData::new(&isolate, Arc::clone(&process), Rc::clone(&event_loop));
        let context = new_context(&mut isolate, process.builtins()).expect("context");

        Self {
            context,
            isolate_data,
            isolate,
            event_loop,
            allocator,
            process,
        }
    }

    pub fn new_context(&mut self) -> v8::Global<v8::Context> {
        new_context(&mut self.isolate, self.process.builtins()).expect("context")
    }

    pub fn builder(&self) -> EnvironmentBuilder {
        EnvironmentBuilder::new(&self.isolate_data, &self.context)
    }

    /// Environment on the default context with the default flags.
    pub fn environment(&mut self) -> Environment {
        self.builder()
            .args(["embedder", "--test"])
            .build(&mut self.isolate)
            .expect("environment")
    }

    /// Environment on a fresh context.
    pub fn environment_on_new_context(&mut self, flags: EnvironmentFlags) -> Environment {
        let context = self.new_context();
        EnvironmentBuilder::new(&self.isolate_data, &context)
            .flags(flags)
            .build(&mut self.isolate)
            .expect("environment")
    }

    /// Run `f` in a scope entered into `context`.
    pub fn run<R>(
        &mut self,
        context: &v8::Global<v8::Context>,
        f: impl for<'s, 'i> FnOnce(&mut v8::PinScope<'s, 'i>) -> R,
    ) -> R {
        let scope = pin!(v8::HandleScope::new(&mut *self.isolate));
        let mut scope = scope.init();
        let ctx = v8::Local::new(&scope, context);
        let scope = &mut v8::ContextScope::new(&mut scope, ctx);
        f(scope)
    }

    /// Evaluate `code` in `context`, returning `String(result)` or the exception.
    pub fn eval(&mut self, context: &v8::Global<v8::Context>, code: &str) -> Result<String, String> {
        self.run(context, |scope| {
            let tc = pin!(v8::TryCatch::new(scope));
            let tc = tc.init();

            let code = v8::String::new(&tc, code).unwrap();

            let result = v8::Script::compile(&tc, code, None).and_then(|script| script.run(&tc));

            match result {
                Some(value) => Ok(value.to_rust_string_lossy(&tc)),
                None => Err(tc
                    .exception()
                    .map(|e| e.to_rust_string_lossy(&tc))
                    .unwrap_or_else(|| "terminated".to_string())),
            }
        })
    }

    pub fn eval_default(&mut self, code: &str) -> Result<String, String> {
        let context = self.context.clone();
        self.eval(&context, code)
    }

    /// `String(value)` of a value produced by a load call.
    pub fn display(&mut self, context: &v8::Global<v8::Context>, value: &v8::Global<v8::Value>) -> String {
        self.run(context, |scope| v8::Local::new(scope, value).to_rust_string_lossy(scope))
    }
}
