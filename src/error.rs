//! Error types shared by every stage of the environment lifecycle.

use std::fmt;

/// A JavaScript exception captured from a `v8::TryCatch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsException {
    /// `String(exception)`
    pub message: String,
    /// `exception.stack`, when the thrown value carried one
    pub stack: Option<String>,
}

impl JsException {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    /// Describe a thrown value, reading its `stack` property when present.
    pub fn from_value(scope: &mut v8::PinScope<'_, '_>, exception: v8::Local<'_, v8::Value>) -> Self {
        let message = exception
            .to_string(scope)
            .map(|s| s.to_rust_string_lossy(scope))
            .unwrap_or_else(|| "<unprintable exception>".to_string());

        let stack = exception
            .to_object(scope)
            .and_then(|obj| {
                let key = v8::String::new(scope, "stack")?;
                obj.get(scope, key.into())
            })
            .filter(|v| v.is_string())
            .map(|v| v.to_rust_string_lossy(scope));

        Self { message, stack }
    }
}

impl fmt::Display for JsException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stack {
            Some(stack) => f.write_str(stack),
            None => f.write_str(&self.message),
        }
    }
}

/// Turn the state of a try-catch scope into an [`EnvironmentError`].
///
/// Termination wins over any caught exception.
macro_rules! caught {
    ($tc:expr, $make:expr) => {{
        if $tc.has_terminated() {
            $crate::error::EnvironmentError::Terminated
        } else {
            let exception = match $tc.exception() {
                Some(exception) => $crate::error::JsException::from_value($tc, exception),
                None => $crate::error::JsException::new("unknown error"),
            };
            ($make)(exception)
        }
    }};
}

pub(crate) use caught;

/// Log and panic. Panicking across a V8 callback boundary aborts the process.
macro_rules! fatal {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{}", message);
        panic!("{}", message);
    }};
}

pub(crate) use fatal;

/// Lifecycle states an [`Environment`](crate::Environment) moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LifecycleState {
    Constructed,
    Bootstrapping,
    Ready,
    Executing,
    CleaningUp,
    Destroyed,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvironmentError {
    /// The engine instance could not be created or registered.
    #[error("failed to create isolate: {0}")]
    IsolateCreation(String),

    #[error("failed to create context")]
    ContextCreation,

    #[error("bootstrap unit '{0}' is not registered")]
    UnknownBootstrapUnit(String),

    #[error("bootstrap unit '{unit}' failed to compile: {exception}")]
    BootstrapCompile { unit: String, exception: JsException },

    #[error("bootstrap unit '{unit}' threw: {exception}")]
    BootstrapExecution { unit: String, exception: JsException },

    /// Environment construction failed; the partial environment was torn down.
    #[error("environment construction failed: {0}")]
    Construction(#[source] Box<EnvironmentError>),

    #[error("uncaught exception: {0}")]
    Script(JsException),

    #[error("execution was terminated")]
    Terminated,

    #[error("start callback produced no value")]
    EmptyResult,

    #[error("invalid lifecycle transition from {from:?} to {to:?}")]
    InvalidState {
        from: LifecycleState,
        to: LifecycleState,
    },

    #[error("environment is not bound to the current context")]
    NotBound,

    #[error("event loop error: {0}")]
    EventLoop(#[from] std::io::Error),

    #[error("platform has been shut down")]
    PlatformShutDown,
}

pub type Result<T, E = EnvironmentError> = std::result::Result<T, E>;
