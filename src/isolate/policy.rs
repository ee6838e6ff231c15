//! Isolate-level policies.
//!
//! V8 exposes one raw callback per concern. Each concern here is a trait with
//! a default implementation; the set is injected through
//! [`IsolateSettings`](super::IsolateSettings) and the V8 trampolines in
//! `callbacks.rs` dispatch to it.

use std::cell::RefCell;
use std::fmt;

/// A message reported by V8's message listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportedMessage {
    pub text: String,
    pub resource: Option<String>,
    pub line: Option<usize>,
}

impl fmt::Display for ReportedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.resource, self.line) {
            (Some(resource), Some(line)) => write!(f, "{} ({}:{})", self.text, resource, line),
            (Some(resource), None) => write!(f, "{} ({})", self.text, resource),
            _ => f.write_str(&self.text),
        }
    }
}

/// Inputs to the abort-on-uncaught-exception decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortContext {
    /// Abort was enabled for this environment at construction.
    pub enabled: bool,
    pub is_main_thread: bool,
    pub is_stopping: bool,
    /// The environment's toggle.
    pub toggle: bool,
    /// Inside a "do not abort" scope.
    pub suppressed: bool,
}

/// Abort only on the main thread or a worker that is not shutting down,
/// with the toggle set and outside any suppression scope.
pub fn default_should_abort(ctx: &AbortContext) -> bool {
    ctx.enabled && (ctx.is_main_thread || !ctx.is_stopping) && ctx.toggle && !ctx.suppressed
}

pub trait ErrorPolicy: Send + Sync {
    /// Errors and warnings surfaced by V8's message listener.
    fn on_message(&self, message: &ReportedMessage) {
        tracing::warn!("{message}");
    }

    /// Whether an uncaught exception should abort the process.
    fn should_abort_on_uncaught_exception(&self, ctx: &AbortContext) -> bool {
        default_should_abort(ctx)
    }

    /// V8 hit an unrecoverable condition; the process aborts afterwards.
    fn on_fatal_error(&self, location: &str, message: &str) {
        tracing::error!("Fatal error in {location}: {message}");
    }
}

#[derive(Debug, Default)]
pub struct DefaultErrorPolicy;

impl ErrorPolicy for DefaultErrorPolicy {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MicrotaskMode {
    /// Checkpoints run only when the embedder asks for them.
    #[default]
    Explicit,
    /// V8 runs microtasks when the call depth drops to zero.
    Auto,
}

impl MicrotaskMode {
    pub(crate) fn to_v8(self) -> v8::MicrotasksPolicy {
        match self {
            MicrotaskMode::Explicit => v8::MicrotasksPolicy::Explicit,
            MicrotaskMode::Auto => v8::MicrotasksPolicy::Auto,
        }
    }
}

pub trait MicrotaskPolicy: Send + Sync {
    fn mode(&self) -> MicrotaskMode;
}

#[derive(Debug, Default)]
pub struct DefaultMicrotaskPolicy(pub MicrotaskMode);

impl MicrotaskPolicy for DefaultMicrotaskPolicy {
    fn mode(&self) -> MicrotaskMode {
        self.0
    }
}

/// Gate for `WebAssembly.compile` and friends.
pub trait WasmCodegenPolicy: Send + Sync {
    /// `context_flag` is the per-context setting, `None` when never set.
    fn allow(&self, context_flag: Option<bool>) -> bool;
}

/// Follow the context flag, allowing when it is unset.
#[derive(Debug, Default)]
pub struct ContextFlagWasmGate;

impl WasmCodegenPolicy for ContextFlagWasmGate {
    fn allow(&self, context_flag: Option<bool>) -> bool {
        context_flag.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionEvent {
    /// Rejected with no handler attached.
    Unhandled,
    /// A handler was attached after the rejection was reported.
    HandlerAdded,
    RejectAfterResolved,
    ResolveAfterResolved,
}

/// Promises rejected without a handler, per environment.
///
/// Entries are matched by promise identity, not by hash.
#[derive(Default)]
pub struct RejectionTracker {
    pending: RefCell<Vec<(v8::Global<v8::Promise>, String)>>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejected(&self, promise: v8::Global<v8::Promise>, reason: String) {
        self.pending.borrow_mut().push((promise, reason));
    }

    pub fn handled(&self, promise: &v8::Global<v8::Promise>) {
        self.pending.borrow_mut().retain(|(pending, _)| pending != promise);
    }

    pub fn len(&self) -> usize {
        self.pending.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.borrow().is_empty()
    }

    /// Drain the reasons of every still-unhandled rejection, oldest first.
    pub fn take_unhandled(&self) -> Vec<String> {
        self.pending.borrow_mut().drain(..).map(|(_, reason)| reason).collect()
    }

    /// Forget every pending rejection without reporting it.
    pub(crate) fn clear(&self) {
        self.pending.borrow_mut().clear();
    }
}

impl fmt::Debug for RejectionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RejectionTracker").field("pending", &self.len()).finish()
    }
}

pub trait PromiseRejectPolicy: Send + Sync {
    /// `tracker` is `None` when no environment is bound to the current context.
    fn on_rejection(
        &self,
        event: RejectionEvent,
        promise: v8::Global<v8::Promise>,
        reason: Option<String>,
        tracker: Option<&RejectionTracker>,
    );
}

/// Track unhandled rejections on the environment.
#[derive(Debug, Default)]
pub struct TrackingRejectPolicy;

impl PromiseRejectPolicy for TrackingRejectPolicy {
    fn on_rejection(
        &self,
        event: RejectionEvent,
        promise: v8::Global<v8::Promise>,
        reason: Option<String>,
        tracker: Option<&RejectionTracker>,
    ) {
        let Some(tracker) = tracker else {
            tracing::trace!("Promise rejection ({event:?}) outside of an environment");
            return;
        };

        match event {
            RejectionEvent::Unhandled => tracker.rejected(promise, reason.unwrap_or_else(|| "undefined".to_string())),
            RejectionEvent::HandlerAdded => tracker.handled(&promise),
            RejectionEvent::RejectAfterResolved | RejectionEvent::ResolveAfterResolved => {
                tracing::debug!("Promise settled more than once ({event:?})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> AbortContext {
        AbortContext {
            enabled: true,
            is_main_thread: false,
            is_stopping: false,
            toggle: true,
            suppressed: false,
        }
    }

    #[test]
    fn test_default_abort_predicate() {
        assert!(default_should_abort(&ctx()));

        assert!(!default_should_abort(&AbortContext { enabled: false, ..ctx() }));
        assert!(!default_should_abort(&AbortContext { toggle: false, ..ctx() }));
        assert!(!default_should_abort(&AbortContext { suppressed: true, ..ctx() }));

        // A stopping worker does not abort, a stopping main thread does
        assert!(!default_should_abort(&AbortContext { is_stopping: true, ..ctx() }));
        assert!(default_should_abort(&AbortContext {
            is_stopping: true,
            is_main_thread: true,
            ..ctx()
        }));
    }

    #[test]
    fn test_wasm_gate_defaults_to_allow() {
        let gate = ContextFlagWasmGate;
        assert!(gate.allow(None));
        assert!(gate.allow(Some(true)));
        assert!(!gate.allow(Some(false)));
    }

    #[test]
    fn test_reported_message_display() {
        let message = ReportedMessage {
            text: "Uncaught Error: x".into(),
            resource: Some("main.js".into()),
            line: Some(3),
        };
        assert_eq!(message.to_string(), "Uncaught Error: x (main.js:3)");
    }
}
