//! Worker isolates owned by an environment.

use std::thread::JoinHandle;

use crate::event_loop::ThreadStopper;
use crate::thread_id::ThreadId;

/// A worker running its own isolate on another thread.
///
/// Stopping sets the worker's stop flag, terminates its script execution and
/// joins the thread.
pub struct SubWorkerHandle {
    thread_id: ThreadId,
    stopper: ThreadStopper,
    isolate: v8::IsolateHandle,
    thread: Option<JoinHandle<()>>,
}

impl SubWorkerHandle {
    pub fn new(
        thread_id: ThreadId,
        stopper: ThreadStopper,
        isolate: v8::IsolateHandle,
        thread: JoinHandle<()>,
    ) -> Self {
        Self {
            thread_id,
            stopper,
            isolate,
            thread: Some(thread),
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().is_none_or(|t| t.is_finished())
    }

    pub fn stop(&mut self) {
        self.stopper.set_stopped(true);
        self.isolate.terminate_execution();

        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::warn!("Sub-worker {} panicked", self.thread_id);
        }

        tracing::debug!("Stopped sub-worker {}", self.thread_id);
    }
}

impl std::fmt::Debug for SubWorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubWorkerHandle")
            .field("thread_id", &self.thread_id)
            .field("stopped", &self.stopper.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Drop for SubWorkerHandle {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}
