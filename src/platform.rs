//! Global V8 initialization and the multi-isolate platform registry.
//!
//! V8 can only be initialized once per process. [`Platform::new`] does that on
//! first use and then tracks every isolate created on top of it: which event
//! loop it belongs to, its thread-safe handle, and tasks posted to it from
//! other threads. Isolates must be registered *before* the V8 isolate is
//! created and unregistered after it is disposed.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use crate::config::ProcessOptions;
use crate::error::{EnvironmentError, Result};
use crate::event_loop::LoopId;

static V8_PLATFORM: OnceLock<v8::SharedRef<v8::Platform>> = OnceLock::new();

/// Get the global V8 platform, initializing V8 if necessary.
///
/// Flags and the thread pool size only take effect on the first call.
pub fn get_platform(options: &ProcessOptions) -> &'static v8::SharedRef<v8::Platform> {
    V8_PLATFORM.get_or_init(|| {
        // Flags must be set before initialization
        for flag in &options.v8_flags {
            v8::V8::set_flags_from_string(flag);
        }

        // On macOS, use single-threaded GC to avoid code collection issues
        #[cfg(target_os = "macos")]
        v8::V8::set_flags_from_string("--single-threaded-gc");

        tracing::debug!(
            "Initializing V8 platform (thread pool: {}, flags: {:?})",
            options.thread_pool_size,
            options.v8_flags
        );

        let platform = v8::new_default_platform(options.thread_pool_size, false).make_shared();
        v8::V8::initialize_platform(platform.clone());
        v8::V8::initialize();
        platform
    })
}

/// Identifies an isolate in the platform registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolateId(u64);

impl IsolateId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Work posted to an isolate from any thread, run on the isolate's thread.
pub type PlatformTask = Box<dyn FnOnce() + Send + 'static>;

struct IsolateRecord {
    loop_id: LoopId,
    handle: Option<v8::IsolateHandle>,
    tasks: VecDeque<PlatformTask>,
}

pub struct Platform {
    v8: &'static v8::SharedRef<v8::Platform>,
    isolates: Mutex<HashMap<IsolateId, IsolateRecord>>,
    next_isolate_id: AtomicU64,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Platform")
            .field("isolates", &self.isolates().len())
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

impl Platform {
    /// Create the platform, initializing V8 on first use.
    pub fn new(options: &ProcessOptions) -> Arc<Self> {
        Arc::new(Self {
            v8: get_platform(options),
            isolates: Mutex::new(HashMap::new()),
            next_isolate_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn v8_platform(&self) -> &'static v8::SharedRef<v8::Platform> {
        self.v8
    }

    fn isolates(&self) -> MutexGuard<'_, HashMap<IsolateId, IsolateRecord>> {
        self.isolates.lock().expect("platform isolate registry poisoned")
    }

    /// Reserve a registry entry for an isolate that is about to be created.
    ///
    /// The returned registration unregisters itself when dropped.
    pub fn register_isolate(self: &Arc<Self>, loop_id: LoopId) -> Result<IsolateRegistration> {
        if self.is_shut_down() {
            return Err(EnvironmentError::PlatformShutDown);
        }

        let id = IsolateId(self.next_isolate_id.fetch_add(1, Ordering::Relaxed));

        self.isolates().insert(
            id,
            IsolateRecord {
                loop_id,
                handle: None,
                tasks: VecDeque::new(),
            },
        );

        tracing::trace!("Registered isolate {} on loop {}", id.0, loop_id.as_u64());

        Ok(IsolateRegistration {
            platform: Arc::clone(self),
            id,
        })
    }

    fn unregister_isolate(&self, id: IsolateId) {
        let record = self.isolates().remove(&id);

        if let Some(record) = record
            && !record.tasks.is_empty()
        {
            tracing::warn!(
                "Isolate {} unregistered with {} pending tasks (dropped)",
                id.0,
                record.tasks.len()
            );
        }
    }

    pub fn is_registered(&self, id: IsolateId) -> bool {
        self.isolates().contains_key(&id)
    }

    pub fn isolate_count(&self) -> usize {
        self.isolates().len()
    }

    pub fn loop_of(&self, id: IsolateId) -> Option<LoopId> {
        self.isolates().get(&id).map(|r| r.loop_id)
    }

    /// Post a task to run on the isolate's thread during the next drain.
    ///
    /// Returns `false` (and drops the task) if the isolate is gone.
    pub fn post_task(&self, id: IsolateId, task: PlatformTask) -> bool {
        match self.isolates().get_mut(&id) {
            Some(record) => {
                record.tasks.push_back(task);
                true
            }
            None => {
                tracing::trace!("Dropping task posted to unregistered isolate {}", id.0);
                false
            }
        }
    }

    pub fn has_pending_tasks(&self, id: IsolateId) -> bool {
        self.isolates().get(&id).is_some_and(|r| !r.tasks.is_empty())
    }

    /// Terminate script execution on a registered isolate from any thread.
    pub fn terminate_isolate(&self, id: IsolateId) -> bool {
        self.isolates()
            .get(&id)
            .and_then(|r| r.handle.as_ref())
            .is_some_and(|h| h.terminate_execution())
    }

    /// Run everything scheduled for `isolate` until nothing is left.
    ///
    /// Covers V8's foreground tasks (including FinalizationRegistry cleanup)
    /// and tasks posted through [`post_task`](Self::post_task). Must be called
    /// on the isolate's thread.
    pub fn drain_tasks(&self, isolate: &mut v8::Isolate, id: IsolateId) {
        loop {
            let mut ran = false;

            while v8::Platform::pump_message_loop(self.v8, isolate, false) {
                ran = true;
            }

            // Take the queue; never run tasks while holding the registry lock
            let tasks: Vec<PlatformTask> = match self.isolates().get_mut(&id) {
                Some(record) => record.tasks.drain(..).collect(),
                None => Vec::new(),
            };

            if tasks.is_empty() && !ran {
                break;
            }

            for task in tasks {
                task();
            }
        }
    }

    /// Refuse further isolate registrations.
    ///
    /// V8 itself stays initialized for the life of the process.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let remaining = self.isolate_count();

        if remaining > 0 {
            tracing::warn!("Platform shut down with {remaining} isolates still registered");
        } else {
            tracing::debug!("Platform shut down");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// A platform registry entry owned by one isolate.
#[derive(Debug)]
pub struct IsolateRegistration {
    platform: Arc<Platform>,
    id: IsolateId,
}

impl IsolateRegistration {
    pub fn id(&self) -> IsolateId {
        self.id
    }

    pub fn platform(&self) -> &Arc<Platform> {
        &self.platform
    }

    /// Attach the thread-safe handle once the V8 isolate exists.
    pub fn bind(&self, handle: v8::IsolateHandle) {
        if let Some(record) = self.platform.isolates().get_mut(&self.id) {
            record.handle = Some(handle);
        }
    }
}

impl Drop for IsolateRegistration {
    fn drop(&mut self) {
        self.platform.unregister_isolate(self.id);
        tracing::trace!("Unregistered isolate {}", self.id.0);
    }
}
