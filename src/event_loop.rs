//! Event loop integration for environments.
//!
//! Each isolate is associated with exactly one [`EventLoop`]. The loop owns a
//! single-threaded tokio runtime used only for waiting (timers, stop
//! requests); the actual work is done by an [`EventLoopRuntime`]
//! implementation on the environment's thread. The core logic is:
//!
//! 1. Pump platform tasks + microtask checkpoint
//! 2. Run expired timers
//! 3. Sleep until the next timer deadline or a stop request
//! 4. Return once nothing is scheduled

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::Notify;

use crate::error::Result;

static NEXT_LOOP_ID: AtomicU64 = AtomicU64::new(1);

/// Identifies an event loop in the platform's isolate registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopId(u64);

impl LoopId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

/// Advisory stop signal shared between an environment and whoever wants it to stop.
///
/// Cloning shares the flag. Setting it wakes an event loop that is waiting
/// for its next timer.
#[derive(Debug, Clone, Default)]
pub struct ThreadStopper {
    inner: Arc<StopperInner>,
}

#[derive(Debug, Default)]
struct StopperInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl ThreadStopper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_stopped(&self, stopped: bool) {
        self.inner.stopped.store(stopped, Ordering::SeqCst);

        if stopped {
            self.inner.notify.notify_one();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

/// Work driven by [`EventLoop::spin`].
pub trait EventLoopRuntime {
    /// Stop signal polled between units of work.
    fn stopper(&self) -> &ThreadStopper;

    /// Run pending platform tasks and a microtask checkpoint.
    fn pump_and_checkpoint(&mut self) -> Result<()>;

    /// Fire every timer due at `now`. Returns how many ran.
    fn run_expired_timers(&mut self, now: Instant) -> Result<usize>;

    /// Earliest pending timer, if any.
    fn next_timer_deadline(&self) -> Option<Instant>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinOutcome {
    /// No more work was scheduled.
    Idle,
    /// The stop flag was observed.
    Stopped,
}

#[derive(Debug)]
pub struct EventLoop {
    id: LoopId,
    runtime: tokio::runtime::Runtime,
    started: Instant,
}

impl EventLoop {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;

        let id = LoopId(NEXT_LOOP_ID.fetch_add(1, Ordering::Relaxed));
        tracing::trace!("Created event loop {}", id.0);

        Ok(Self {
            id,
            runtime,
            started: Instant::now(),
        })
    }

    pub fn id(&self) -> LoopId {
        self.id
    }

    /// Milliseconds since the loop was created.
    pub fn now_ms(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * 1000.0
    }

    /// Block until `deadline` or until `stopper` is set, whichever comes first.
    pub fn wait_until(&self, deadline: Instant, stopper: &ThreadStopper) {
        if stopper.is_stopped() || deadline <= Instant::now() {
            return;
        }

        let notify = &stopper.inner.notify;

        self.runtime.block_on(async {
            let _ = tokio::time::timeout_at(deadline.into(), notify.notified()).await;
        });
    }

    /// Run until no further work is scheduled or the stop flag is set.
    pub fn spin<R: EventLoopRuntime>(&self, runtime: &mut R) -> Result<SpinOutcome> {
        loop {
            if runtime.stopper().is_stopped() {
                return Ok(SpinOutcome::Stopped);
            }

            runtime.pump_and_checkpoint()?;

            if runtime.run_expired_timers(Instant::now())? > 0 {
                // Timers may have queued microtasks or more timers
                continue;
            }

            let Some(deadline) = runtime.next_timer_deadline() else {
                return Ok(if runtime.stopper().is_stopped() {
                    SpinOutcome::Stopped
                } else {
                    SpinOutcome::Idle
                });
            };

            self.wait_until(deadline, runtime.stopper());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct FakeRuntime {
        stopper: ThreadStopper,
        timers: Vec<Instant>,
        fired: usize,
        pumps: usize,
        stop_after: Option<usize>,
    }

    impl FakeRuntime {
        fn new(timers: Vec<Instant>) -> Self {
            Self {
                stopper: ThreadStopper::new(),
                timers,
                fired: 0,
                pumps: 0,
                stop_after: None,
            }
        }
    }

    impl EventLoopRuntime for FakeRuntime {
        fn stopper(&self) -> &ThreadStopper {
            &self.stopper
        }

        fn pump_and_checkpoint(&mut self) -> Result<()> {
            self.pumps += 1;
            Ok(())
        }

        fn run_expired_timers(&mut self, now: Instant) -> Result<usize> {
            let before = self.timers.len();
            self.timers.retain(|t| *t > now);
            let fired = before - self.timers.len();
            self.fired += fired;

            if self.stop_after.is_some_and(|n| self.fired >= n) {
                self.stopper.set_stopped(true);
            }

            Ok(fired)
        }

        fn next_timer_deadline(&self) -> Option<Instant> {
            self.timers.iter().min().copied()
        }
    }

    #[test]
    fn test_idle_without_work() {
        let event_loop = EventLoop::new().unwrap();
        let mut runtime = FakeRuntime::new(vec![]);

        assert_eq!(event_loop.spin(&mut runtime).unwrap(), SpinOutcome::Idle);
        assert_eq!(runtime.pumps, 1);
    }

    #[test]
    fn test_runs_timers_in_order_until_idle() {
        let event_loop = EventLoop::new().unwrap();
        let now = Instant::now();
        let mut runtime = FakeRuntime::new(vec![
            now + Duration::from_millis(20),
            now + Duration::from_millis(5),
        ]);

        assert_eq!(event_loop.spin(&mut runtime).unwrap(), SpinOutcome::Idle);
        assert_eq!(runtime.fired, 2);
        assert!(now.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_stop_flag_ends_spin() {
        let event_loop = EventLoop::new().unwrap();
        let now = Instant::now();
        let mut runtime = FakeRuntime::new(vec![now, now + Duration::from_secs(60)]);
        runtime.stop_after = Some(1);

        assert_eq!(event_loop.spin(&mut runtime).unwrap(), SpinOutcome::Stopped);
        assert_eq!(runtime.fired, 1);
    }

    #[test]
    fn test_stop_wakes_waiting_loop() {
        let event_loop = EventLoop::new().unwrap();
        let stopper = ThreadStopper::new();
        let remote = stopper.clone();

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            remote.set_stopped(true);
        });

        let start = Instant::now();
        event_loop.wait_until(start + Duration::from_secs(30), &stopper);

        assert!(stopper.is_stopped());
        assert!(start.elapsed() < Duration::from_secs(10));
        handle.join().unwrap();
    }

    #[test]
    fn test_loop_ids_are_distinct() {
        let a = EventLoop::new().unwrap();
        let b = EventLoop::new().unwrap();
        assert_ne!(a.id(), b.id());
    }
}
