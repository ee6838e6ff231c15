//! The timer queue behind `setTimeout` and `setInterval`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Delays are clamped to at least this, so intervals cannot starve the loop.
const MIN_DELAY: Duration = Duration::from_millis(1);

/// Delays above this behave as [`MIN_DELAY`] (`2^31 - 1` ms).
const MAX_DELAY: Duration = Duration::from_millis(i32::MAX as u64);

struct Timer<T> {
    deadline: Instant,
    seq: u64,
    interval: Option<Duration>,
    callback: T,
}

pub(crate) struct TimerQueue<T> {
    next_id: u32,
    next_seq: u64,
    timers: HashMap<u32, Timer<T>>,
}

impl<T: Clone> TimerQueue<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: 1,
            next_seq: 0,
            timers: HashMap::new(),
        }
    }

    pub(crate) fn schedule(&mut self, now: Instant, delay: Duration, repeat: bool, callback: T) -> u32 {
        let delay = clamp_delay(delay);

        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let seq = self.bump_seq();
        self.timers.insert(
            id,
            Timer {
                deadline: now + delay,
                seq,
                interval: repeat.then_some(delay),
                callback,
            },
        );

        id
    }

    pub(crate) fn clear(&mut self, id: u32) -> bool {
        self.timers.remove(&id).is_some()
    }

    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|t| t.deadline).min()
    }

    /// Remove (or re-arm, for intervals) the earliest timer due at `now`.
    ///
    /// Ties run in scheduling order.
    pub(crate) fn pop_expired(&mut self, now: Instant) -> Option<(u32, T)> {
        let id = self
            .timers
            .iter()
            .filter(|(_, t)| t.deadline <= now)
            .min_by_key(|(_, t)| (t.deadline, t.seq))
            .map(|(&id, _)| id)?;

        let seq = self.bump_seq();
        let timer = self.timers.get_mut(&id)?;

        match timer.interval {
            Some(interval) => {
                timer.deadline = now + interval;
                timer.seq = seq;
                Some((id, timer.callback.clone()))
            }
            None => self.timers.remove(&id).map(|t| (id, t.callback)),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }

    pub(crate) fn clear_all(&mut self) {
        self.timers.clear();
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }
}

fn clamp_delay(delay: Duration) -> Duration {
    if delay > MAX_DELAY { MIN_DELAY } else { delay.max(MIN_DELAY) }
}

/// Convert a JS millisecond delay, treating NaN and negatives as zero.
///
/// Values too large for a `Duration` map past [`MAX_DELAY`].
pub(crate) fn delay_from_millis(ms: f64) -> Duration {
    if ms.is_nan() || ms <= 0.0 {
        return Duration::ZERO;
    }

    Duration::try_from_secs_f64(ms / 1000.0).unwrap_or(MAX_DELAY + MIN_DELAY)
}
