//! Timers backing the reconnect, rejoin, and heartbeat machinery.
//!
//! [`TimeoutTimer`] is a one-shot timer with an attempt counter: each
//! `schedule_timeout` asks the injected backoff calculation for a delay based
//! on the attempt number, so callers get exponential behavior by
//! rescheduling from their own callback. [`HeartbeatTimer`] is a repeating
//! timer running on its own spawned task, so liveness probes keep firing even
//! when the connection task is busy.
//!
//! Both timers spawn onto the ambient Tokio runtime and must be driven from
//! within one.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;

use crate::sync::lock;

/// Computes the delay before attempt `n` (1-based at call time).
pub type BackoffCalc = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Stepped backoff used between reconnect attempts of a socket.
///
/// `[10, 10, 50, 100, 150, 200, 250, 500, 1000, 2000]` milliseconds, then a
/// flat 5 seconds.
pub fn reconnect_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 10] = [10, 10, 50, 100, 150, 200, 250, 500, 1000, 2000];
    STEPS_MS
        .get(tries as usize)
        .copied()
        .map_or(Duration::from_secs(5), Duration::from_millis)
}

/// Stepped backoff used between rejoin attempts of a channel.
///
/// `[1, 1, 2, 5]` seconds, then a flat 10 seconds.
pub fn rejoin_after(tries: u32) -> Duration {
    const STEPS_MS: [u64; 4] = [1000, 1000, 2000, 5000];
    STEPS_MS
        .get(tries as usize)
        .copied()
        .map_or(Duration::from_secs(10), Duration::from_millis)
}

// ── TimeoutTimer ────────────────────────────────────────────────────

struct TimeoutTimerInner {
    callback: Box<dyn Fn() + Send + Sync>,
    timer_calc: BackoffCalc,
    tries: AtomicU32,
    pending: Mutex<Option<AbortHandle>>,
}

/// A one-shot timer with an attempt counter.
///
/// Firing never auto-reschedules; the callback may call
/// [`schedule_timeout`](TimeoutTimer::schedule_timeout) again for exponential
/// behavior. Dropping the timer aborts any pending fire.
pub struct TimeoutTimer {
    inner: Arc<TimeoutTimerInner>,
}

impl TimeoutTimer {
    /// Create a timer with a backoff calculation and a fire callback.
    pub fn new(timer_calc: BackoffCalc, callback: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            inner: Arc::new(TimeoutTimerInner {
                callback: Box::new(callback),
                timer_calc,
                tries: AtomicU32::new(0),
                pending: Mutex::new(None),
            }),
        }
    }

    /// Cancel any pending fire and schedule the next one.
    ///
    /// The delay is `timer_calc(tries + 1)`; the attempt counter is then
    /// incremented.
    pub fn schedule_timeout(&self) {
        let mut pending = lock(&self.inner.pending);
        if let Some(task) = pending.take() {
            task.abort();
        }
        let tries = self.inner.tries.fetch_add(1, Ordering::SeqCst);
        let delay = (self.inner.timer_calc)(tries + 1);
        let weak: Weak<TimeoutTimerInner> = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                (inner.callback)();
            }
        });
        *pending = Some(task.abort_handle());
    }

    /// Cancel any pending fire and zero the attempt counter.
    pub fn reset(&self) {
        if let Some(task) = lock(&self.inner.pending).take() {
            task.abort();
        }
        self.inner.tries.store(0, Ordering::SeqCst);
    }

    /// The number of attempts scheduled since the last reset.
    pub fn tries(&self) -> u32 {
        self.inner.tries.load(Ordering::SeqCst)
    }
}

impl Drop for TimeoutTimer {
    fn drop(&mut self) {
        if let Some(task) = lock(&self.inner.pending).take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for TimeoutTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutTimer")
            .field("tries", &self.tries())
            .finish()
    }
}

// ── HeartbeatTimer ──────────────────────────────────────────────────

static NEXT_HEARTBEAT_ID: AtomicU64 = AtomicU64::new(0);

struct HeartbeatState {
    handler: Arc<dyn Fn() + Send + Sync>,
    task: AbortHandle,
}

/// A repeating timer on a dedicated task.
///
/// The first tick fires one full interval after [`start`](Self::start);
/// missed ticks are delivered late rather than bursted, so delivery jitter
/// under load is tolerated.
pub struct HeartbeatTimer {
    id: u64,
    interval: Duration,
    state: Mutex<Option<HeartbeatState>>,
}

impl HeartbeatTimer {
    /// Create a stopped timer with the given repeat interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            id: NEXT_HEARTBEAT_ID.fetch_add(1, Ordering::Relaxed),
            interval,
            state: Mutex::new(None),
        }
    }

    /// Start firing `handler` every interval, replacing any previous handler.
    pub fn start(&self, handler: impl Fn() + Send + Sync + 'static) {
        let handler: Arc<dyn Fn() + Send + Sync> = Arc::new(handler);
        let mut state = lock(&self.state);
        if let Some(prev) = state.take() {
            prev.task.abort();
        }
        let tick_handler = Arc::clone(&handler);
        let interval = self.interval;
        let task = tokio::spawn(async move {
            let first = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(first, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick_handler();
            }
        });
        *state = Some(HeartbeatState {
            handler,
            task: task.abort_handle(),
        });
    }

    /// Stop the timer. A stopped timer can be started again.
    pub fn stop(&self) {
        if let Some(state) = lock(&self.state).take() {
            state.task.abort();
        }
    }

    /// Whether the timer is currently running.
    pub fn is_valid(&self) -> bool {
        lock(&self.state).is_some()
    }

    /// Invoke the handler directly, outside the schedule. Used by tests.
    pub fn fire(&self) {
        let handler = lock(&self.state).as_ref().map(|s| Arc::clone(&s.handler));
        if let Some(handler) = handler {
            handler();
        }
    }
}

impl PartialEq for HeartbeatTimer {
    /// Two timers compare equal iff they are the same instance.
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for HeartbeatTimer {}

impl Drop for HeartbeatTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for HeartbeatTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeartbeatTimer")
            .field("id", &self.id)
            .field("interval", &self.interval)
            .field("is_valid", &self.is_valid())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn reconnect_backoff_steps_then_saturates() {
        let expected_ms = [10, 10, 50, 100, 150, 200, 250, 500, 1000, 2000];
        for (n, ms) in expected_ms.iter().enumerate() {
            assert_eq!(reconnect_after(n as u32), Duration::from_millis(*ms));
        }
        assert_eq!(reconnect_after(10), Duration::from_secs(5));
        assert_eq!(reconnect_after(1000), Duration::from_secs(5));
    }

    #[test]
    fn rejoin_backoff_steps_then_saturates() {
        let expected_secs = [1, 1, 2, 5];
        for (n, secs) in expected_secs.iter().enumerate() {
            assert_eq!(rejoin_after(n as u32), Duration::from_secs(*secs));
        }
        assert_eq!(rejoin_after(4), Duration::from_secs(10));
        assert_eq!(rejoin_after(99), Duration::from_secs(10));
    }

    #[tokio::test]
    async fn schedule_fires_once_and_does_not_reschedule() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = TimeoutTimer::new(
            Arc::new(|_| Duration::from_millis(5)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.tries(), 1);
    }

    #[tokio::test]
    async fn reschedule_cancels_the_pending_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = TimeoutTimer::new(
            Arc::new(|_| Duration::from_millis(20)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        timer.schedule_timeout();
        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(80)).await;
        // Only the second schedule fired, but both counted as attempts.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.tries(), 2);
    }

    #[tokio::test]
    async fn reset_cancels_and_zeroes_the_attempt_counter() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = TimeoutTimer::new(
            Arc::new(|_| Duration::from_millis(10)),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        );

        timer.schedule_timeout();
        timer.reset();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(timer.tries(), 0);
    }

    #[tokio::test]
    async fn backoff_calc_sees_increasing_attempt_numbers() {
        let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&seen);
        let timer = TimeoutTimer::new(
            Arc::new(move |n| {
                lock(&record).push(n);
                Duration::from_millis(1)
            }),
            || {},
        );

        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(10)).await;
        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(10)).await;
        timer.schedule_timeout();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*lock(&seen), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn heartbeat_fires_repeatedly_until_stopped() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = HeartbeatTimer::new(Duration::from_millis(5));
        timer.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timer.is_valid());

        tokio::time::sleep(Duration::from_millis(60)).await;
        timer.stop();
        assert!(!timer.is_valid());

        let count = fired.load(Ordering::SeqCst);
        assert!(count >= 2, "expected repeated fires, got {count}");

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), count);
    }

    #[tokio::test]
    async fn heartbeat_fire_invokes_the_handler_directly() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let timer = HeartbeatTimer::new(Duration::from_secs(3600));
        timer.start(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        timer.fire();
        timer.fire();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn heartbeat_equality_is_instance_identity() {
        let a = HeartbeatTimer::new(Duration::from_secs(1));
        let b = HeartbeatTimer::new(Duration::from_secs(1));
        assert_eq!(a, a);
        assert_ne!(a, b);
    }
}
