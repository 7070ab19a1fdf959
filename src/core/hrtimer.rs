//! High-resolution timer.
//!
//! Each [`HrTimer`] owns a timer thread that sleeps on a `parking_lot`
//! `Condvar` until the expiry instant, then runs the callback. The callback
//! decides whether the timer is re-armed by returning [`HrTimerRestart`] and
//! may move its own expiry forward with [`TimerFiring::forward_now`], which
//! keeps periodic timers drift free.
//!
//! When the timer is bound to a [`SoftirqDispatcher`] the callback runs inside
//! an [`IrqGuard`](crate::core::tasklet::IrqGuard): tasklets scheduled from the
//! callback are only dispatched once the callback has returned.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, error, trace};

use crate::core::error::DeferredError;
use crate::core::tasklet::SoftirqDispatcher;
use crate::util::clock::{clock_origin, instant_to_ms};

/// Return value of a timer callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrTimerRestart {
    /// Do not re-arm.
    NoRestart,
    /// Re-arm at the (possibly forwarded) expiry.
    Restart,
}

/// How a start delay is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrTimerMode {
    /// Relative to now.
    Relative,
    /// Absolute, measured from the monotonic clock origin.
    Absolute,
}

/// Context handed to a timer callback.
#[derive(Debug)]
pub struct TimerFiring {
    expires: Instant,
    now: Instant,
}

impl TimerFiring {
    /// The instant the callback started.
    pub const fn now(&self) -> Instant {
        self.now
    }

    /// Callback start time on the monotonic clock, in milliseconds.
    pub fn now_ms(&self) -> u64 {
        instant_to_ms(self.now)
    }

    /// Current expiry. After [`forward_now`](Self::forward_now) this is the
    /// next expiry.
    pub const fn expires(&self) -> Instant {
        self.expires
    }

    /// Advance the expiry by whole intervals until it lies after the callback
    /// start time. Returns the number of intervals added (the overrun count),
    /// or 0 when the expiry is already in the future.
    pub fn forward_now(&mut self, interval: Duration) -> u64 {
        if self.now < self.expires || interval.is_zero() {
            return 0;
        }
        let delta = self.now.duration_since(self.expires).as_nanos();
        let step = interval.as_nanos();
        let overruns = delta / step + 1;
        let advance = u64::try_from(step.saturating_mul(overruns)).unwrap_or(u64::MAX);
        self.expires += Duration::from_nanos(advance);
        u64::try_from(overruns).unwrap_or(u64::MAX)
    }
}

type TimerCallback = Box<dyn FnMut(&mut TimerFiring) -> HrTimerRestart + Send + 'static>;

#[derive(Debug, Default)]
struct TimerState {
    expires: Option<Instant>,
    running: bool,
    /// Bumped by `cancel` so a callback in flight can not re-arm.
    cancel_gen: u64,
    shutdown: bool,
}

#[derive(Debug)]
struct TimerShared {
    name: String,
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// A one-shot or self-restarting timer driven by its own thread.
pub struct HrTimer {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HrTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HrTimer")
            .field("name", &self.shared.name)
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

impl HrTimer {
    /// Create an unarmed timer whose callback runs on a plain timer thread.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the timer thread can not start.
    pub fn new<F>(name: impl Into<String>, callback: F) -> Result<Self, DeferredError>
    where
        F: FnMut(&mut TimerFiring) -> HrTimerRestart + Send + 'static,
    {
        Self::spawn(name.into(), None, Box::new(callback))
    }

    /// Create an unarmed timer whose callback runs in interrupt context of
    /// `softirq`: tasklets it schedules are held back until it returns.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the timer thread can not start.
    pub fn with_softirq<F>(
        name: impl Into<String>,
        softirq: SoftirqDispatcher,
        callback: F,
    ) -> Result<Self, DeferredError>
    where
        F: FnMut(&mut TimerFiring) -> HrTimerRestart + Send + 'static,
    {
        Self::spawn(name.into(), Some(softirq), Box::new(callback))
    }

    fn spawn(
        name: String,
        softirq: Option<SoftirqDispatcher>,
        callback: TimerCallback,
    ) -> Result<Self, DeferredError> {
        let shared = Arc::new(TimerShared {
            name: name.clone(),
            state: Mutex::new(TimerState::default()),
            cond: Condvar::new(),
        });
        let thread_name = format!("hrtimer/{name}");
        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || timer_thread(&shared, softirq.as_ref(), callback)
            })
            .map_err(|source| DeferredError::ThreadSpawn {
                name: thread_name,
                source,
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Timer name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Arm (or re-arm) the timer.
    pub fn start(&self, delay: Duration, mode: HrTimerMode) {
        let expires = match mode {
            HrTimerMode::Relative => Instant::now() + delay,
            HrTimerMode::Absolute => clock_origin() + delay,
        };
        let mut state = self.shared.state.lock();
        state.expires = Some(expires);
        self.shared.cond.notify_all();
        debug!(
            timer = %self.shared.name,
            expires_ms = instant_to_ms(expires),
            "hrtimer armed"
        );
    }

    /// Whether the timer is queued or its callback is running.
    pub fn is_active(&self) -> bool {
        let state = self.shared.state.lock();
        state.expires.is_some() || state.running
    }

    /// Cancel the timer and wait for a running callback to finish.
    ///
    /// Returns `true` if the timer was queued or running. A callback that is
    /// in flight can not re-arm the timer once `cancel` has been called.
    /// Calling this from the timer's own callback deadlocks.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock();
        let was_active = state.expires.is_some() || state.running;
        state.expires = None;
        state.cancel_gen = state.cancel_gen.wrapping_add(1);
        self.shared.cond.notify_all();
        while state.running {
            self.shared.cond.wait(&mut state);
        }
        debug!(timer = %self.shared.name, was_active, "hrtimer cancelled");
        was_active
    }
}

impl Drop for HrTimer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.expires = None;
            self.shared.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn timer_thread(shared: &TimerShared, softirq: Option<&SoftirqDispatcher>, mut callback: TimerCallback) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(expires) = state.expires else {
            shared.cond.wait(&mut state);
            continue;
        };
        if Instant::now() < expires {
            let _ = shared.cond.wait_until(&mut state, expires);
            continue;
        }

        state.expires = None;
        state.running = true;
        let generation = state.cancel_gen;

        let (restart, next) = MutexGuard::unlocked(&mut state, || {
            let mut firing = TimerFiring {
                expires,
                now: Instant::now(),
            };
            trace!(timer = %shared.name, now_ms = firing.now_ms(), "hrtimer expired");
            let irq = softirq.map(SoftirqDispatcher::irq_enter);
            let restart = catch_unwind(AssertUnwindSafe(|| callback(&mut firing)))
                .unwrap_or_else(|_| {
                    error!(timer = %shared.name, "hrtimer callback panicked");
                    HrTimerRestart::NoRestart
                });
            drop(irq);
            (restart, firing.expires)
        });

        state.running = false;
        let cancelled = state.cancel_gen != generation || state.shutdown;
        if restart == HrTimerRestart::Restart && !cancelled && state.expires.is_none() {
            state.expires = Some(next);
        }
        shared.cond.notify_all();
    }
    trace!(timer = %shared.name, "hrtimer thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn firing_at(expires: Instant, now: Instant) -> TimerFiring {
        TimerFiring { expires, now }
    }

    #[test]
    fn test_forward_now_single_interval() {
        let base = Instant::now();
        let mut firing = firing_at(base, base + Duration::from_millis(3));
        let overruns = firing.forward_now(Duration::from_millis(10));
        assert_eq!(overruns, 1);
        assert_eq!(firing.expires(), base + Duration::from_millis(10));
    }

    #[test]
    fn test_forward_now_skips_missed_intervals() {
        let base = Instant::now();
        let mut firing = firing_at(base, base + Duration::from_millis(25));
        assert_eq!(firing.forward_now(Duration::from_millis(10)), 3);
        assert_eq!(firing.expires(), base + Duration::from_millis(30));
    }

    #[test]
    fn test_forward_now_exact_multiple_moves_past_now() {
        let base = Instant::now();
        let mut firing = firing_at(base, base + Duration::from_millis(10));
        assert_eq!(firing.forward_now(Duration::from_millis(10)), 2);
        assert!(firing.expires() > firing.now());
    }

    #[test]
    fn test_forward_now_future_expiry_untouched() {
        let base = Instant::now();
        let mut firing = firing_at(base + Duration::from_millis(5), base);
        assert_eq!(firing.forward_now(Duration::from_millis(10)), 0);
        assert_eq!(firing.expires(), base + Duration::from_millis(5));
    }

    #[test]
    fn test_one_shot_fires_once() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = HrTimer::new("one-shot", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            HrTimerRestart::NoRestart
        })
        .unwrap();

        timer.start(Duration::from_millis(5), HrTimerMode::Relative);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_active());
        assert!(!timer.cancel());
    }

    #[test]
    fn test_panicking_callback_does_not_wedge_cancel() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = HrTimer::new("panics-once", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("callback failure");
            }
            HrTimerRestart::NoRestart
        })
        .unwrap();

        timer.start(Duration::from_millis(5), HrTimerMode::Relative);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_active());
        assert!(!timer.cancel());

        // The timer thread survived and can fire again.
        timer.start(Duration::from_millis(5), HrTimerMode::Relative);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert!(!timer.cancel());
    }

    #[test]
    fn test_cancel_pending_timer_reports_active() {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fired);
        let timer = HrTimer::new("pending", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            HrTimerRestart::NoRestart
        })
        .unwrap();

        timer.start(Duration::from_secs(10), HrTimerMode::Relative);
        assert!(timer.is_active());
        assert!(timer.cancel());
        assert!(!timer.cancel());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
