//! Delayed work: a [`Work`] plus the timer that queues it.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{QueueShared, Work, WorkHandler};
use crate::core::error::DeferredError;
use crate::core::hrtimer::{HrTimer, HrTimerMode, HrTimerRestart};

type Target = Arc<Mutex<Option<Weak<QueueShared>>>>;

struct DelayedInner {
    work: Work,
    timer: HrTimer,
    target: Target,
}

/// A reusable work item that is handed to its queue once a delay expires.
#[derive(Clone)]
pub struct DelayedWork {
    inner: Arc<DelayedInner>,
}

impl fmt::Debug for DelayedWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedWork")
            .field("work", &self.inner.work)
            .field("timer_active", &self.inner.timer.is_active())
            .finish()
    }
}

impl DelayedWork {
    /// Bind `handler` to a new, idle delayed work item.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the delay timer can not start.
    pub fn new<H: WorkHandler>(name: impl Into<String>, handler: H) -> Result<Self, DeferredError> {
        Self::from_handler(name, Arc::new(handler))
    }

    /// Bind a shared handler to a new, idle delayed work item.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the delay timer can not start.
    pub fn from_handler(
        name: impl Into<String>,
        handler: Arc<dyn WorkHandler>,
    ) -> Result<Self, DeferredError> {
        let work = Work::from_handler(name, handler);
        let target: Target = Arc::new(Mutex::new(None));

        let timer = HrTimer::new(format!("dwork/{}", work.name()), {
            let work = Arc::clone(&work.inner);
            let target = Arc::clone(&target);
            move |_firing| {
                let mut state = work.state.lock();
                if !state.pending || state.canceling {
                    return HrTimerRestart::NoRestart;
                }
                let queue = target.lock().as_ref().and_then(Weak::upgrade);
                match queue {
                    Some(queue) => {
                        if queue.push(&work, &mut state) {
                            debug!(queue = %queue.name, work = %work.name, "delayed work expired");
                        }
                    }
                    None => {
                        state.pending = false;
                        warn!(work = %work.name, "delayed work expired after its workqueue was dropped");
                    }
                }
                HrTimerRestart::NoRestart
            }
        })?;

        Ok(Self {
            inner: Arc::new(DelayedInner {
                work,
                timer,
                target,
            }),
        })
    }

    /// The underlying work item.
    pub fn work(&self) -> &Work {
        &self.inner.work
    }

    /// Work name.
    pub fn name(&self) -> &str {
        self.inner.work.name()
    }

    /// Whether the item is waiting for its delay or for a worker.
    pub fn is_pending(&self) -> bool {
        self.inner.work.is_pending()
    }

    /// Whether the delay timer is still armed.
    pub fn is_timer_armed(&self) -> bool {
        self.inner.timer.is_active()
    }

    /// Arm the delay timer towards `queue`. Caller has already marked the
    /// work pending under its state lock.
    pub(super) fn arm(&self, queue: Weak<QueueShared>, delay: Duration) {
        *self.inner.target.lock() = Some(queue);
        self.inner.timer.start(delay, HrTimerMode::Relative);
    }

    /// Cancel the delay timer and any pending instance, then wait for a
    /// running handler to finish.
    ///
    /// Returns `true` if the item was pending, whether still waiting for its
    /// delay or already queued to a worker.
    pub fn cancel_sync(&self) -> bool {
        let work = &self.inner.work.inner;
        let was_pending = {
            let mut state = work.state.lock();
            let was_pending = state.pending;
            state.pending = false;
            state.canceling = true;
            was_pending
        };

        // Waits for a timer callback in flight; it sees `canceling` and backs off.
        let timer_was_armed = self.inner.timer.cancel();

        let mut state = work.state.lock();
        while state.running {
            work.cond.wait(&mut state);
        }
        state.canceling = false;
        work.cond.notify_all();
        debug!(work = %work.name, was_pending, timer_was_armed, "delayed work cancelled");
        was_pending
    }
}
