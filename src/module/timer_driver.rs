//! Periodic timer that kicks both execution units.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::{
    DeferredError, EventSink, HrTimer, HrTimerMode, HrTimerRestart, ModuleEvent, SoftirqDispatcher,
};
use crate::module::unit::UnitPair;

/// Self-restarting timer with a bounded restart budget.
///
/// Each firing resets both units and schedules them, low priority first.
/// The callback runs in interrupt context of the units' dispatcher, so the
/// high-priority unit is still dispatched first.
#[derive(Debug)]
pub struct TimerDriver {
    timer: HrTimer,
    restart: Arc<AtomicI32>,
    interval: Duration,
}

impl TimerDriver {
    /// Create the (unarmed) driver.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the timer thread can not start.
    pub fn new(
        softirq: &SoftirqDispatcher,
        restart: i32,
        interval: Duration,
        units: UnitPair,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, DeferredError> {
        let budget = Arc::new(AtomicI32::new(restart));
        let timer = HrTimer::with_softirq("hr_timer", softirq.clone(), {
            let budget = Arc::clone(&budget);
            move |firing| {
                debug!(now_ms = firing.now_ms(), "hr_timer callback called");

                units.low.reset();
                units.high.reset();
                units.low.schedule();
                units.high.schedule();

                let previous = budget
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |b| {
                        Some(b.saturating_sub(1))
                    })
                    .unwrap_or_else(|b| b);
                let restart_left = previous.saturating_sub(1);
                let rearmed = restart_left > 0;
                if rearmed {
                    firing.forward_now(interval);
                }
                sink.record(ModuleEvent::TimerFired {
                    restart_left,
                    rearmed,
                });

                if rearmed {
                    HrTimerRestart::Restart
                } else {
                    info!("hr_timer stops re-arming");
                    HrTimerRestart::NoRestart
                }
            }
        })?;

        Ok(Self {
            timer,
            restart: budget,
            interval,
        })
    }

    /// Arm the first firing one interval from now.
    pub fn arm(&self) {
        self.timer.start(self.interval, HrTimerMode::Relative);
    }

    /// Restart budget left.
    pub fn restart_left(&self) -> i32 {
        self.restart.load(Ordering::SeqCst)
    }

    /// Interval between firings.
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a firing is queued or running.
    pub fn is_active(&self) -> bool {
        self.timer.is_active()
    }

    /// Cancel the timer, waiting for a callback in flight. Returns `true` if
    /// a firing was still queued or running.
    pub fn cancel(&self) -> bool {
        self.timer.cancel()
    }
}
