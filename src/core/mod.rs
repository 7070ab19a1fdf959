//! Deferred-execution primitives: timers, tasklets and workqueues.

pub mod error;
pub mod hrtimer;
pub mod journal;
pub mod tasklet;
pub mod workqueue;

pub use error::{AppResult, DeferredError};
pub use hrtimer::{HrTimer, HrTimerMode, HrTimerRestart, TimerFiring};
pub use journal::{EventRecord, EventSink, InMemoryEventSink, ModuleEvent, NullEventSink};
pub use tasklet::{IrqGuard, SoftirqDispatcher, SoftirqStats, Tasklet, TaskletPriority};
pub use workqueue::{
    DelayedWork, QueueStats, Work, WorkContext, WorkHandler, Workqueue, WorkqueueFlags,
    WQ_MAX_ACTIVE,
};
