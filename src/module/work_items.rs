//! The module's two reusable work items and the task they simulate.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::{ModuleConfig, WorkConfig};
use crate::core::{
    DeferredError, DelayedWork, EventSink, ModuleEvent, Work, WorkContext, WorkHandler, Workqueue,
};
use crate::util::clock::ktime_ms;

/// A task that logs, sleeps for a fixed time and logs again.
pub struct SimulatedTask {
    label: String,
    execution_time: Duration,
    sink: Arc<dyn EventSink>,
}

impl SimulatedTask {
    /// Build the task described by `cfg`.
    pub fn new(cfg: &WorkConfig, sink: Arc<dyn EventSink>) -> Self {
        Self {
            label: cfg.label.clone(),
            execution_time: cfg.execution_time(),
            sink,
        }
    }
}

#[async_trait]
impl WorkHandler for SimulatedTask {
    async fn run(&self, ctx: WorkContext) {
        info!("Starting work: {}", self.label);
        debug!(
            execution_ms = u64::try_from(self.execution_time.as_millis()).unwrap_or(u64::MAX),
            time_ms = ktime_ms(),
            worker_id = ctx.worker_id,
            "work started"
        );
        self.sink.record(ModuleEvent::WorkStarted {
            label: self.label.clone(),
        });

        tokio::time::sleep(self.execution_time).await;

        info!("Finishing work: {}", self.label);
        debug!(time_ms = ktime_ms(), worker_id = ctx.worker_id, "work finished");
        self.sink.record(ModuleEvent::WorkFinished {
            label: self.label.clone(),
        });
    }
}

/// The module workqueue with its immediate and delayed work item.
///
/// Every unit run targets these same two items, so an item that is still
/// pending absorbs further queue attempts.
#[derive(Clone)]
pub struct WorkItems {
    queue: Workqueue,
    work: Work,
    delayed: DelayedWork,
    delay: Duration,
    sink: Arc<dyn EventSink>,
}

impl std::fmt::Debug for WorkItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItems")
            .field("queue", &self.queue)
            .field("work", &self.work)
            .field("delayed", &self.delayed)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl WorkItems {
    /// Bind both work items to their simulated tasks on `queue`.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the delayed item's timer can
    /// not start.
    pub fn bind(
        queue: Workqueue,
        cfg: &ModuleConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, DeferredError> {
        let work = Work::new(
            cfg.work.label.clone(),
            SimulatedTask::new(&cfg.work, Arc::clone(&sink)),
        );
        let delayed = DelayedWork::new(
            cfg.delayed_work.label.clone(),
            SimulatedTask::new(&cfg.delayed_work, Arc::clone(&sink)),
        )?;
        Ok(Self {
            queue,
            work,
            delayed,
            delay: cfg.delayed_work.delay(),
            sink,
        })
    }

    /// Queue the immediate item and the delayed item once each.
    ///
    /// Returns whether each was newly queued; `false` means it was still
    /// pending from an earlier call.
    pub fn enqueue(&self) -> (bool, bool) {
        let work_queued = self.queue.queue_work(&self.work);
        self.sink.record(ModuleEvent::WorkQueued {
            label: self.work.name().to_string(),
            newly_queued: work_queued,
        });

        let delayed_queued = self.queue.queue_delayed_work(&self.delayed, self.delay);
        self.sink.record(ModuleEvent::WorkQueued {
            label: self.delayed.name().to_string(),
            newly_queued: delayed_queued,
        });

        (work_queued, delayed_queued)
    }

    /// The module workqueue.
    pub fn queue(&self) -> &Workqueue {
        &self.queue
    }

    /// The immediate item.
    pub fn work(&self) -> &Work {
        &self.work
    }

    /// The delayed item.
    pub fn delayed_work(&self) -> &DelayedWork {
        &self.delayed
    }
}
