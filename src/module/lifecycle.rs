//! Module context: the owner of every primitive, and the only place that
//! releases them.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::builders::load_module;
use crate::config::{ModuleConfig, WorkqueueConfig};
use crate::core::{
    DeferredError, EventSink, ModuleEvent, NullEventSink, QueueStats, SoftirqDispatcher,
    SoftirqStats, Workqueue, WorkqueueFlags,
};
use crate::module::timer_driver::TimerDriver;
use crate::module::unit::UnitPair;
use crate::module::work_items::WorkItems;

/// What teardown found still in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UnloadReport {
    /// The timer was queued or running when cancelled.
    pub timer_was_active: bool,
    /// The high-priority tasklet was pending or running when killed.
    pub high_unit_was_active: bool,
    /// The low-priority tasklet was pending or running when killed.
    pub low_unit_was_active: bool,
    /// The immediate work item was pending when cancelled.
    pub work_was_pending: bool,
    /// The delayed work item was pending (timer armed or queued) when cancelled.
    pub delayed_work_was_pending: bool,
}

/// A loaded module.
///
/// Dropping a loaded context unloads it.
pub struct ModuleContext {
    id: Uuid,
    config: ModuleConfig,
    softirq: SoftirqDispatcher,
    works: WorkItems,
    units: UnitPair,
    timer: TimerDriver,
    sink: Arc<dyn EventSink>,
    report: Option<UnloadReport>,
}

impl std::fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleContext")
            .field("id", &self.id)
            .field("units", &self.units)
            .field("timer", &self.timer)
            .field("unloaded", &self.report.is_some())
            .finish_non_exhaustive()
    }
}

/// Default workqueue factory.
///
/// # Errors
///
/// Propagates [`Workqueue::alloc`] errors.
pub fn alloc_module_workqueue(cfg: &WorkqueueConfig) -> Result<Workqueue, DeferredError> {
    Workqueue::alloc(cfg.name.clone(), WorkqueueFlags::NONE, cfg.max_active)
}

impl ModuleContext {
    /// Load the module without journalling.
    ///
    /// # Errors
    ///
    /// See [`load_module`].
    pub fn load(config: ModuleConfig) -> Result<Self, DeferredError> {
        Self::load_with_sink(config, Arc::new(NullEventSink))
    }

    /// Load the module, journalling into `sink`.
    ///
    /// # Errors
    ///
    /// See [`load_module`].
    pub fn load_with_sink(
        config: ModuleConfig,
        sink: Arc<dyn EventSink>,
    ) -> Result<Self, DeferredError> {
        load_module(config, sink, alloc_module_workqueue)
    }

    pub(crate) fn from_parts(
        id: Uuid,
        config: ModuleConfig,
        softirq: SoftirqDispatcher,
        works: WorkItems,
        units: UnitPair,
        timer: TimerDriver,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            id,
            config,
            softirq,
            works,
            units,
            timer,
            sink,
            report: None,
        }
    }

    /// Instance identifier, present in every log line of this instance.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the module was loaded with.
    pub const fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// The two execution units.
    pub const fn units(&self) -> &UnitPair {
        &self.units
    }

    /// The workqueue and its items.
    pub const fn works(&self) -> &WorkItems {
        &self.works
    }

    /// Restart budget left on the timer.
    pub fn restart_left(&self) -> i32 {
        self.timer.restart_left()
    }

    /// Whether a timer firing is queued or running.
    pub fn is_timer_active(&self) -> bool {
        self.timer.is_active()
    }

    /// Softirq dispatcher statistics.
    pub fn softirq_stats(&self) -> SoftirqStats {
        self.softirq.stats()
    }

    /// Workqueue statistics.
    pub fn queue_stats(&self) -> QueueStats {
        self.works.queue().stats()
    }

    /// Whether teardown has run.
    pub const fn is_unloaded(&self) -> bool {
        self.report.is_some()
    }

    /// Unload the module and report what was still in flight.
    pub fn unload(mut self) -> UnloadReport {
        self.teardown()
    }

    fn teardown(&mut self) -> UnloadReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        debug!(module = %self.id, "unloading");

        // 1. No further firings, and no callback still in flight.
        let timer_was_active = self.timer.cancel();
        self.sink.record(ModuleEvent::TimerCancelled {
            was_active: timer_was_active,
        });
        if timer_was_active {
            info!(module = %self.id, "The timer still in use");
        }
        info!(module = %self.id, "HR Timer module has been uninstalled");

        // No unit may queue work from here on.
        let high_unit_was_active = self.kill_unit(true);
        let low_unit_was_active = self.kill_unit(false);

        // 2. and 3. Cancel both work items, waiting for running handlers.
        let work = self.works.work();
        let work_was_pending = work.cancel_sync();
        self.sink.record(ModuleEvent::WorkCancelled {
            label: work.name().to_string(),
            was_pending: work_was_pending,
        });
        let delayed = self.works.delayed_work();
        let delayed_work_was_pending = delayed.cancel_sync();
        self.sink.record(ModuleEvent::WorkCancelled {
            label: delayed.name().to_string(),
            was_pending: delayed_work_was_pending,
        });

        // 4. and 5. Nothing queued is left behind, then release the workers.
        let queue = self.works.queue();
        queue.flush();
        queue.destroy();
        self.sink.record(ModuleEvent::WorkqueueDestroyed {
            name: queue.name().to_string(),
        });
        info!(module = %self.id, "Works have been canceled");

        self.softirq.shutdown();
        self.sink.record(ModuleEvent::Unloaded);

        let report = UnloadReport {
            timer_was_active,
            high_unit_was_active,
            low_unit_was_active,
            work_was_pending,
            delayed_work_was_pending,
        };
        debug!(module = %self.id, ?report, "unloaded");
        self.report = Some(report.clone());
        report
    }

    fn kill_unit(&self, high: bool) -> bool {
        let unit = if high { &self.units.high } else { &self.units.low };
        let was_active = unit.kill();
        self.sink.record(ModuleEvent::TaskletKilled {
            label: unit.label().to_string(),
            was_active,
        });
        was_active
    }
}

impl Drop for ModuleContext {
    fn drop(&mut self) {
        if self.report.is_none() {
            debug!(module = %self.id, "module context dropped while loaded");
            self.teardown();
        }
    }
}
