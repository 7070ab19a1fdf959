//! Builds a [`ModuleContext`] from configuration.

use std::sync::Arc;

use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::{ModuleConfig, WorkqueueConfig};
use crate::core::{DeferredError, EventSink, ModuleEvent, SoftirqDispatcher, Workqueue};
use crate::module::{ModuleContext, TimerDriver, UnitPair, WorkItems};
use crate::util::clock::ktime_ms;

/// Load the module, allocating its workqueue through `workqueue_factory`.
///
/// Steps: validate, start the softirq dispatcher, allocate the workqueue,
/// bind the work items, create both units, arm the timer. Any failure
/// releases what was already created and returns before the timer is armed.
///
/// # Errors
///
/// - `DeferredError::InvalidConfig` if validation fails
/// - whatever the factory returns when workqueue allocation fails
/// - `DeferredError::ThreadSpawn` if a timer or dispatcher thread can not start
pub fn load_module<F>(
    config: ModuleConfig,
    sink: Arc<dyn EventSink>,
    workqueue_factory: F,
) -> Result<ModuleContext, DeferredError>
where
    F: FnOnce(&WorkqueueConfig) -> Result<Workqueue, DeferredError>,
{
    config.validate().map_err(DeferredError::InvalidConfig)?;
    let id = Uuid::new_v4();

    let softirq = SoftirqDispatcher::start()?;

    debug!(module = %id, "Initializing workqueue");
    let queue = workqueue_factory(&config.workqueue).inspect_err(|e| {
        error!(module = %id, error = %e, "workqueue allocation failed, aborting load");
        softirq.shutdown();
    })?;

    let works = WorkItems::bind(queue.clone(), &config, Arc::clone(&sink)).inspect_err(|e| {
        error!(module = %id, error = %e, "binding work items failed, aborting load");
        queue.destroy();
        softirq.shutdown();
    })?;

    debug!(module = %id, "Initializing tasklets");
    let units = UnitPair::new(&softirq, &config, &works, &sink);

    debug!(module = %id, "Starting HR Timer module installation");
    let timer = TimerDriver::new(
        &softirq,
        config.restart,
        config.interval(),
        units.clone(),
        Arc::clone(&sink),
    )
    .inspect_err(|e| {
        error!(module = %id, error = %e, "timer creation failed, aborting load");
        queue.destroy();
        softirq.shutdown();
    })?;

    debug!(
        module = %id,
        "Starting timer to fire in {} ms",
        ktime_ms() + config.delay_ms
    );
    timer.arm();
    sink.record(ModuleEvent::Loaded {
        delay_ms: config.delay_ms,
    });
    info!(
        module = %id,
        restart = config.restart,
        delay_ms = config.delay_ms,
        "module loaded"
    );

    Ok(ModuleContext::from_parts(
        id, config, softirq, works, units, timer, sink,
    ))
}
