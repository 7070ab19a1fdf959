//! Tasklet-backed execution units.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::{ModuleConfig, UnitConfig};
use crate::core::{EventSink, ModuleEvent, SoftirqDispatcher, Tasklet, TaskletPriority};
use crate::module::work_items::WorkItems;
use crate::util::clock::ktime_ms;

struct UnitState {
    label: String,
    loops_init: i32,
    loops: AtomicI32,
    works: WorkItems,
    sink: Arc<dyn EventSink>,
}

/// A tasklet that runs `loops_init` times per reset, queueing both work
/// items on every run.
///
/// The unit's state is captured by its tasklet routine, and the tier used
/// for rescheduling is the tasklet's stored priority.
#[derive(Clone)]
pub struct ExecutionUnit {
    state: Arc<UnitState>,
    tasklet: Tasklet,
}

impl fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("label", &self.state.label)
            .field("priority", &self.priority())
            .field("loops_init", &self.state.loops_init)
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

impl ExecutionUnit {
    /// Create a unit on `softirq`. It does not run until scheduled.
    pub fn new(
        softirq: &SoftirqDispatcher,
        cfg: &UnitConfig,
        priority: TaskletPriority,
        works: WorkItems,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let state = Arc::new(UnitState {
            label: cfg.label.clone(),
            loops_init: cfg.loops,
            loops: AtomicI32::new(cfg.loops),
            works,
            sink,
        });
        let tasklet = Tasklet::new(softirq, cfg.label.clone(), priority, {
            let state = Arc::clone(&state);
            move |tasklet| run_unit(&state, tasklet)
        });
        Self { state, tasklet }
    }

    /// Unit label.
    pub fn label(&self) -> &str {
        &self.state.label
    }

    /// Priority tier.
    pub fn priority(&self) -> TaskletPriority {
        self.tasklet.priority()
    }

    /// Runs per reset.
    pub fn loops_init(&self) -> i32 {
        self.state.loops_init
    }

    /// Runs left before the unit stops rescheduling itself.
    pub fn remaining(&self) -> i32 {
        self.state.loops.load(Ordering::SeqCst)
    }

    /// Completed runs since creation.
    pub fn runs(&self) -> u64 {
        self.tasklet.runs()
    }

    /// Restore the remaining counter to `loops_init`.
    pub fn reset(&self) {
        self.state.loops.store(self.state.loops_init, Ordering::SeqCst);
    }

    /// Queue the unit on its own tier. Returns `false` if already pending.
    pub fn schedule(&self) -> bool {
        self.tasklet.schedule()
    }

    /// Dequeue the unit and wait for a running instance. Returns `true` if it
    /// was pending or running.
    pub fn kill(&self) -> bool {
        self.tasklet.kill()
    }
}

fn run_unit(state: &UnitState, tasklet: &Tasklet) {
    let iteration = state.loops_init - state.loops.load(Ordering::SeqCst);

    debug!(time_ms = ktime_ms(), unit = %state.label, "tasklet routine called");
    info!("Tasklet's saying \"{}\" (loop: {})", state.label, iteration);
    state.sink.record(ModuleEvent::UnitRun {
        label: state.label.clone(),
        priority: tasklet.priority(),
        iteration,
    });

    state.works.enqueue();

    let previous = state
        .loops
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| Some((left - 1).max(0)))
        .unwrap_or(0);
    if previous - 1 > 0 {
        tasklet.schedule();
    }
}

/// The module's high- and low-priority units.
#[derive(Debug, Clone)]
pub struct UnitPair {
    /// High-priority unit.
    pub high: ExecutionUnit,
    /// Low-priority unit.
    pub low: ExecutionUnit,
}

impl UnitPair {
    /// Create both units from the module configuration.
    pub fn new(
        softirq: &SoftirqDispatcher,
        cfg: &ModuleConfig,
        works: &WorkItems,
        sink: &Arc<dyn EventSink>,
    ) -> Self {
        Self {
            high: ExecutionUnit::new(
                softirq,
                &cfg.high,
                TaskletPriority::High,
                works.clone(),
                Arc::clone(sink),
            ),
            low: ExecutionUnit::new(
                softirq,
                &cfg.low,
                TaskletPriority::Normal,
                works.clone(),
                Arc::clone(sink),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{InMemoryEventSink, Workqueue, WorkqueueFlags};
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn test_unit_runs_loops_init_times() {
        let sink = Arc::new(InMemoryEventSink::default());
        let dyn_sink: Arc<dyn EventSink> = sink.clone();
        let cfg = ModuleConfig::default()
            .with_loops(3)
            .with_execution_times(1, 1)
            .with_work_delay_ms(1);
        let softirq = SoftirqDispatcher::start().unwrap();
        let queue = Workqueue::alloc("unit", WorkqueueFlags::NONE, 2).unwrap();
        let works = WorkItems::bind(queue.clone(), &cfg, Arc::clone(&dyn_sink)).unwrap();
        let unit = ExecutionUnit::new(&softirq, &cfg.high, TaskletPriority::High, works, dyn_sink);

        unit.reset();
        assert!(unit.schedule());

        let deadline = Instant::now() + Duration::from_secs(5);
        while unit.runs() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        thread::sleep(Duration::from_millis(20));
        assert_eq!(unit.runs(), 3);
        assert_eq!(unit.remaining(), 0);

        let iterations: Vec<i32> = sink
            .events()
            .into_iter()
            .filter_map(|r| match r.event {
                ModuleEvent::UnitRun { iteration, .. } => Some(iteration),
                _ => None,
            })
            .collect();
        assert_eq!(iterations, vec![0, 1, 2]);

        unit.kill();
        queue.flush();
        queue.destroy();
        softirq.shutdown();
    }
}
