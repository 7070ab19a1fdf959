//! Softirq dispatcher and tasklets.
//!
//! A [`SoftirqDispatcher`] owns one dispatcher thread that plays the role of
//! the softirq daemon. Tasklets are queued on one of two tiers. The
//! dispatcher works in passes: each pass takes every pending tasklet of both
//! tiers at once, runs the high tier, then the normal tier. Tasklets scheduled
//! while a pass is running (including a tasklet rescheduling itself) land in
//! the next pass.
//!
//! Interrupt context is modelled with [`IrqGuard`]: no pass starts while any
//! guard is alive, so everything scheduled from a timer callback is dispatched
//! together, high tier first, whatever the call order inside the callback.

use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace};

use crate::core::error::DeferredError;

/// Dispatch tier of a tasklet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskletPriority {
    /// Regular tasklet softirq.
    Normal,
    /// High-priority tasklet softirq, always dispatched first.
    High,
}

/// Dispatcher statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoftirqStats {
    /// Completed dispatch passes.
    pub passes: u64,
    /// Tasklet runs on the high tier.
    pub high_runs: u64,
    /// Tasklet runs on the normal tier.
    pub normal_runs: u64,
}

#[derive(Default)]
struct PendingState {
    high: VecDeque<Arc<TaskletInner>>,
    normal: VecDeque<Arc<TaskletInner>>,
    irq_depth: usize,
    shutdown: bool,
}

impl PendingState {
    fn is_empty(&self) -> bool {
        self.high.is_empty() && self.normal.is_empty()
    }
}

#[derive(Default)]
struct SoftirqCounters {
    passes: AtomicU64,
    high_runs: AtomicU64,
    normal_runs: AtomicU64,
}

struct DispatcherShared {
    pending: Mutex<PendingState>,
    cond: Condvar,
    counters: SoftirqCounters,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl DispatcherShared {
    fn stop(&self) {
        {
            let mut pending = self.pending.lock();
            if pending.shutdown {
                return;
            }
            pending.shutdown = true;
            self.cond.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!("softirq dispatcher thread panicked");
            }
        }
        info!("softirq dispatcher stopped");
    }
}

/// Stops the dispatcher once the last [`SoftirqDispatcher`] handle is gone.
struct DispatcherOwner {
    shared: Arc<DispatcherShared>,
}

impl Drop for DispatcherOwner {
    fn drop(&mut self) {
        self.shared.stop();
    }
}

/// Handle to a running softirq dispatcher.
///
/// Clones share the same dispatcher thread. The thread stops on
/// [`shutdown`](Self::shutdown) or when the last handle is dropped; pending
/// tasklets are discarded at that point. [`Tasklet`]s do not keep the
/// dispatcher alive.
#[derive(Clone)]
pub struct SoftirqDispatcher {
    shared: Arc<DispatcherShared>,
    _owner: Arc<DispatcherOwner>,
}

impl fmt::Debug for SoftirqDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftirqDispatcher")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SoftirqDispatcher {
    /// Start the dispatcher thread.
    ///
    /// # Errors
    ///
    /// Returns `DeferredError::ThreadSpawn` if the thread can not start.
    pub fn start() -> Result<Self, DeferredError> {
        let shared = Arc::new(DispatcherShared {
            pending: Mutex::new(PendingState::default()),
            cond: Condvar::new(),
            counters: SoftirqCounters::default(),
            thread: Mutex::new(None),
        });
        let name = "ksoftirqd/0".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn({
                let shared = Arc::clone(&shared);
                move || dispatch_loop(&shared)
            })
            .map_err(|source| DeferredError::ThreadSpawn { name, source })?;
        *shared.thread.lock() = Some(handle);

        debug!("softirq dispatcher started");
        let owner = Arc::new(DispatcherOwner {
            shared: Arc::clone(&shared),
        });
        Ok(Self {
            shared,
            _owner: owner,
        })
    }

    /// Enter interrupt context. Dispatch is held off until every guard is
    /// dropped.
    #[must_use = "interrupt context ends when the guard is dropped"]
    pub fn irq_enter(&self) -> IrqGuard {
        self.shared.pending.lock().irq_depth += 1;
        IrqGuard {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Snapshot of dispatcher statistics.
    pub fn stats(&self) -> SoftirqStats {
        let c = &self.shared.counters;
        SoftirqStats {
            passes: c.passes.load(Ordering::Relaxed),
            high_runs: c.high_runs.load(Ordering::Relaxed),
            normal_runs: c.normal_runs.load(Ordering::Relaxed),
        }
    }

    /// Stop the dispatcher thread after the current pass. Idempotent.
    pub fn shutdown(&self) {
        self.shared.stop();
    }
}

/// Interrupt-context marker returned by [`SoftirqDispatcher::irq_enter`].
pub struct IrqGuard {
    shared: Arc<DispatcherShared>,
}

impl fmt::Debug for IrqGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IrqGuard").finish_non_exhaustive()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        let mut pending = self.shared.pending.lock();
        pending.irq_depth = pending.irq_depth.saturating_sub(1);
        if pending.irq_depth == 0 {
            self.shared.cond.notify_all();
        }
    }
}

#[derive(Debug, Default)]
struct TaskletState {
    scheduled: bool,
    running: bool,
    dead: bool,
}

type TaskletFn = Box<dyn Fn(&Tasklet) + Send + Sync + 'static>;

struct TaskletInner {
    name: String,
    priority: TaskletPriority,
    state: Mutex<TaskletState>,
    cond: Condvar,
    func: TaskletFn,
    runs: AtomicU64,
    dispatcher: Arc<DispatcherShared>,
}

/// A deferred, non-sleeping unit of work bound to a dispatcher.
///
/// A tasklet is pending at most once: scheduling an already pending tasklet
/// is a no-op. The routine receives the tasklet itself so it can reschedule
/// itself on its own tier.
#[derive(Clone)]
pub struct Tasklet {
    inner: Arc<TaskletInner>,
}

impl fmt::Debug for Tasklet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tasklet")
            .field("name", &self.inner.name)
            .field("priority", &self.inner.priority)
            .field("runs", &self.runs())
            .finish_non_exhaustive()
    }
}

impl Tasklet {
    /// Bind `func` to a new tasklet on `dispatcher`.
    pub fn new<F>(
        dispatcher: &SoftirqDispatcher,
        name: impl Into<String>,
        priority: TaskletPriority,
        func: F,
    ) -> Self
    where
        F: Fn(&Self) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(TaskletInner {
                name: name.into(),
                priority,
                state: Mutex::new(TaskletState::default()),
                cond: Condvar::new(),
                func: Box::new(func),
                runs: AtomicU64::new(0),
                dispatcher: Arc::clone(&dispatcher.shared),
            }),
        }
    }

    /// Tasklet name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Tier this tasklet is always scheduled on.
    pub fn priority(&self) -> TaskletPriority {
        self.inner.priority
    }

    /// Number of completed runs.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Whether the tasklet is queued for a run.
    pub fn is_scheduled(&self) -> bool {
        self.inner.state.lock().scheduled
    }

    /// Queue the tasklet on its tier.
    ///
    /// Returns `false` if it was already pending, has been killed, or the
    /// dispatcher is shut down.
    pub fn schedule(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.dead || state.scheduled {
                return false;
            }
            state.scheduled = true;
        }

        let shared = &self.inner.dispatcher;
        let mut pending = shared.pending.lock();
        if pending.shutdown {
            drop(pending);
            self.inner.state.lock().scheduled = false;
            return false;
        }
        match self.inner.priority {
            TaskletPriority::High => pending.high.push_back(Arc::clone(&self.inner)),
            TaskletPriority::Normal => pending.normal.push_back(Arc::clone(&self.inner)),
        }
        if pending.irq_depth == 0 {
            shared.cond.notify_all();
        }
        trace!(tasklet = %self.inner.name, priority = ?self.inner.priority, "tasklet scheduled");
        true
    }

    /// Remove the tasklet from its queue and wait for a running instance to
    /// finish. A killed tasklet ignores further `schedule` calls.
    ///
    /// Returns `true` if it was pending or running.
    pub fn kill(&self) -> bool {
        let was_active = {
            let mut state = self.inner.state.lock();
            state.dead = true;
            state.scheduled || state.running
        };

        let removed = {
            let mut pending = self.inner.dispatcher.pending.lock();
            let queue = match self.inner.priority {
                TaskletPriority::High => &mut pending.high,
                TaskletPriority::Normal => &mut pending.normal,
            };
            let before = queue.len();
            queue.retain(|t| !Arc::ptr_eq(t, &self.inner));
            before != queue.len()
        };

        let mut state = self.inner.state.lock();
        if removed {
            state.scheduled = false;
        }
        while state.running {
            self.inner.cond.wait(&mut state);
        }
        debug!(tasklet = %self.inner.name, was_active, "tasklet killed");
        was_active
    }
}

fn dispatch_loop(shared: &DispatcherShared) {
    let mut pending = shared.pending.lock();
    loop {
        while !pending.shutdown && (pending.irq_depth > 0 || pending.is_empty()) {
            shared.cond.wait(&mut pending);
        }
        if pending.shutdown {
            break;
        }

        let high: Vec<_> = pending.high.drain(..).collect();
        let normal: Vec<_> = pending.normal.drain(..).collect();

        MutexGuard::unlocked(&mut pending, || {
            for tasklet in &high {
                if run_tasklet(tasklet) {
                    shared.counters.high_runs.fetch_add(1, Ordering::Relaxed);
                }
            }
            for tasklet in &normal {
                if run_tasklet(tasklet) {
                    shared.counters.normal_runs.fetch_add(1, Ordering::Relaxed);
                }
            }
        });
        shared.counters.passes.fetch_add(1, Ordering::Relaxed);
    }

    // Discarded tasklets are no longer pending.
    let state = &mut *pending;
    let leftovers: Vec<_> = state.high.drain(..).chain(state.normal.drain(..)).collect();
    drop(pending);
    for tasklet in leftovers {
        tasklet.state.lock().scheduled = false;
        tasklet.cond.notify_all();
    }
    debug!("softirq dispatcher exiting");
}

/// Run one tasklet. Returns `false` when it was skipped because it was killed.
fn run_tasklet(inner: &Arc<TaskletInner>) -> bool {
    {
        let mut state = inner.state.lock();
        state.scheduled = false;
        if state.dead {
            inner.cond.notify_all();
            return false;
        }
        state.running = true;
    }

    let handle = Tasklet {
        inner: Arc::clone(inner),
    };
    if catch_unwind(AssertUnwindSafe(|| (inner.func)(&handle))).is_err() {
        error!(tasklet = %inner.name, "tasklet routine panicked");
    }
    inner.runs.fetch_add(1, Ordering::Relaxed);

    let mut state = inner.state.lock();
    state.running = false;
    inner.cond.notify_all();
    true
}
