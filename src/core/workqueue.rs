//! Workqueue with dedicated worker threads.
//!
//! A [`Workqueue`] spawns `max_active` OS threads, each with its own
//! single-threaded tokio runtime, so work handlers may sleep without
//! affecting the submitter. Work items ([`Work`], [`DelayedWork`]) are
//! long-lived objects that are queued again and again:
//!
//! - **At most one pending instance**: queueing a pending item returns
//!   `false` and does nothing.
//! - **Non-reentrant**: an item never runs on two workers at once. If it is
//!   queued again while running, the next run starts after the current one.
//! - **Synchronous cancel**: `cancel_sync` drops a pending instance and waits
//!   for a running one to complete. Handlers are never interrupted.
//! - **No polling**: workers block on channel recv; flush waits on a Condvar.

mod delayed;

pub use delayed::DelayedWork;

use std::fmt;
use std::ops::BitOr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use async_trait::async_trait;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::core::error::DeferredError;

/// Upper bound on the number of workers of one queue.
pub const WQ_MAX_ACTIVE: usize = 512;

/// Workqueue allocation flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkqueueFlags(u32);

impl WorkqueueFlags {
    /// No flags.
    pub const NONE: Self = Self(0);
    /// Workers are not bound to a CPU.
    pub const UNBOUND: Self = Self(1 << 1);
    /// Queue participates in system freeze.
    pub const FREEZABLE: Self = Self(1 << 2);
    /// Workers run at elevated priority.
    pub const HIGHPRI: Self = Self(1 << 4);

    /// Raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Whether all bits of `other` are set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for WorkqueueFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Statistics about queue utilization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Number of worker threads.
    pub max_active: usize,
    /// Successful `queue_*` calls.
    pub queued: u64,
    /// `queue_*` calls that found the item already pending.
    pub coalesced: u64,
    /// `queue_*` calls refused because the queue was destroyed.
    pub rejected: u64,
    /// Handler runs that completed.
    pub executed: u64,
}

#[derive(Debug, Default)]
struct QueueCounters {
    queued: AtomicU64,
    coalesced: AtomicU64,
    rejected: AtomicU64,
    executed: AtomicU64,
}

/// Information handed to a running work handler.
#[derive(Debug, Clone)]
pub struct WorkContext {
    /// Name of the queue the work runs on.
    pub queue: String,
    /// Worker index within the queue.
    pub worker_id: usize,
    /// Name of the work item.
    pub work: String,
}

/// Body of a work item.
///
/// Runs on a workqueue worker thread inside that worker's tokio runtime, so
/// it may sleep (`tokio::time::sleep`) or block.
#[async_trait]
pub trait WorkHandler: Send + Sync + 'static {
    /// Execute one run of the work.
    async fn run(&self, ctx: WorkContext);
}

#[derive(Debug, Default)]
struct WorkState {
    pending: bool,
    running: bool,
    canceling: bool,
}

struct WorkInner {
    name: String,
    handler: Arc<dyn WorkHandler>,
    state: Mutex<WorkState>,
    cond: Condvar,
    runs: AtomicU64,
}

/// A reusable work item.
#[derive(Clone)]
pub struct Work {
    inner: Arc<WorkInner>,
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Work")
            .field("name", &self.inner.name)
            .field("pending", &self.is_pending())
            .field("runs", &self.runs())
            .finish_non_exhaustive()
    }
}

impl Work {
    /// Bind `handler` to a new, idle work item.
    pub fn new<H: WorkHandler>(name: impl Into<String>, handler: H) -> Self {
        Self::from_handler(name, Arc::new(handler))
    }

    /// Bind a shared handler to a new, idle work item.
    pub fn from_handler(name: impl Into<String>, handler: Arc<dyn WorkHandler>) -> Self {
        Self {
            inner: Arc::new(WorkInner {
                name: name.into(),
                handler,
                state: Mutex::new(WorkState::default()),
                cond: Condvar::new(),
                runs: AtomicU64::new(0),
            }),
        }
    }

    /// Work name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether an instance is queued and has not started yet.
    pub fn is_pending(&self) -> bool {
        self.inner.state.lock().pending
    }

    /// Whether the handler is running right now.
    pub fn is_running(&self) -> bool {
        self.inner.state.lock().running
    }

    /// Completed handler runs.
    pub fn runs(&self) -> u64 {
        self.inner.runs.load(Ordering::Relaxed)
    }

    /// Cancel a pending instance and wait for a running one to finish.
    ///
    /// Returns `true` if an instance was pending. Calling it on an idle item
    /// is harmless and returns `false`.
    pub fn cancel_sync(&self) -> bool {
        let mut state = self.inner.state.lock();
        let was_pending = state.pending;
        state.pending = false;
        state.canceling = true;
        while state.running {
            self.inner.cond.wait(&mut state);
        }
        state.canceling = false;
        self.inner.cond.notify_all();
        debug!(work = %self.inner.name, was_pending, "work cancelled");
        was_pending
    }
}

/// Number of jobs sent to workers and not yet finished.
#[derive(Debug, Default)]
struct DrainState {
    outstanding: Mutex<u64>,
    cond: Condvar,
}

impl DrainState {
    fn finish_one(&self) {
        let mut outstanding = self.outstanding.lock();
        *outstanding = outstanding.saturating_sub(1);
        if *outstanding == 0 {
            self.cond.notify_all();
        }
    }
}

struct QueueShared {
    name: String,
    flags: WorkqueueFlags,
    max_active: usize,
    task_tx: Mutex<Option<Sender<Arc<WorkInner>>>>,
    counters: Arc<QueueCounters>,
    drain: Arc<DrainState>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl QueueShared {
    /// Hand `work` to the workers. Caller holds the work's state lock.
    fn push(&self, work: &Arc<WorkInner>, state: &mut WorkState) -> bool {
        let task_tx = self.task_tx.lock();
        let Some(task_tx) = task_tx.as_ref() else {
            state.pending = false;
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(queue = %self.name, work = %work.name, "queueing on a destroyed workqueue");
            return false;
        };

        *self.drain.outstanding.lock() += 1;
        if task_tx.send(Arc::clone(work)).is_err() {
            self.drain.finish_one();
            state.pending = false;
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        state.pending = true;
        true
    }
}

/// Handle to a workqueue. Clones share the same workers.
#[derive(Clone)]
pub struct Workqueue {
    shared: Arc<QueueShared>,
}

impl fmt::Debug for Workqueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workqueue")
            .field("name", &self.shared.name)
            .field("flags", &self.shared.flags)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Workqueue {
    /// Allocate a workqueue with `max_active` worker threads.
    ///
    /// `max_active == 0` selects one worker per CPU; values above
    /// [`WQ_MAX_ACTIVE`] are clamped.
    ///
    /// # Errors
    ///
    /// - `DeferredError::WorkqueueAlloc` if the name is empty
    /// - `DeferredError::Runtime` if a worker runtime can not be built
    /// - `DeferredError::ThreadSpawn` if a worker thread can not start
    pub fn alloc(
        name: impl Into<String>,
        flags: WorkqueueFlags,
        max_active: usize,
    ) -> Result<Self, DeferredError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DeferredError::WorkqueueAlloc {
                name,
                reason: "name must not be empty".into(),
            });
        }
        let max_active = match max_active {
            0 => num_cpus::get().max(1),
            n if n > WQ_MAX_ACTIVE => {
                warn!(queue = %name, requested = n, "max_active clamped to {WQ_MAX_ACTIVE}");
                WQ_MAX_ACTIVE
            }
            n => n,
        };

        let (task_tx, task_rx) = unbounded::<Arc<WorkInner>>();
        let counters = Arc::new(QueueCounters::default());
        let drain = Arc::new(DrainState::default());

        let mut workers = Vec::with_capacity(max_active);
        for worker_id in 0..max_active {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(DeferredError::Runtime)?;
            let thread_name = if flags.contains(WorkqueueFlags::HIGHPRI) {
                format!("kworker/{name}:{worker_id}H")
            } else {
                format!("kworker/{name}:{worker_id}")
            };
            // Already spawned workers exit once `task_tx` drops on the error path.
            let worker = spawn_worker(
                thread_name,
                worker_id,
                name.clone(),
                task_rx.clone(),
                runtime,
                Arc::clone(&counters),
                Arc::clone(&drain),
            )?;
            workers.push(worker);
        }

        info!(queue = %name, max_active, flags = flags.bits(), "workqueue allocated");

        Ok(Self {
            shared: Arc::new(QueueShared {
                name,
                flags,
                max_active,
                task_tx: Mutex::new(Some(task_tx)),
                counters,
                drain,
                workers: Mutex::new(workers),
                destroyed: AtomicBool::new(false),
            }),
        })
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Number of worker threads.
    pub fn max_active(&self) -> usize {
        self.shared.max_active
    }

    /// Whether [`destroy`](Self::destroy) has been called.
    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::Acquire)
    }

    /// Queue `work` for immediate execution.
    ///
    /// Returns `false` if it was already pending, is being cancelled, or the
    /// queue is destroyed.
    pub fn queue_work(&self, work: &Work) -> bool {
        let mut state = work.inner.state.lock();
        if state.pending || state.canceling {
            self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let queued = self.shared.push(&work.inner, &mut state);
        if queued {
            self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
            debug!(queue = %self.shared.name, work = %work.inner.name, "work queued");
        }
        queued
    }

    /// Queue `dwork` to run after `delay`, measured from now.
    ///
    /// Same return contract as [`queue_work`](Self::queue_work). The item
    /// counts as pending from this call until a worker starts it.
    pub fn queue_delayed_work(&self, dwork: &DelayedWork, delay: Duration) -> bool {
        let work = dwork.work();
        let mut state = work.inner.state.lock();
        if state.pending || state.canceling {
            self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if delay.is_zero() {
            drop(state);
            return self.queue_work(work);
        }
        if self.is_destroyed() {
            self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(queue = %self.shared.name, work = %work.inner.name, "queueing on a destroyed workqueue");
            return false;
        }

        state.pending = true;
        dwork.arm(Arc::downgrade(&self.shared), delay);
        self.shared.counters.queued.fetch_add(1, Ordering::Relaxed);
        debug!(
            queue = %self.shared.name,
            work = %work.inner.name,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "delayed work queued"
        );
        true
    }

    /// Wait until every work handed to the workers has finished.
    ///
    /// Delayed work whose timer has not fired yet is not waited for. Must not
    /// be called from a work handler of this queue.
    pub fn flush(&self) {
        let drain = &self.shared.drain;
        let mut outstanding = drain.outstanding.lock();
        while *outstanding > 0 {
            drain.cond.wait(&mut outstanding);
        }
        debug!(queue = %self.shared.name, "workqueue flushed");
    }

    /// Drain the queue, stop accepting work and join the workers. Idempotent.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.flush();

        // Dropping the sender unblocks every worker waiting on recv().
        self.shared.task_tx.lock().take();

        let mut workers = self.shared.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            if worker.join().is_err() {
                warn!(queue = %self.shared.name, worker_id = idx, "worker panicked");
            }
        }
        info!(queue = %self.shared.name, worker_count, "workqueue destroyed");
    }

    /// Get current queue statistics.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            max_active: self.shared.max_active,
            queued: c.queued.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
        }
    }
}

/// Spawn a worker thread.
fn spawn_worker(
    thread_name: String,
    worker_id: usize,
    queue: String,
    task_rx: Receiver<Arc<WorkInner>>,
    runtime: tokio::runtime::Runtime,
    counters: Arc<QueueCounters>,
    drain: Arc<DrainState>,
) -> Result<JoinHandle<()>, DeferredError> {
    thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            debug!(queue = %queue, worker_id, "worker thread started");

            // When the sender is dropped, recv returns Err and the worker exits.
            while let Ok(work) = task_rx.recv() {
                if run_work(&queue, worker_id, &runtime, &work) {
                    counters.executed.fetch_add(1, Ordering::Relaxed);
                }
                drain.finish_one();
            }

            debug!(queue = %queue, worker_id, "worker thread exiting");
        })
        .map_err(|source| DeferredError::ThreadSpawn {
            name: thread_name,
            source,
        })
}

/// Run one queued instance. Returns `false` if it was cancelled meanwhile.
fn run_work(queue: &str, worker_id: usize, runtime: &tokio::runtime::Runtime, work: &WorkInner) -> bool {
    {
        let mut state = work.state.lock();
        while state.pending && state.running {
            work.cond.wait(&mut state);
        }
        if !state.pending {
            return false;
        }
        state.pending = false;
        state.running = true;
    }

    let ctx = WorkContext {
        queue: queue.to_string(),
        worker_id,
        work: work.name.clone(),
    };
    let handler = Arc::clone(&work.handler);
    if catch_unwind(AssertUnwindSafe(|| runtime.block_on(handler.run(ctx)))).is_err() {
        error!(queue = %queue, work = %work.name, "work handler panicked");
    }
    work.runs.fetch_add(1, Ordering::Relaxed);

    let mut state = work.state.lock();
    state.running = false;
    work.cond.notify_all();
    true
}
