//! Event journal.
//!
//! Every observable transition of the module (timer firings, tasklet runs,
//! work start/finish, cancellation outcomes) is recorded here in addition to
//! being logged through `tracing`. The journal keeps a strict global order,
//! which is what the ordering guarantees are checked against.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

use crate::core::tasklet::TaskletPriority;
use crate::util::clock::ktime_ms;

/// Something the module did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleEvent {
    /// Load finished and the timer is armed.
    Loaded {
        /// Relative delay of the first firing.
        delay_ms: u64,
    },
    /// The timer callback ran.
    TimerFired {
        /// Restart budget left after this firing.
        restart_left: i32,
        /// Whether the callback re-armed the timer.
        rearmed: bool,
    },
    /// A tasklet-backed execution unit ran.
    UnitRun {
        /// Unit label.
        label: String,
        /// Priority tier of the unit.
        priority: TaskletPriority,
        /// `loops_init - remaining` at the start of the run.
        iteration: i32,
    },
    /// A unit run tried to queue a work item.
    WorkQueued {
        /// Work label.
        label: String,
        /// `false` when the item was still pending and the call coalesced.
        newly_queued: bool,
    },
    /// A work routine started.
    WorkStarted {
        /// Work label.
        label: String,
    },
    /// A work routine finished.
    WorkFinished {
        /// Work label.
        label: String,
    },
    /// Teardown cancelled the timer.
    TimerCancelled {
        /// The timer was queued or running at cancellation time.
        was_active: bool,
    },
    /// Teardown killed a tasklet.
    TaskletKilled {
        /// Unit label.
        label: String,
        /// The tasklet was pending or running when killed.
        was_active: bool,
    },
    /// Teardown cancelled a work item.
    WorkCancelled {
        /// Work label.
        label: String,
        /// The work was pending when cancelled.
        was_pending: bool,
    },
    /// The workqueue was flushed and destroyed.
    WorkqueueDestroyed {
        /// Workqueue name.
        name: String,
    },
    /// Teardown completed.
    Unloaded,
}

/// A journalled event with its global sequence number.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Global, strictly increasing sequence number.
    pub seq: u64,
    /// Monotonic timestamp in milliseconds.
    pub at_ms: u64,
    /// What happened.
    pub event: ModuleEvent,
}

/// Event sink abstraction.
pub trait EventSink: Send + Sync {
    /// Record an event.
    fn record(&self, event: ModuleEvent);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn record(&self, _event: ModuleEvent) {}
}

/// In-memory journal with a bounded buffer.
#[derive(Debug)]
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<EventRecord>>,
    max_events: usize,
    next_seq: AtomicU64,
}

impl InMemoryEventSink {
    /// Create a new in-memory sink with a bounded buffer.
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(max_events.min(1024))),
            max_events,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Retrieve a snapshot of stored events.
    pub fn events(&self) -> Vec<EventRecord> {
        self.events.lock().iter().cloned().collect()
    }

    /// Snapshot of events matching a predicate.
    pub fn filter<F>(&self, mut pred: F) -> Vec<EventRecord>
    where
        F: FnMut(&ModuleEvent) -> bool,
    {
        self.events
            .lock()
            .iter()
            .filter(|r| pred(&r.event))
            .cloned()
            .collect()
    }

    /// Number of events currently held.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Whether the journal is empty.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(4096)
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: ModuleEvent) {
        let mut events = self.events.lock();
        // Sequence is taken under the lock so buffer order equals seq order.
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(EventRecord {
            seq,
            at_ms: ktime_ms(),
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn started(label: &str) -> ModuleEvent {
        ModuleEvent::WorkStarted {
            label: label.to_string(),
        }
    }

    #[test]
    fn test_in_memory_sink_orders_events() {
        let sink = InMemoryEventSink::new(10);
        sink.record(started("a"));
        sink.record(started("b"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(events[0].seq < events[1].seq);
        assert_eq!(events[1].event, started("b"));
    }

    #[test]
    fn test_sink_overflow() {
        let sink = InMemoryEventSink::new(2);
        sink.record(started("1"));
        sink.record(started("2"));
        sink.record(started("3"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, started("2")); // First one popped
        assert_eq!(events[0].seq, 1);
    }

    #[test]
    fn test_filter() {
        let sink = InMemoryEventSink::default();
        sink.record(started("w"));
        sink.record(ModuleEvent::Unloaded);
        let unloaded = sink.filter(|e| matches!(e, ModuleEvent::Unloaded));
        assert_eq!(unloaded.len(), 1);
        assert!(!sink.is_empty());
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let json = serde_json::to_value(ModuleEvent::TimerCancelled { was_active: true }).unwrap();
        assert_eq!(json["kind"], "timer_cancelled");
        assert_eq!(json["was_active"], true);
    }
}
