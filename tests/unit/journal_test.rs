//! Tests for the event journal

use deferred_work::core::{EventSink, InMemoryEventSink, ModuleEvent, NullEventSink, TaskletPriority};

fn unit_run(label: &str, iteration: i32) -> ModuleEvent {
    ModuleEvent::UnitRun {
        label: label.to_string(),
        priority: TaskletPriority::High,
        iteration,
    }
}

#[test]
fn test_in_memory_event_sink() {
    let sink = InMemoryEventSink::new(10);
    assert!(sink.is_empty());

    sink.record(ModuleEvent::Loaded { delay_ms: 1000 });
    sink.record(unit_run("Hello", 0));
    assert_eq!(sink.len(), 2);

    let events = sink.events();
    assert_eq!(events[0].event, ModuleEvent::Loaded { delay_ms: 1000 });
    assert_eq!(events[1].event, unit_run("Hello", 0));
    assert!(events[0].seq < events[1].seq);
    assert!(events[0].at_ms <= events[1].at_ms);
}

#[test]
fn test_event_sink_overflow() {
    let sink = InMemoryEventSink::new(2);

    sink.record(unit_run("Hello", 0));
    sink.record(unit_run("Hello", 1));
    sink.record(unit_run("Hello", 2));

    let events = sink.events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event, unit_run("Hello", 1)); // First one popped
    assert_eq!(events[1].seq, 2);
}

#[test]
fn test_filter_by_kind() {
    let sink = InMemoryEventSink::default();
    sink.record(ModuleEvent::TimerFired {
        restart_left: 1,
        rearmed: true,
    });
    sink.record(unit_run("Hello", 0));
    sink.record(ModuleEvent::Unloaded);

    let fired = sink.filter(|e| matches!(e, ModuleEvent::TimerFired { .. }));
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].seq, 0);
}

#[test]
fn test_events_serialize_with_kind_tag() {
    let sink = InMemoryEventSink::default();
    sink.record(ModuleEvent::WorkCancelled {
        label: "Work 1".to_string(),
        was_pending: true,
    });
    sink.record(unit_run("Hello", 1));

    let json = serde_json::to_value(sink.events()).unwrap();
    assert_eq!(json[0]["event"]["kind"], "work_cancelled");
    assert_eq!(json[0]["event"]["was_pending"], true);
    assert_eq!(json[1]["event"]["kind"], "unit_run");
    assert_eq!(json[1]["event"]["priority"], "high");
}

#[test]
fn test_null_sink_accepts_everything() {
    let sink: &dyn EventSink = &NullEventSink;
    sink.record(ModuleEvent::Unloaded);
}
