//! Tests for builder modules

use deferred_work::builders::load_module;
use deferred_work::config::ModuleConfig;
use deferred_work::core::{
    DeferredError, EventSink, InMemoryEventSink, ModuleEvent, Workqueue, WorkqueueFlags,
};
use deferred_work::module::alloc_module_workqueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn test_load_module_with_custom_factory() {
    let sink = Arc::new(InMemoryEventSink::default());
    let dyn_sink: Arc<dyn EventSink> = sink.clone();
    let calls = AtomicUsize::new(0);
    let cfg = ModuleConfig::default().with_delay_ms(10_000);

    let module = load_module(cfg, dyn_sink, |wq| {
        calls.fetch_add(1, Ordering::SeqCst);
        Workqueue::alloc(wq.name.clone(), WorkqueueFlags::HIGHPRI, 1)
    })
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(module.queue_stats().max_active, 1);
    assert_eq!(module.works().queue().name(), "Test wq");
    assert_eq!(
        sink.events()[0].event,
        ModuleEvent::Loaded { delay_ms: 10_000 }
    );
    module.unload();
}

#[test]
fn test_invalid_config_skips_factory() {
    let calls = AtomicUsize::new(0);
    let cfg = ModuleConfig::default().with_delay_ms(0);

    let err = load_module(cfg, Arc::new(InMemoryEventSink::default()), |wq| {
        calls.fetch_add(1, Ordering::SeqCst);
        alloc_module_workqueue(wq)
    })
    .unwrap_err();

    assert!(matches!(err, DeferredError::InvalidConfig(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_default_factory_uses_configured_width() {
    let cfg = ModuleConfig::default().with_max_active(3);
    let wq = alloc_module_workqueue(&cfg.workqueue).unwrap();
    assert_eq!(wq.name(), "Test wq");
    assert_eq!(wq.max_active(), 3);
    wq.destroy();
}
