//! Tests for error types

use deferred_work::core::DeferredError;
use std::error::Error;

#[test]
fn test_invalid_config_error() {
    let err = DeferredError::InvalidConfig("delay_ms must be greater than 0".to_string());
    assert_eq!(
        format!("{}", err),
        "invalid configuration: delay_ms must be greater than 0"
    );
}

#[test]
fn test_workqueue_alloc_error() {
    let err = DeferredError::WorkqueueAlloc {
        name: "Test wq".to_string(),
        reason: "out of memory".to_string(),
    };
    assert_eq!(
        format!("{}", err),
        "workqueue `Test wq` allocation failed: out of memory"
    );
    assert!(err.source().is_none());
}

#[test]
fn test_thread_spawn_error_keeps_source() {
    let err = DeferredError::ThreadSpawn {
        name: "ksoftirqd/0".to_string(),
        source: std::io::Error::new(std::io::ErrorKind::OutOfMemory, "no threads left"),
    };
    assert_eq!(
        format!("{}", err),
        "failed to spawn thread `ksoftirqd/0`: no threads left"
    );
    assert!(err.source().is_some());
}

#[test]
fn test_runtime_error() {
    let err = DeferredError::Runtime(std::io::Error::other("epoll unavailable"));
    assert_eq!(
        format!("{}", err),
        "failed to build worker runtime: epoll unavailable"
    );
}

#[test]
fn test_converts_into_anyhow() {
    let result: deferred_work::core::AppResult<()> =
        Err(DeferredError::InvalidConfig("loops".to_string()).into());
    let err = result.unwrap_err();
    assert!(err.downcast_ref::<DeferredError>().is_some());
}
