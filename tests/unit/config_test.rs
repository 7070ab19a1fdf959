//! Tests for configuration validation

use deferred_work::config::{ModuleConfig, ENV_DELAY_MS, ENV_MAX_ACTIVE, ENV_RESTART};
use std::time::Duration;

#[test]
fn test_module_config_validation() {
    let valid = ModuleConfig::default();
    assert!(valid.validate().is_ok());
    assert_eq!(valid.interval(), Duration::from_secs(1));
}

#[test]
fn test_module_config_invalid_delay() {
    let invalid = ModuleConfig::default().with_delay_ms(0);
    assert!(invalid.validate().is_err());
}

#[test]
fn test_module_config_invalid_loops() {
    let invalid = ModuleConfig::default().with_loops(0);
    let err = invalid.validate().unwrap_err();
    assert!(err.contains("high unit invalid"));
}

#[test]
fn test_module_config_empty_labels() {
    let mut invalid = ModuleConfig::default();
    invalid.low.label.clear();
    assert!(invalid.validate().is_err());

    let mut invalid = ModuleConfig::default();
    invalid.delayed_work.label.clear();
    assert!(invalid.validate().is_err());

    let mut invalid = ModuleConfig::default();
    invalid.workqueue.name = " ".to_string();
    assert!(invalid.validate().is_err());
}

#[test]
fn test_non_positive_restart_is_accepted() {
    let cfg = ModuleConfig::default().with_restart(-3);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_run_time_covers_every_firing() {
    let cfg = ModuleConfig::default()
        .with_restart(2)
        .with_delay_ms(100)
        .with_execution_times(10, 20)
        .with_work_delay_ms(5);
    assert_eq!(cfg.run_time(), Duration::from_millis(335));

    // Non-positive budgets still fire once.
    let once = cfg.clone().with_restart(-4);
    assert_eq!(once.run_time(), Duration::from_millis(235));
}

#[test]
fn test_run_time_saturates_on_huge_values() {
    let cfg = ModuleConfig::default()
        .with_restart(i32::MAX)
        .with_delay_ms(u64::MAX)
        .with_execution_times(u64::MAX, u64::MAX)
        .with_work_delay_ms(u64::MAX);
    assert_eq!(cfg.run_time(), Duration::from_millis(u64::MAX));
}

#[test]
fn test_partial_json_keeps_defaults() {
    let cfg = ModuleConfig::from_json_str(r#"{"restart": 5, "delay_ms": 250}"#).unwrap();
    assert_eq!(cfg.restart, 5);
    assert_eq!(cfg.delay_ms, 250);
    assert_eq!(cfg.high.label, "Hello");
    assert_eq!(cfg.delayed_work.delay(), Duration::from_millis(100));
}

#[test]
fn test_json_nested_override() {
    let cfg = ModuleConfig::from_json_str(
        r#"{"work": {"label": "Flush", "execution_time_ms": 5}, "workqueue": {"name": "io", "max_active": 2}}"#,
    )
    .unwrap();
    assert_eq!(cfg.work.label, "Flush");
    assert_eq!(cfg.work.execution_time(), Duration::from_millis(5));
    assert_eq!(cfg.work.delay_ms, 0);
    assert_eq!(cfg.workqueue.max_active, 2);
}

#[test]
fn test_json_rejects_invalid_values() {
    let err = ModuleConfig::from_json_str(r#"{"delay_ms": 0}"#).unwrap_err();
    assert!(err.contains("delay_ms"));

    let err = ModuleConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_env_overrides_all_tunables() {
    let cfg = ModuleConfig::default()
        .with_env_overrides(|key| match key {
            k if k == ENV_RESTART => Some("7".to_string()),
            k if k == ENV_DELAY_MS => Some(" 20 ".to_string()),
            k if k == ENV_MAX_ACTIVE => Some("0".to_string()),
            _ => None,
        })
        .unwrap();
    assert_eq!(cfg.restart, 7);
    assert_eq!(cfg.delay_ms, 20);
    assert_eq!(cfg.workqueue.max_active, 0);
}

#[test]
fn test_env_rejects_garbage() {
    let err = ModuleConfig::default()
        .with_env_overrides(|key| (key == ENV_RESTART).then(|| "twice".to_string()))
        .unwrap_err();
    assert!(err.starts_with(ENV_RESTART));
}
