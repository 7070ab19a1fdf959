//! Module configuration structures.
//!
//! The two module tunables, `restart` and `delay_ms`, are read once at load
//! time. Everything else keeps its built-in default unless a
//! JSON document overrides them.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable overriding [`ModuleConfig::restart`].
pub const ENV_RESTART: &str = "DEFERRED_RESTART";
/// Environment variable overriding [`ModuleConfig::delay_ms`].
pub const ENV_DELAY_MS: &str = "DEFERRED_DELAY_MS";
/// Environment variable overriding [`WorkqueueConfig::max_active`].
pub const ENV_MAX_ACTIVE: &str = "DEFERRED_MAX_ACTIVE";

/// Configuration of one tasklet-backed execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitConfig {
    /// Label printed on every run.
    pub label: String,
    /// Runs per timer firing.
    pub loops: i32,
}

/// Configuration of one work item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkConfig {
    /// Label printed on start and finish.
    pub label: String,
    /// Simulated execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Queueing delay in milliseconds; only used by the delayed item.
    #[serde(default)]
    pub delay_ms: u64,
}

impl WorkConfig {
    /// Simulated execution time.
    pub const fn execution_time(&self) -> Duration {
        Duration::from_millis(self.execution_time_ms)
    }

    /// Queueing delay.
    pub const fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// Workqueue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkqueueConfig {
    /// Workqueue name.
    pub name: String,
    /// Worker threads; 0 selects one per CPU.
    pub max_active: usize,
}

/// Root module configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Timer firings before it stops re-arming. Values below 1 still give
    /// one firing.
    pub restart: i32,
    /// Timer interval and first-fire delay in milliseconds.
    pub delay_ms: u64,
    /// High-priority unit.
    pub high: UnitConfig,
    /// Low-priority unit.
    pub low: UnitConfig,
    /// Immediate work item.
    pub work: WorkConfig,
    /// Delayed work item.
    pub delayed_work: WorkConfig,
    /// Module workqueue.
    pub workqueue: WorkqueueConfig,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            restart: 2,
            delay_ms: 1000,
            high: UnitConfig {
                label: "Hello".into(),
                loops: 2,
            },
            low: UnitConfig {
                label: "Bye".into(),
                loops: 2,
            },
            work: WorkConfig {
                label: "Work 1".into(),
                execution_time_ms: 200,
                delay_ms: 0,
            },
            delayed_work: WorkConfig {
                label: "Work2 (delayed)".into(),
                execution_time_ms: 300,
                delay_ms: 100,
            },
            workqueue: WorkqueueConfig {
                name: "Test wq".into(),
                max_active: 4,
            },
        }
    }
}

impl UnitConfig {
    fn validate(&self) -> Result<(), String> {
        if self.label.is_empty() {
            return Err("label must not be empty".into());
        }
        if self.loops < 1 {
            return Err("loops must be at least 1".into());
        }
        Ok(())
    }
}

impl ModuleConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the restart budget.
    #[must_use]
    pub const fn with_restart(mut self, restart: i32) -> Self {
        self.restart = restart;
        self
    }

    /// Set the timer interval.
    #[must_use]
    pub const fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    /// Set the loops of both units.
    #[must_use]
    pub const fn with_loops(mut self, loops: i32) -> Self {
        self.high.loops = loops;
        self.low.loops = loops;
        self
    }

    /// Set the simulated execution times of both work items.
    #[must_use]
    pub const fn with_execution_times(mut self, work_ms: u64, delayed_work_ms: u64) -> Self {
        self.work.execution_time_ms = work_ms;
        self.delayed_work.execution_time_ms = delayed_work_ms;
        self
    }

    /// Set the delay of the delayed work item.
    #[must_use]
    pub const fn with_work_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delayed_work.delay_ms = delay_ms;
        self
    }

    /// Set the number of workqueue workers.
    #[must_use]
    pub const fn with_max_active(mut self, max_active: usize) -> Self {
        self.workqueue.max_active = max_active;
        self
    }

    /// Timer interval.
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Upper bound on how long one load runs: every firing, plus the
    /// delayed-work delay and both execution times. Saturates at
    /// `u64::MAX` milliseconds.
    pub fn run_time(&self) -> Duration {
        let firings = u64::try_from(self.restart.max(1)).unwrap_or(1);
        Duration::from_millis(
            self.delay_ms
                .saturating_mul(firings.saturating_add(1))
                .saturating_add(self.delayed_work.delay_ms)
                .saturating_add(self.work.execution_time_ms)
                .saturating_add(self.delayed_work.execution_time_ms),
        )
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.delay_ms == 0 {
            return Err("delay_ms must be greater than 0".into());
        }
        self.high
            .validate()
            .map_err(|e| format!("high unit invalid: {e}"))?;
        self.low
            .validate()
            .map_err(|e| format!("low unit invalid: {e}"))?;
        if self.work.label.is_empty() || self.delayed_work.label.is_empty() {
            return Err("work labels must not be empty".into());
        }
        if self.workqueue.name.trim().is_empty() {
            return Err("workqueue name must not be empty".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `DEFERRED_*` environment variables, after
    /// loading a `.env` file if one exists.
    pub fn from_env() -> Result<Self, String> {
        let _ = dotenvy::dotenv();
        Self::default().with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up through `lookup` and validate.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_RESTART) {
            self.restart = raw
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_RESTART}: {e}"))?;
        }
        if let Some(raw) = lookup(ENV_DELAY_MS) {
            self.delay_ms = raw
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_DELAY_MS}: {e}"))?;
        }
        if let Some(raw) = lookup(ENV_MAX_ACTIVE) {
            self.workqueue.max_active = raw
                .trim()
                .parse()
                .map_err(|e| format!("{ENV_MAX_ACTIVE}: {e}"))?;
        }
        self.validate()?;
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ModuleConfig::default();
        assert_eq!(cfg.restart, 2);
        assert_eq!(cfg.delay_ms, 1000);
        assert_eq!(cfg.high.label, "Hello");
        assert_eq!(cfg.low.label, "Bye");
        assert_eq!(cfg.delayed_work.delay(), Duration::from_millis(100));
        assert_eq!(cfg.workqueue.max_active, 4);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let cfg = ModuleConfig::default()
            .with_env_overrides(|key| match key {
                ENV_RESTART => Some("5".into()),
                ENV_DELAY_MS => Some(" 250 ".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(cfg.restart, 5);
        assert_eq!(cfg.delay_ms, 250);
        assert_eq!(cfg.workqueue.max_active, 4);
    }

    #[test]
    fn test_env_override_parse_error() {
        let err = ModuleConfig::default()
            .with_env_overrides(|key| (key == ENV_DELAY_MS).then(|| "soon".to_string()))
            .unwrap_err();
        assert!(err.starts_with(ENV_DELAY_MS));
    }
}
