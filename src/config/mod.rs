//! Configuration models for the module, its units and its workqueue.

pub mod module;

pub use module::{
    ModuleConfig, UnitConfig, WorkConfig, WorkqueueConfig, ENV_DELAY_MS, ENV_MAX_ACTIVE,
    ENV_RESTART,
};
