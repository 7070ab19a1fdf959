//! Error types for deferred-execution primitives.

use thiserror::Error;

/// Errors produced while creating primitives or loading the module.
///
/// Steady-state operations (scheduling a tasklet, queueing work) never fail;
/// they report coalescing through a `bool` instead.
#[derive(Debug, Error)]
pub enum DeferredError {
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    /// An OS thread backing a primitive could not be spawned.
    #[error("failed to spawn thread `{name}`: {source}")]
    ThreadSpawn {
        /// Name of the thread that failed to start.
        name: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A worker runtime could not be built.
    #[error("failed to build worker runtime: {0}")]
    Runtime(#[source] std::io::Error),
    /// Workqueue allocation failed.
    #[error("workqueue `{name}` allocation failed: {reason}")]
    WorkqueueAlloc {
        /// Requested workqueue name.
        name: String,
        /// Why allocation failed.
        reason: String,
    },
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
