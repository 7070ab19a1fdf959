//! # Deferred Work
//!
//! Deferred-execution primitives in the style of an operating-system kernel,
//! plus a small module that exercises them together.
//!
//! ## Primitives
//!
//! - **`HrTimer`**: a high-resolution timer whose callback decides whether
//!   it restarts, with drift-free `forward_now` for periodic use
//! - **`Tasklet`**: non-sleeping deferred work on a softirq dispatcher, with
//!   a high tier that is always dispatched before the normal tier
//! - **`Workqueue`**: dedicated worker threads running sleep-capable `Work`
//!   and `DelayedWork` items, with coalescing and synchronous cancellation
//!
//! ## The module
//!
//! `ModuleContext` owns one instance of each primitive:
//!
//! 1. A timer fires every `delay_ms`, `restart` times in total.
//! 2. Each firing resets and schedules two tasklets: "Bye" on the normal
//!    tier first, then "Hello" on the high tier. "Hello" still runs first.
//! 3. Each tasklet runs `loops` times per firing and queues one immediate
//!    and one delayed work item on every run.
//! 4. Unloading cancels the timer, kills the tasklets, cancels both work
//!    items, flushes and destroys the workqueue, in that order.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use deferred_work::config::ModuleConfig;
//! use deferred_work::core::InMemoryEventSink;
//! use deferred_work::module::ModuleContext;
//!
//! let journal = Arc::new(InMemoryEventSink::default());
//! let module = ModuleContext::load_with_sink(ModuleConfig::default(), journal.clone())?;
//!
//! std::thread::sleep(Duration::from_secs(3));
//! let report = module.unload();
//! println!("timer still in use: {}", report.timer_was_active);
//! println!("{} events journalled", journal.len());
//! # Ok::<(), deferred_work::core::DeferredError>(())
//! ```
//!
//! Logging goes through `tracing`; call `util::init_tracing` or install your
//! own subscriber. Verbose lines are emitted at `debug` level.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Timer, tasklet and workqueue primitives, errors and the event journal.
pub mod core;
/// Configuration models for the module.
pub mod config;
/// Builders to construct a loaded module from configuration.
pub mod builders;
/// The demonstration module built on the primitives.
pub mod module;
/// Shared utilities.
pub mod util;
