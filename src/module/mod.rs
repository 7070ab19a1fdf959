//! The demonstration module: a periodic timer driving two prioritised
//! tasklets, which in turn queue an immediate and a delayed work item.
//!
//! ```text
//! TimerDriver ──(irq)──► ExecutionUnit "Hello" (high) ──┐
//!             └────────► ExecutionUnit "Bye"   (low)  ──┴─► WorkItems ─► workqueue workers
//! ```

pub mod lifecycle;
pub mod timer_driver;
pub mod unit;
pub mod work_items;

pub use lifecycle::{alloc_module_workqueue, ModuleContext, UnloadReport};
pub use timer_driver::TimerDriver;
pub use unit::{ExecutionUnit, UnitPair};
pub use work_items::{SimulatedTask, WorkItems};
