//! Builders to construct a loaded module from configuration.

pub mod module_builder;

pub use module_builder::load_module;
