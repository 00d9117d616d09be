//! Module loading system
//!
//! Turns the configuration tree into inventory entities.

pub mod loader;

pub use loader::ModuleLoader;
