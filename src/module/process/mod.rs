//! Process management for instances
//!
//! Spawning and signalling through the OS, and procfs resource sampling.

pub mod monitor;
pub mod spawner;

pub use monitor::{ResourceMonitor, ResourceUsage};
pub use spawner::ModuleProcessSpawner;
