//! Module Supervisor - keeps configured module instances running
//!
//! This crate supervises a set of long-running module processes declared in a
//! hierarchical configuration (groups → modules → instances → interfaces).
//!
//! ## Components
//!
//! 1. **Lifecycle controller** ([`module::lifecycle`]): restart policy, SIGINT/SIGKILL
//!    escalation, reaping and socket cleanup
//! 2. **Reconciliation engine** ([`reconcile`]): configuration edits become coalesced
//!    restart/delete actions
//! 3. **Interface graph** ([`graph`]): producer/consumer links, duplicate binds and DOT export
//!
//! The control loop and the reconciler share the inventory through one mutex;
//! see [`module::manager::ModuleManager`].

pub mod config;
pub mod graph;
pub mod module;
pub mod reconcile;
pub mod utils;

pub use config::store::{ConfigStore, MemoryConfigStore};
pub use config::tree::SupervisorTree;
pub use config::SupervisorConfig;
pub use graph::InterfaceGraph;
pub use module::{ModuleError, ModuleManager};
