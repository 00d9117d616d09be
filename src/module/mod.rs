//! Module system of the supervisor
//!
//! ## Architecture
//!
//! - **Inventory**: groups, module kinds and instances owned by one object behind one lock
//! - **Lifecycle**: start, stop/kill escalation and reaping driven by the control loop
//! - **Process seam**: every OS call goes through [`ProcessSpawner`]
//! - **Service channel**: per-instance socket used to pull interface counters

pub mod interface;
pub mod inventory;
pub mod ipc;
pub mod lifecycle;
pub mod loader;
pub mod manager;
pub mod params;
pub mod process;
pub mod traits;

pub use interface::{Direction, Interface, Transport};
pub use inventory::{Group, Instance, InstanceId, Inventory, ModuleCapabilities, ModuleKind};
pub use lifecycle::Lifecycle;
pub use loader::ModuleLoader;
pub use manager::{InstanceStatus, ModuleManager, TickSummary};
pub use process::{ModuleProcessSpawner, ResourceMonitor};
pub use traits::{
    InstanceState, ModuleError, ProbeResult, ProcessHandle, ProcessSpawner, ReapStatus,
    SpawnSpec, StopSignal,
};
