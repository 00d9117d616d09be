//! Configuration change reconciliation
//!
//! Turns batches of configuration-store edits into restart and delete
//! actions on groups, modules and instances.

pub mod change;
pub mod engine;
pub mod registry;

pub use change::{
    classify_path, resolve_action, ChangeAction, ChangeOperation, ChangeRecord, ChangeTarget,
    EntityKey, EntityLevel,
};
pub use engine::Reconciler;
pub use registry::{ChangeRegistry, PendingChange, Registration};
