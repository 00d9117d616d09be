//! Reconciliation of configuration changes
//!
//! Each change batch is classified and coalesced into a [`ChangeRegistry`],
//! then applied newest entry first: restarts stop and remove the entity and
//! load it again from the store, deletions only stop and remove. The whole
//! batch runs under the inventory lock, so the control loop never observes a
//! half-applied batch.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::store::{ChangeBatch, ConfigStore};
use crate::config::tree::SupervisorTree;
use crate::module::inventory::Inventory;
use crate::module::lifecycle::Lifecycle;
use crate::module::loader::ModuleLoader;
use crate::module::traits::ModuleError;
use crate::reconcile::change::{
    classify_path, resolve_action, ChangeAction, ChangeRecord, ChangeTarget, EntityLevel,
};
use crate::reconcile::registry::{ChangeRegistry, PendingChange};

/// Applies change batches to the inventory
#[derive(Clone)]
pub struct Reconciler {
    inventory: Arc<Mutex<Inventory>>,
    lifecycle: Lifecycle,
    loader: ModuleLoader,
    store: Arc<dyn ConfigStore>,
}

impl Reconciler {
    pub fn new(
        inventory: Arc<Mutex<Inventory>>,
        lifecycle: Lifecycle,
        loader: ModuleLoader,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            inventory,
            lifecycle,
            loader,
            store,
        }
    }

    /// Consume batches until the store drops the channel
    pub async fn run(self, mut changes: mpsc::UnboundedReceiver<ChangeBatch>) {
        info!("Reconciler started");
        while let Some(mut batch) = changes.recv().await {
            let records = std::mem::take(&mut batch.records);
            let result = self.handle_batch(&records).await;
            if let Err(e) = &result {
                error!("Failed to apply configuration change: {}", e);
            }
            batch.respond(result);
        }
        info!("Reconciler stopped");
    }

    /// Classify, coalesce and apply one batch
    pub async fn handle_batch(&self, records: &[ChangeRecord]) -> Result<(), ModuleError> {
        let tree = self.store.load_tree().await?;
        let mut inv = self.inventory.lock().await;

        let registry = Self::build_registry(&inv, &tree, records);
        if registry.is_empty() {
            debug!("Change batch of {} records needs no action", records.len());
            return Ok(());
        }
        self.apply(&mut inv, &tree, registry).await
    }

    /// Coalesced registry of every actionable record
    pub fn build_registry(
        inv: &Inventory,
        tree: &SupervisorTree,
        records: &[ChangeRecord],
    ) -> ChangeRegistry {
        let mut registry = ChangeRegistry::new();
        for record in records {
            let mut target = match classify_path(&record.path) {
                Ok(Some(target)) => target,
                Ok(None) => {
                    debug!("Ignoring change outside any entity: {}", record.path);
                    continue;
                }
                Err(e) => {
                    warn!("Ignoring change: {}", e);
                    continue;
                }
            };

            let action = resolve_action(record.operation, &target);
            if action == ChangeAction::None {
                debug!("No action for {:?} {}", record.operation, record.path);
                continue;
            }

            complete_ancestry(inv, tree, &mut target);
            registry.register(PendingChange {
                operation: record.operation,
                target,
                action,
            });
        }
        registry
    }

    /// Apply the registry, newest entry first
    ///
    /// A failed reload stops the pass; the entries registered before the
    /// failing one are left unapplied.
    pub async fn apply(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
        registry: ChangeRegistry,
    ) -> Result<(), ModuleError> {
        let entries = registry.into_entries();
        let total = entries.len();

        for (applied, change) in entries.iter().rev().enumerate() {
            let level = change.target.level;
            let name = change.target.name();

            info!("Applying {} of {} '{}'", change.action, level, name);
            self.stop_and_remove(inv, level, name).await;

            if change.action == ChangeAction::Restart {
                if let Err(e) = self.loader.load(inv, tree, level, name).await {
                    error!(
                        "Reloading {} '{}' failed, {} earlier changes not applied",
                        level,
                        name,
                        total - applied - 1
                    );
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    async fn stop_and_remove(&self, inv: &mut Inventory, level: EntityLevel, name: &str) -> bool {
        match level {
            EntityLevel::Instance => self.lifecycle.stop_and_remove_instance(inv, name).await,
            EntityLevel::Module => self.lifecycle.stop_and_remove_module(inv, name).await,
            EntityLevel::Group => self.lifecycle.stop_and_remove_group(inv, name).await,
        }
    }
}

/// Fill unknown group/module names of a target from the inventory, then the tree
fn complete_ancestry(inv: &Inventory, tree: &SupervisorTree, target: &mut ChangeTarget) {
    let key = &mut target.key;
    match target.level {
        EntityLevel::Instance => {
            let Some(name) = key.instance.clone() else {
                return;
            };
            if key.module.is_none() {
                key.module = inv
                    .instance_by_name(&name)
                    .map(|i| i.module.clone())
                    .or_else(|| tree.instance(&name).map(|(e, _)| e.module.name.clone()));
            }
            if key.group.is_none() {
                key.group = inv
                    .instance_by_name(&name)
                    .and_then(|i| i.group.clone())
                    .or_else(|| {
                        tree.instance(&name)
                            .and_then(|(e, _)| e.group.map(|g| g.name.clone()))
                    });
            }
        }
        EntityLevel::Module => {
            let Some(name) = key.module.clone() else {
                return;
            };
            if key.group.is_none() {
                key.group = inv
                    .module(&name)
                    .and_then(|m| m.group.clone())
                    .or_else(|| tree.module(&name).and_then(|e| e.group.map(|g| g.name.clone())));
            }
        }
        EntityLevel::Group => {}
    }
}
