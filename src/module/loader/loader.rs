//! Module loader implementation
//!
//! Builds inventory entities from the configuration tree: whole trees at
//! startup, single groups, modules or instances when a change is reconciled.
//! Instances configured with a persisted PID adopt that process when it is
//! still alive and runs the module's executable.

use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::store::ConfigStore;
use crate::config::tree::{GroupConfig, ModuleEntry, SupervisorTree};
use crate::module::inventory::{Group, Instance, InstanceId, Inventory, ModuleKind};
use crate::module::traits::{ModuleError, ProbeResult, ProcessSpawner};
use crate::reconcile::change::EntityLevel;

/// Loads configuration entities into the inventory
#[derive(Clone)]
pub struct ModuleLoader {
    spawner: Arc<dyn ProcessSpawner>,
    store: Arc<dyn ConfigStore>,
    default_max_restarts: u32,
}

impl ModuleLoader {
    pub fn new(
        spawner: Arc<dyn ProcessSpawner>,
        store: Arc<dyn ConfigStore>,
        default_max_restarts: u32,
    ) -> Self {
        Self {
            spawner,
            store,
            default_max_restarts,
        }
    }

    /// Load every group, module and instance of the tree
    ///
    /// Returns the number of instances loaded.
    pub async fn load_all(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
    ) -> Result<usize, ModuleError> {
        let before = inv.instance_count();
        for group in &tree.groups {
            self.load_group(inv, tree, &group.name).await?;
        }
        for module in &tree.modules {
            self.load_module(inv, tree, &module.name).await?;
        }
        let loaded = inv.instance_count() - before;
        info!(
            "Loaded {} groups, {} modules, {} instances",
            inv.group_count(),
            inv.module_count(),
            loaded
        );
        Ok(loaded)
    }

    /// Load an entity of the given level by name
    pub async fn load(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
        level: EntityLevel,
        name: &str,
    ) -> Result<(), ModuleError> {
        match level {
            EntityLevel::Group => self.load_group(inv, tree, name).await,
            EntityLevel::Module => self.load_module(inv, tree, name).await,
            EntityLevel::Instance => self.load_instance(inv, tree, name).await.map(|_| ()),
        }
    }

    pub async fn load_group(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
        name: &str,
    ) -> Result<(), ModuleError> {
        let group = tree
            .group(name)
            .ok_or_else(|| ModuleError::GroupNotFound(name.to_string()))?;
        Self::ensure_group(inv, group)?;
        for module in &group.modules {
            self.load_module(inv, tree, &module.name).await?;
        }
        Ok(())
    }

    pub async fn load_module(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
        name: &str,
    ) -> Result<(), ModuleError> {
        let entry = tree
            .module(name)
            .ok_or_else(|| ModuleError::ModuleNotFound(name.to_string()))?;
        Self::ensure_module(inv, entry)?;
        for instance in &entry.module.instances {
            self.load_instance(inv, tree, &instance.name).await?;
        }
        Ok(())
    }

    /// Load one instance, creating its module and group when missing
    pub async fn load_instance(
        &self,
        inv: &mut Inventory,
        tree: &SupervisorTree,
        name: &str,
    ) -> Result<InstanceId, ModuleError> {
        let (entry, config) = tree
            .instance(name)
            .ok_or_else(|| ModuleError::InstanceNotFound(name.to_string()))?;
        let kind = Self::ensure_module(inv, entry)?;

        let instance = Instance::from_config(config, &kind, self.default_max_restarts);
        let id = inv.add_instance(instance)?;
        debug!("Instance {} loaded (module {})", name, kind.name);

        if let Some(pid) = config.last_pid {
            if let Some(instance) = inv.instance_mut(id) {
                self.adopt(instance, pid, &kind.path);
            }
            if let Err(e) = self.store.set_last_pid(name, None).await {
                warn!("Failed to clear persisted PID of instance {}: {}", name, e);
            }
        }
        Ok(id)
    }

    fn ensure_group(inv: &mut Inventory, config: &GroupConfig) -> Result<(), ModuleError> {
        if inv.group(&config.name).is_none() {
            inv.add_group(Group {
                name: config.name.clone(),
                enabled: config.enabled,
            })?;
        }
        Ok(())
    }

    fn ensure_module(inv: &mut Inventory, entry: ModuleEntry<'_>) -> Result<ModuleKind, ModuleError> {
        if let Some(kind) = inv.module(&entry.module.name) {
            return Ok(kind.clone());
        }
        if let Some(group) = entry.group {
            Self::ensure_group(inv, group)?;
        }
        let kind = ModuleKind::from_config(entry.module, entry.group.map(|g| g.name.as_str()));
        inv.add_module(kind.clone())?;
        Ok(kind)
    }

    /// Take over a process left running by a previous supervisor
    fn adopt(&self, instance: &mut Instance, pid: u32, module_path: &Path) -> bool {
        let permission_denied = match self.spawner.probe(pid) {
            ProbeResult::Alive => false,
            ProbeResult::PermissionDenied => true,
            _ => {
                debug!("Persisted PID {} of instance {} is gone", pid, instance.name);
                return false;
            }
        };

        let Some(exe) = self.spawner.executable_path(pid) else {
            debug!("Cannot resolve executable of PID {}", pid);
            return false;
        };
        let matches = exe == module_path
            || std::fs::canonicalize(module_path).map_or(false, |p| p == exe);
        if !matches {
            info!(
                "PID {} runs {} instead of {}, not adopting it for instance {}",
                pid,
                exe.display(),
                module_path.display(),
                instance.name
            );
            return false;
        }

        instance.pid = Some(pid);
        instance.running = true;
        instance.is_my_child = false;
        instance.root_perm_needed = permission_denied;
        info!("Instance {} adopted running process {}", instance.name, pid);
        true
    }
}
