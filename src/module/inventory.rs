//! In-memory inventory of groups, module kinds and instances
//!
//! The inventory exclusively owns every entity. Collections keep insertion
//! order and allow removal from anywhere. Instances are addressed by a stable
//! [`InstanceId`]; instances refer to their module kind and group by name.

use bitflags::bitflags;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Instant;

use crate::config::tree::{InstanceConfig, ModuleConfig};
use crate::module::interface::{Direction, Interface};
use crate::module::ipc::client::ServiceClient;
use crate::module::process::monitor::ResourceUsage;
use crate::module::traits::{InstanceState, ModuleError};

/// Stable handle of an instance, never reused within one inventory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct InstanceId(u64);

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

bitflags! {
    /// What a module binary supports
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ModuleCapabilities: u8 {
        /// Answers stats requests on a private service socket
        const SERVICE = 0b0000_0001;
        /// Accepts the `-i` interface specification argument
        const IFC_SPEC = 0b0000_0010;
    }
}

/// Executable definition instances are spawned from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleKind {
    pub name: String,
    pub path: PathBuf,
    pub group: Option<String>,
    pub capabilities: ModuleCapabilities,
}

impl ModuleKind {
    pub fn from_config(config: &ModuleConfig, group: Option<&str>) -> Self {
        let mut capabilities = ModuleCapabilities::empty();
        if config.has_service {
            capabilities |= ModuleCapabilities::SERVICE;
        }
        if config.uses_ifc_spec {
            capabilities |= ModuleCapabilities::IFC_SPEC;
        }
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            group: group.map(String::from),
            capabilities,
        }
    }

    pub fn has_service(&self) -> bool {
        self.capabilities.contains(ModuleCapabilities::SERVICE)
    }

    pub fn uses_ifc_spec(&self) -> bool {
        self.capabilities.contains(ModuleCapabilities::IFC_SPEC)
    }
}

/// Configuration-level container; only cascades its enabled flag
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: String,
    pub enabled: bool,
}

/// One supervised process slot
#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    pub name: String,
    pub module: String,
    pub group: Option<String>,
    pub params: Option<String>,
    pub inputs: Vec<Interface>,
    pub outputs: Vec<Interface>,

    /// Desired state
    pub enabled: bool,
    /// Observed state
    pub running: bool,
    pub pid: Option<u32>,
    pub should_die: bool,
    pub sigint_sent: bool,
    pub sigkill_sent: bool,
    pub is_my_child: bool,
    pub root_perm_needed: bool,

    pub restarts_count: u32,
    pub restart_window_start: Option<Instant>,
    pub max_restarts_per_minute: u32,

    pub usage: ResourceUsage,

    /// Connected service channel, `None` when disconnected
    pub service: Option<ServiceClient>,
    /// Ticks counted towards the next connection attempt
    pub service_conn_timer: u64,
}

impl Instance {
    pub fn new(name: impl Into<String>, module: &ModuleKind, max_restarts_per_minute: u32) -> Self {
        Self {
            id: InstanceId(0),
            name: name.into(),
            module: module.name.clone(),
            group: module.group.clone(),
            params: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            enabled: true,
            running: false,
            pid: None,
            should_die: false,
            sigint_sent: false,
            sigkill_sent: false,
            is_my_child: false,
            root_perm_needed: false,
            restarts_count: 0,
            restart_window_start: None,
            max_restarts_per_minute,
            usage: ResourceUsage::default(),
            service: None,
            service_conn_timer: 0,
        }
    }

    /// Build from configuration; interfaces are split by direction in order
    pub fn from_config(
        config: &InstanceConfig,
        module: &ModuleKind,
        default_max_restarts: u32,
    ) -> Self {
        let mut instance = Self::new(
            config.name.clone(),
            module,
            config.max_restarts_per_minute.unwrap_or(default_max_restarts),
        );
        instance.enabled = config.enabled;
        instance.params = config.params.clone();
        for ifc in &config.interfaces {
            instance.add_interface(Interface::from_config(ifc));
        }
        instance
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn add_interface(&mut self, interface: Interface) {
        match interface.direction {
            Direction::In => self.inputs.push(interface),
            Direction::Out => self.outputs.push(interface),
        }
    }

    pub fn interfaces(&self) -> impl Iterator<Item = &Interface> {
        self.inputs.iter().chain(self.outputs.iter())
    }

    /// Lifecycle state given whether the instance is effectively enabled
    pub fn state(&self, effectively_enabled: bool) -> InstanceState {
        if self.running {
            if self.sigkill_sent {
                InstanceState::KillRequested
            } else if self.sigint_sent {
                InstanceState::StopRequested
            } else {
                InstanceState::Running
            }
        } else if effectively_enabled {
            InstanceState::Stopped
        } else {
            InstanceState::Disabled
        }
    }

    pub fn disconnect_service(&mut self) {
        self.service = None;
        self.service_conn_timer = 0;
    }

    /// Forget everything about the process that used to run
    pub fn clear_process(&mut self) {
        self.running = false;
        self.pid = None;
        self.sigint_sent = false;
        self.sigkill_sent = false;
        self.root_perm_needed = false;
        self.usage = ResourceUsage::default();
        self.disconnect_service();
    }
}

/// Owner of all groups, module kinds and instances
#[derive(Debug, Default)]
pub struct Inventory {
    groups: IndexMap<String, Group>,
    modules: IndexMap<String, ModuleKind>,
    instances: IndexMap<InstanceId, Instance>,
    by_name: HashMap<String, InstanceId>,
    next_id: u64,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: Group) -> Result<(), ModuleError> {
        if self.groups.contains_key(&group.name) {
            return Err(ModuleError::Duplicate(format!("group '{}'", group.name)));
        }
        self.groups.insert(group.name.clone(), group);
        Ok(())
    }

    pub fn add_module(&mut self, module: ModuleKind) -> Result<(), ModuleError> {
        if self.modules.contains_key(&module.name) {
            return Err(ModuleError::Duplicate(format!("module '{}'", module.name)));
        }
        if let Some(group) = &module.group {
            if !self.groups.contains_key(group) {
                return Err(ModuleError::GroupNotFound(group.clone()));
            }
        }
        self.modules.insert(module.name.clone(), module);
        Ok(())
    }

    /// Insert an instance; its module kind must already be present
    pub fn add_instance(&mut self, mut instance: Instance) -> Result<InstanceId, ModuleError> {
        if self.by_name.contains_key(&instance.name) {
            return Err(ModuleError::Duplicate(format!("instance '{}'", instance.name)));
        }
        if !self.modules.contains_key(&instance.module) {
            return Err(ModuleError::ModuleNotFound(instance.module.clone()));
        }
        self.next_id += 1;
        let id = InstanceId(self.next_id);
        instance.id = id;
        self.by_name.insert(instance.name.clone(), id);
        self.instances.insert(id, instance);
        Ok(id)
    }

    pub fn group(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn module(&self, name: &str) -> Option<&ModuleKind> {
        self.modules.get(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleKind> {
        self.modules.values()
    }

    pub fn instance(&self, id: InstanceId) -> Option<&Instance> {
        self.instances.get(&id)
    }

    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut Instance> {
        self.instances.get_mut(&id)
    }

    pub fn id_of(&self, name: &str) -> Option<InstanceId> {
        self.by_name.get(name).copied()
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&Instance> {
        self.id_of(name).and_then(|id| self.instances.get(&id))
    }

    pub fn instance_by_name_mut(&mut self, name: &str) -> Option<&mut Instance> {
        let id = self.id_of(name)?;
        self.instances.get_mut(&id)
    }

    /// Instances in insertion order
    pub fn instances(&self) -> impl Iterator<Item = &Instance> {
        self.instances.values()
    }

    pub fn instances_mut(&mut self) -> impl Iterator<Item = &mut Instance> {
        self.instances.values_mut()
    }

    /// Snapshot of all instance ids in insertion order
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.keys().copied().collect()
    }

    pub fn instances_of_module(&self, module: &str) -> Vec<InstanceId> {
        self.instances
            .values()
            .filter(|i| i.module == module)
            .map(|i| i.id)
            .collect()
    }

    pub fn modules_of_group(&self, group: &str) -> Vec<String> {
        self.modules
            .values()
            .filter(|m| m.group.as_deref() == Some(group))
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn remove_instance(&mut self, id: InstanceId) -> Option<Instance> {
        let instance = self.instances.shift_remove(&id)?;
        self.by_name.remove(&instance.name);
        Some(instance)
    }

    /// Remove a module kind; its instances must have been removed already
    pub fn remove_module(&mut self, name: &str) -> Option<ModuleKind> {
        self.modules.shift_remove(name)
    }

    pub fn remove_group(&mut self, name: &str) -> Option<Group> {
        self.groups.shift_remove(name)
    }

    /// Instance flag combined with its group's flag
    pub fn is_enabled(&self, instance: &Instance) -> bool {
        instance.enabled
            && instance
                .group
                .as_deref()
                .and_then(|g| self.groups.get(g))
                .map_or(true, |g| g.enabled)
    }

    pub fn instance_state(&self, id: InstanceId) -> Option<InstanceState> {
        self.instances
            .get(&id)
            .map(|i| i.state(self.is_enabled(i)))
    }

    /// Names and PIDs of every running instance
    pub fn running_pids(&self) -> Vec<(String, u32)> {
        self.instances
            .values()
            .filter(|i| i.running)
            .filter_map(|i| i.pid.map(|pid| (i.name.clone(), pid)))
            .collect()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
