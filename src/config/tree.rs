//! Desired-state configuration tree
//!
//! The tree the configuration store holds: optional groups of modules,
//! ungrouped modules, their instances and the instances' interfaces.
//! Field names are kebab-case so they match the leaf names that appear in
//! change paths (`last-pid`, `max-restarts-per-minute`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::module::interface::{Direction, Transport};
use crate::module::traits::ModuleError;

fn default_true() -> bool {
    true
}

/// Whole desired state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SupervisorTree {
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
    /// Modules that do not belong to any group
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GroupConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ModuleConfig {
    pub name: String,
    pub path: PathBuf,
    /// Module answers stats requests on its service socket
    #[serde(default)]
    pub has_service: bool,
    /// Module accepts the `-i` interface specification argument
    #[serde(default = "default_true")]
    pub uses_ifc_spec: bool,
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstanceConfig {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_restarts_per_minute: Option<u32>,
    /// PID persisted by a previous supervisor run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_pid: Option<u32>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InterfaceConfig {
    pub name: String,
    pub direction: Direction,
    #[serde(flatten)]
    pub transport: Transport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub buffer: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoflush: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

/// A module found in the tree together with the group holding it
#[derive(Debug, Clone, Copy)]
pub struct ModuleEntry<'a> {
    pub group: Option<&'a GroupConfig>,
    pub module: &'a ModuleConfig,
}

impl SupervisorTree {
    /// Load from a JSON or TOML file, chosen by extension
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let tree = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::from_str(&content)?,
            _ => serde_json::from_str(&content)?,
        };
        Ok(tree)
    }

    /// Write to a JSON or TOML file, chosen by extension
    pub fn to_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => toml::to_string_pretty(self)?,
            _ => serde_json::to_string_pretty(self)?,
        };
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn group(&self, name: &str) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.name == name)
    }

    /// Every module in tree order: grouped modules first, then ungrouped
    pub fn module_entries(&self) -> impl Iterator<Item = ModuleEntry<'_>> {
        self.groups
            .iter()
            .flat_map(|g| {
                g.modules.iter().map(move |m| ModuleEntry {
                    group: Some(g),
                    module: m,
                })
            })
            .chain(self.modules.iter().map(|m| ModuleEntry {
                group: None,
                module: m,
            }))
    }

    pub fn module(&self, name: &str) -> Option<ModuleEntry<'_>> {
        self.module_entries().find(|e| e.module.name == name)
    }

    /// Find an instance by its (globally unique) name
    pub fn instance(&self, name: &str) -> Option<(ModuleEntry<'_>, &InstanceConfig)> {
        self.module_entries().find_map(|entry| {
            entry
                .module
                .instances
                .iter()
                .find(|i| i.name == name)
                .map(|i| (entry, i))
        })
    }

    pub fn instance_mut(&mut self, name: &str) -> Option<&mut InstanceConfig> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.modules.iter_mut())
            .chain(self.modules.iter_mut())
            .flat_map(|m| m.instances.iter_mut())
            .find(|i| i.name == name)
    }

    /// Check name uniqueness and transport parameters
    pub fn validate(&self) -> Result<(), ModuleError> {
        let mut groups = HashSet::new();
        for group in &self.groups {
            if !groups.insert(group.name.as_str()) {
                return Err(ModuleError::Duplicate(format!("group '{}'", group.name)));
            }
        }

        let mut modules = HashSet::new();
        let mut instances = HashSet::new();
        for entry in self.module_entries() {
            let module = entry.module;
            if !modules.insert(module.name.as_str()) {
                return Err(ModuleError::Duplicate(format!("module '{}'", module.name)));
            }
            if module.path.as_os_str().is_empty() {
                return Err(ModuleError::InvalidConfig(format!(
                    "module '{}' has an empty path",
                    module.name
                )));
            }
            for instance in &module.instances {
                if !instances.insert(instance.name.as_str()) {
                    return Err(ModuleError::Duplicate(format!(
                        "instance '{}'",
                        instance.name
                    )));
                }
                for ifc in &instance.interfaces {
                    validate_interface(&instance.name, ifc)?;
                }
            }
        }
        Ok(())
    }
}

fn validate_interface(instance: &str, ifc: &InterfaceConfig) -> Result<(), ModuleError> {
    let problem = match &ifc.transport {
        Transport::Tcp(p) if p.port == 0 => Some("TCP port must be non-zero"),
        Transport::TcpTls(p) if p.port == 0 => Some("TCP-TLS port must be non-zero"),
        Transport::TcpTls(p)
            if p.keyfile.is_empty() || p.certfile.is_empty() || p.cafile.is_empty() =>
        {
            Some("TCP-TLS needs keyfile, certfile and cafile")
        }
        Transport::Unix(p) if p.socket_name.is_empty() => Some("socket name must not be empty"),
        Transport::File(p) if p.path.is_empty() => Some("file path must not be empty"),
        _ => None,
    };
    match problem {
        Some(msg) => Err(ModuleError::InvalidConfig(format!(
            "instance '{}' interface '{}': {}",
            instance, ifc.name, msg
        ))),
        None => Ok(()),
    }
}
