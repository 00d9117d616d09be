//! Change records and their classification
//!
//! A change record names one edit of the configuration tree by path, e.g.
//! `/supervisor/group[name='g']/module[name='m']/instance[name='i']/enabled`.
//! Classification finds the deepest named entity on the path and the leaf
//! below it; the action policy turns that into restart/delete/nothing.

use serde::{Deserialize, Serialize};

use crate::module::traits::ModuleError;

/// Root node of the supervisor's namespace
pub const ROOT_NODE: &str = "supervisor";

/// Leaf holding a PID persisted for adoption
pub const LAST_PID_LEAF: &str = "last-pid";

const GROUP_NODES: &[&str] = &["group", "module-group"];
const MODULE_NODES: &[&str] = &["module", "available-module"];
const INSTANCE_NODES: &[&str] = &["instance"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeOperation {
    Created,
    Modified,
    Deleted,
    Moved,
}

/// One edit reported by the configuration store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: ChangeOperation,
    pub path: String,
    #[serde(default)]
    pub old_value: Option<serde_json::Value>,
    #[serde(default)]
    pub new_value: Option<serde_json::Value>,
}

impl ChangeRecord {
    pub fn new(operation: ChangeOperation, path: impl Into<String>) -> Self {
        Self {
            operation,
            path: path.into(),
            old_value: None,
            new_value: None,
        }
    }

    pub fn with_values(
        mut self,
        old_value: Option<serde_json::Value>,
        new_value: Option<serde_json::Value>,
    ) -> Self {
        self.old_value = old_value;
        self.new_value = new_value;
        self
    }
}

/// Hierarchy level; ordering is coarseness (`Group` is the coarsest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EntityLevel {
    Instance,
    Module,
    Group,
}

impl std::fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityLevel::Instance => f.write_str("instance"),
            EntityLevel::Module => f.write_str("module"),
            EntityLevel::Group => f.write_str("group"),
        }
    }
}

/// Identity path of an entity; components above the entity may be unknown
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub group: Option<String>,
    pub module: Option<String>,
    pub instance: Option<String>,
}

impl EntityKey {
    /// Name component belonging to `level`
    pub fn name_at(&self, level: EntityLevel) -> Option<&str> {
        match level {
            EntityLevel::Group => self.group.as_deref(),
            EntityLevel::Module => self.module.as_deref(),
            EntityLevel::Instance => self.instance.as_deref(),
        }
    }
}

/// Classified target of a change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeTarget {
    pub level: EntityLevel,
    pub key: EntityKey,
    /// First node below the entity, when the edit is not on the entity itself
    pub leaf: Option<String>,
}

impl ChangeTarget {
    /// Name of the targeted entity
    pub fn name(&self) -> &str {
        self.key.name_at(self.level).unwrap_or_default()
    }

    pub fn same_entity(&self, other: &ChangeTarget) -> bool {
        self.level == other.level && self.name() == other.name()
    }

    /// Whether `other` lies strictly below this target in the hierarchy
    pub fn covers(&self, other: &ChangeTarget) -> bool {
        if self.level <= other.level {
            return false;
        }
        match other.key.name_at(self.level) {
            Some(name) => name == self.name(),
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeAction {
    None,
    Restart,
    Delete,
}

impl std::fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeAction::None => f.write_str("none"),
            ChangeAction::Restart => f.write_str("restart"),
            ChangeAction::Delete => f.write_str("delete"),
        }
    }
}

/// Action policy for a classified change
pub fn resolve_action(operation: ChangeOperation, target: &ChangeTarget) -> ChangeAction {
    let is_last_pid =
        target.level == EntityLevel::Instance && target.leaf.as_deref() == Some(LAST_PID_LEAF);

    match operation {
        ChangeOperation::Moved => ChangeAction::None,
        _ if is_last_pid => ChangeAction::None,
        ChangeOperation::Created | ChangeOperation::Modified => ChangeAction::Restart,
        ChangeOperation::Deleted => ChangeAction::Delete,
    }
}

/// One `/`-separated node of a change path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSegment {
    /// Node name with any `prefix:` namespace stripped
    pub node: String,
    /// Value of the list key predicate (`[name='value']`)
    pub key: Option<String>,
}

/// Split a change path into segments
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>, ModuleError> {
    let invalid = |msg: &str| ModuleError::InvalidChangePath(format!("{}: {}", msg, path));

    let rest = path
        .strip_prefix('/')
        .ok_or_else(|| invalid("path must be absolute"))?;
    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();

    while chars.peek().is_some() {
        let mut node = String::new();
        let mut key = None;

        while let Some(&c) = chars.peek() {
            if c == '/' || c == '[' {
                break;
            }
            node.push(c);
            chars.next();
        }

        if chars.peek() == Some(&'[') {
            chars.next();
            let mut key_name = String::new();
            loop {
                match chars.next() {
                    Some('=') => break,
                    Some(c) => key_name.push(c),
                    None => return Err(invalid("unterminated key predicate")),
                }
            }
            let quote = match chars.next() {
                Some(q @ ('\'' | '"')) => q,
                _ => return Err(invalid("key value must be quoted")),
            };
            let mut value = String::new();
            loop {
                match chars.next() {
                    Some(c) if c == quote => break,
                    Some(c) => value.push(c),
                    None => return Err(invalid("unterminated key value")),
                }
            }
            if chars.next() != Some(']') {
                return Err(invalid("expected ']' after key value"));
            }
            if key_name.trim().is_empty() {
                return Err(invalid("empty key name"));
            }
            key = Some(value);
        }

        match chars.next() {
            None | Some('/') => {}
            Some(_) => return Err(invalid("unexpected character after key predicate")),
        }

        let node = match node.split_once(':') {
            Some((_, local)) => local.to_string(),
            None => node,
        };
        if node.is_empty() {
            return Err(invalid("empty node name"));
        }
        segments.push(PathSegment { node, key });
    }

    if segments.is_empty() {
        return Err(invalid("empty path"));
    }
    Ok(segments)
}

/// Classify a change path
///
/// Returns `Ok(None)` for paths inside the namespace that do not touch any
/// group, module or instance.
pub fn classify_path(path: &str) -> Result<Option<ChangeTarget>, ModuleError> {
    let segments = parse_path(path)?;
    let (root, rest) = segments
        .split_first()
        .ok_or_else(|| ModuleError::InvalidChangePath(path.to_string()))?;
    if root.node != ROOT_NODE {
        return Err(ModuleError::InvalidChangePath(format!(
            "path outside the '{}' namespace: {}",
            ROOT_NODE, path
        )));
    }

    let mut key = EntityKey::default();
    let mut level = None;
    let mut leaf = None;

    for segment in rest {
        let segment_level = if GROUP_NODES.contains(&segment.node.as_str()) {
            Some(EntityLevel::Group)
        } else if MODULE_NODES.contains(&segment.node.as_str()) {
            Some(EntityLevel::Module)
        } else if INSTANCE_NODES.contains(&segment.node.as_str()) {
            Some(EntityLevel::Instance)
        } else {
            None
        };

        match segment_level {
            Some(entity_level) => {
                let name = segment.key.clone().ok_or_else(|| {
                    ModuleError::InvalidChangePath(format!(
                        "{} node without name key: {}",
                        entity_level, path
                    ))
                })?;
                match entity_level {
                    EntityLevel::Group => key.group = Some(name),
                    EntityLevel::Module => key.module = Some(name),
                    EntityLevel::Instance => key.instance = Some(name),
                }
                level = Some(entity_level);
            }
            None => {
                if level.is_some() {
                    leaf = Some(segment.node.clone());
                }
                break;
            }
        }
    }

    Ok(level.map(|level| ChangeTarget { level, key, leaf }))
}

fn quoted(name: &str) -> String {
    if name.contains('\'') {
        format!("\"{}\"", name)
    } else {
        format!("'{}'", name)
    }
}

/// Path of an entity node
pub fn entity_path(group: Option<&str>, module: Option<&str>, instance: Option<&str>) -> String {
    let mut path = format!("/{}", ROOT_NODE);
    if let Some(group) = group {
        path.push_str(&format!("/group[name={}]", quoted(group)));
    }
    if let Some(module) = module {
        path.push_str(&format!("/module[name={}]", quoted(module)));
    }
    if let Some(instance) = instance {
        path.push_str(&format!("/instance[name={}]", quoted(instance)));
    }
    path
}
