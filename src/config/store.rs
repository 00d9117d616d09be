//! Configuration store
//!
//! Holds the desired-state tree, persists it, and publishes every committed
//! edit to subscribers as a batch of [`ChangeRecord`]s addressed by path.
//! [`MemoryConfigStore`] keeps the tree in memory and optionally mirrors it to
//! a JSON or TOML file.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::config::tree::{GroupConfig, InstanceConfig, ModuleConfig, SupervisorTree};
use crate::module::traits::ModuleError;
use crate::reconcile::change::{entity_path, ChangeOperation, ChangeRecord, LAST_PID_LEAF};
use crate::utils::retry::{retry_async_with_backoff, RetryConfig};

/// Verdict channel of a change batch
pub type ChangeReply = oneshot::Sender<Result<(), ModuleError>>;

/// All records of one committed edit
#[derive(Debug)]
pub struct ChangeBatch {
    pub records: Vec<ChangeRecord>,
    /// Present when the committer waits for the subscriber's verdict
    pub reply: Option<ChangeReply>,
}

impl ChangeBatch {
    pub fn new(records: Vec<ChangeRecord>) -> Self {
        Self {
            records,
            reply: None,
        }
    }

    /// Report the verdict back to the committer, if it waits for one
    pub fn respond(self, result: Result<(), ModuleError>) {
        if let Some(reply) = self.reply {
            let _ = reply.send(result);
        }
    }
}

/// Hierarchical configuration store the supervisor reconciles against
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Snapshot of the whole tree
    async fn load_tree(&self) -> Result<SupervisorTree, ModuleError>;

    /// Receive every future change batch
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeBatch>;

    /// Record (or clear) the PID persisted for an instance
    async fn set_last_pid(&self, instance: &str, pid: Option<u32>) -> Result<(), ModuleError>;

    /// Persist the PIDs of running instances before the supervisor exits
    async fn save_last_pids(&self, pids: &[(String, u32)]) -> Result<(), ModuleError>;

    /// Re-read the backing storage and publish what changed
    async fn reload(&self) -> Result<(), ModuleError> {
        Err(ModuleError::ConfigStore("reload not supported".to_string()))
    }
}

/// In-memory store with an optional backing file
pub struct MemoryConfigStore {
    tree: RwLock<SupervisorTree>,
    path: Option<PathBuf>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ChangeBatch>>>,
    retry: RetryConfig,
}

impl std::fmt::Debug for MemoryConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConfigStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl MemoryConfigStore {
    /// Store without persistence
    pub fn new(tree: SupervisorTree) -> Self {
        Self {
            tree: RwLock::new(tree),
            path: None,
            subscribers: Mutex::new(Vec::new()),
            retry: RetryConfig::default(),
        }
    }

    /// Store backed by a file; a missing file starts an empty tree
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ModuleError> {
        let path = path.as_ref().to_path_buf();
        let tree = if path.exists() {
            let tree = SupervisorTree::from_file(&path)
                .map_err(|e| ModuleError::ConfigStore(format!("{}: {}", path.display(), e)))?;
            tree.validate()?;
            tree
        } else {
            info!("Configuration {} not found, starting empty", path.display());
            SupervisorTree::default()
        };
        Ok(Self {
            tree: RwLock::new(tree),
            path: Some(path),
            subscribers: Mutex::new(Vec::new()),
            retry: RetryConfig::default(),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Current tree
    pub async fn tree(&self) -> SupervisorTree {
        self.tree.read().await.clone()
    }

    /// Replace the whole tree and wait for every subscriber to apply the edit
    pub async fn commit(&self, new_tree: SupervisorTree) -> Result<(), ModuleError> {
        self.replace(new_tree, true).await
    }

    /// Re-read the backing file and publish what changed
    pub async fn reload_from_file(&self) -> Result<(), ModuleError> {
        let Some(path) = &self.path else {
            return Err(ModuleError::ConfigStore(
                "store has no backing file".to_string(),
            ));
        };
        let tree = SupervisorTree::from_file(path)
            .map_err(|e| ModuleError::ConfigStore(format!("{}: {}", path.display(), e)))?;
        info!("Reloading configuration from {}", path.display());
        self.replace(tree, false).await
    }

    async fn replace(&self, new_tree: SupervisorTree, persist: bool) -> Result<(), ModuleError> {
        new_tree.validate()?;

        let records = {
            let mut tree = self.tree.write().await;
            let records = diff_trees(&tree, &new_tree);
            if records.is_empty() {
                debug!("Commit without changes");
                return Ok(());
            }
            *tree = new_tree;
            if persist {
                self.persist(&tree).await?;
            }
            records
        };

        debug!("Publishing {} change records", records.len());
        self.notify(records).await
    }

    async fn persist(&self, tree: &SupervisorTree) -> Result<(), ModuleError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        retry_async_with_backoff(&self.retry, || async { tree.to_file(path) })
            .await
            .map_err(|e| ModuleError::ConfigStore(format!("{}: {}", path.display(), e)))
    }

    fn live_subscribers(&self) -> Vec<mpsc::UnboundedSender<ChangeBatch>> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.clone()
    }

    /// Deliver a batch to every subscriber and collect their verdicts
    async fn notify(&self, records: Vec<ChangeRecord>) -> Result<(), ModuleError> {
        let mut verdicts = Vec::new();
        for tx in self.live_subscribers() {
            let (reply, verdict) = oneshot::channel();
            let batch = ChangeBatch {
                records: records.clone(),
                reply: Some(reply),
            };
            if tx.send(batch).is_ok() {
                verdicts.push(verdict);
            }
        }

        let mut result = Ok(());
        for verdict in verdicts {
            match verdict.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!("Subscriber rejected change: {}", e);
                    if result.is_ok() {
                        result = Err(e);
                    }
                }
                Err(_) => debug!("Subscriber went away before answering"),
            }
        }
        result
    }

    /// Deliver a batch without waiting for verdicts
    fn notify_detached(&self, records: Vec<ChangeRecord>) {
        for tx in self.live_subscribers() {
            let _ = tx.send(ChangeBatch::new(records.clone()));
        }
    }

    async fn update_last_pids(&self, updates: &[(String, Option<u32>)]) -> Result<(), ModuleError> {
        let records = {
            let mut tree = self.tree.write().await;
            let mut records = Vec::new();
            for (name, pid) in updates {
                let path = match tree.instance(name) {
                    Some((entry, _)) => {
                        let group = entry.group.map(|g| g.name.clone());
                        let module = entry.module.name.clone();
                        format!(
                            "{}/{}",
                            entity_path(group.as_deref(), Some(&module), Some(name)),
                            LAST_PID_LEAF
                        )
                    }
                    None => return Err(ModuleError::InstanceNotFound(name.clone())),
                };
                let Some(instance) = tree.instance_mut(name) else {
                    return Err(ModuleError::InstanceNotFound(name.clone()));
                };
                if instance.last_pid == *pid {
                    continue;
                }
                let old = instance.last_pid.map(Value::from);
                instance.last_pid = *pid;
                let operation = match pid {
                    Some(_) if old.is_none() => ChangeOperation::Created,
                    Some(_) => ChangeOperation::Modified,
                    None => ChangeOperation::Deleted,
                };
                records.push(
                    ChangeRecord::new(operation, path).with_values(old, pid.map(Value::from)),
                );
            }
            if records.is_empty() {
                return Ok(());
            }
            self.persist(&tree).await?;
            records
        };
        self.notify_detached(records);
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_tree(&self) -> Result<SupervisorTree, ModuleError> {
        Ok(self.tree.read().await.clone())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ChangeBatch> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    async fn set_last_pid(&self, instance: &str, pid: Option<u32>) -> Result<(), ModuleError> {
        self.update_last_pids(&[(instance.to_string(), pid)]).await
    }

    async fn save_last_pids(&self, pids: &[(String, u32)]) -> Result<(), ModuleError> {
        let updates: Vec<(String, Option<u32>)> = pids
            .iter()
            .map(|(name, pid)| (name.clone(), Some(*pid)))
            .collect();
        self.update_last_pids(&updates).await?;
        info!("Persisted PIDs of {} instances", pids.len());
        Ok(())
    }

    async fn reload(&self) -> Result<(), ModuleError> {
        self.reload_from_file().await
    }
}

fn leaf_fields<T: serde::Serialize>(value: &T, skip: &[&str]) -> Map<String, Value> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut map)) => {
            map.retain(|k, _| !skip.contains(&k.as_str()));
            map
        }
        _ => Map::new(),
    }
}

/// Modified records for every leaf that differs between two nodes
fn diff_leaves<T: serde::Serialize>(
    base: &str,
    old: &T,
    new: &T,
    skip: &[&str],
    records: &mut Vec<ChangeRecord>,
) {
    let old = leaf_fields(old, skip);
    let new = leaf_fields(new, skip);
    let mut keys: Vec<&String> = old.keys().collect();
    keys.extend(new.keys().filter(|k| !old.contains_key(*k)));

    for key in keys {
        let before = old.get(key).filter(|v| !v.is_null());
        let after = new.get(key).filter(|v| !v.is_null());
        if before != after {
            records.push(
                ChangeRecord::new(ChangeOperation::Modified, format!("{}/{}", base, key))
                    .with_values(before.cloned(), after.cloned()),
            );
        }
    }
}

fn diff_instances(
    group: Option<&str>,
    module: &str,
    old: &[InstanceConfig],
    new: &[InstanceConfig],
    records: &mut Vec<ChangeRecord>,
) {
    for instance in old {
        let path = entity_path(group, Some(module), Some(&instance.name));
        match new.iter().find(|i| i.name == instance.name) {
            Some(updated) => diff_leaves(&path, instance, updated, &["name"], records),
            None => records.push(ChangeRecord::new(ChangeOperation::Deleted, path)),
        }
    }
    for instance in new.iter().filter(|i| !old.iter().any(|o| o.name == i.name)) {
        records.push(ChangeRecord::new(
            ChangeOperation::Created,
            entity_path(group, Some(module), Some(&instance.name)),
        ));
    }
}

fn diff_modules(
    group: Option<&str>,
    old: &[ModuleConfig],
    new: &[ModuleConfig],
    records: &mut Vec<ChangeRecord>,
) {
    for module in old {
        let path = entity_path(group, Some(&module.name), None);
        match new.iter().find(|m| m.name == module.name) {
            Some(updated) => {
                diff_leaves(&path, module, updated, &["name", "instances"], records);
                diff_instances(group, &module.name, &module.instances, &updated.instances, records);
            }
            None => records.push(ChangeRecord::new(ChangeOperation::Deleted, path)),
        }
    }
    for module in new.iter().filter(|m| !old.iter().any(|o| o.name == m.name)) {
        records.push(ChangeRecord::new(
            ChangeOperation::Created,
            entity_path(group, Some(&module.name), None),
        ));
    }
}

fn diff_groups(old: &[GroupConfig], new: &[GroupConfig], records: &mut Vec<ChangeRecord>) {
    for group in old {
        let path = entity_path(Some(&group.name), None, None);
        match new.iter().find(|g| g.name == group.name) {
            Some(updated) => {
                diff_leaves(&path, group, updated, &["name", "modules"], records);
                diff_modules(Some(&group.name), &group.modules, &updated.modules, records);
            }
            None => records.push(ChangeRecord::new(ChangeOperation::Deleted, path)),
        }
    }
    for group in new.iter().filter(|g| !old.iter().any(|o| o.name == g.name)) {
        records.push(ChangeRecord::new(
            ChangeOperation::Created,
            entity_path(Some(&group.name), None, None),
        ));
    }
}

/// Change records turning `old` into `new`
///
/// Entity nodes are reported as Created or Deleted as a whole; leaves of
/// entities present in both trees are reported as Modified. A module that
/// moves between groups (or in or out of a group) appears as a deletion at
/// its old path and a creation at its new one.
pub fn diff_trees(old: &SupervisorTree, new: &SupervisorTree) -> Vec<ChangeRecord> {
    let mut records = Vec::new();
    diff_groups(&old.groups, &new.groups, &mut records);
    diff_modules(None, &old.modules, &new.modules, &mut records);
    records
}
