//! Module manager for orchestrating all instances
//!
//! Owns the inventory and runs the two tasks that touch it: the periodic
//! control loop (start, stop, reap, service polling, resource sampling) and
//! the reconciler applying configuration changes. Both take the same
//! inventory lock for the whole of each pass.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::store::ConfigStore;
use crate::config::SupervisorConfig;
use crate::graph::InterfaceGraph;
use crate::module::inventory::Inventory;
use crate::module::lifecycle::Lifecycle;
use crate::module::loader::ModuleLoader;
use crate::module::process::monitor::{ResourceMonitor, ResourceUsage};
use crate::module::traits::{InstanceState, ModuleError, ProcessSpawner};
use crate::reconcile::engine::Reconciler;
use crate::utils::signal::{ShutdownMode, SupervisorSignal};

/// Counters of one control-loop pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub started: usize,
    pub running: usize,
}

/// Snapshot of one interface for status reports
#[derive(Debug, Clone, Serialize)]
pub struct InterfaceStatus {
    pub name: String,
    pub direction: String,
    #[serde(rename = "type")]
    pub transport: String,
    pub spec: String,
    pub messages: u64,
    pub buffers: u64,
    pub dropped_messages: u64,
    pub num_clients: i32,
}

/// Snapshot of one instance for status reports
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub module: String,
    pub group: Option<String>,
    pub state: InstanceState,
    pub pid: Option<u32>,
    pub is_my_child: bool,
    pub restarts_count: u32,
    pub service_connected: bool,
    pub usage: ResourceUsage,
    pub interfaces: Vec<InterfaceStatus>,
}

/// Module manager coordinates all supervised instances
pub struct ModuleManager {
    config: Arc<SupervisorConfig>,
    inventory: Arc<Mutex<Inventory>>,
    lifecycle: Lifecycle,
    loader: ModuleLoader,
    store: Arc<dyn ConfigStore>,
    monitor: ResourceMonitor,
    reconciler_handle: Option<JoinHandle<()>>,
}

impl ModuleManager {
    pub fn new(
        config: SupervisorConfig,
        store: Arc<dyn ConfigStore>,
        spawner: Arc<dyn ProcessSpawner>,
    ) -> Self {
        let config = Arc::new(config);
        let lifecycle = Lifecycle::new(Arc::clone(&spawner), Arc::clone(&config));
        let loader = ModuleLoader::new(
            spawner,
            Arc::clone(&store),
            config.default_max_restarts_per_minute,
        );
        Self {
            config,
            inventory: Arc::new(Mutex::new(Inventory::new())),
            lifecycle,
            loader,
            store,
            monitor: ResourceMonitor::new(),
            reconciler_handle: None,
        }
    }

    /// Use another resource monitor (e.g. one reading a fake procfs)
    pub fn with_monitor(mut self, monitor: ResourceMonitor) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn inventory(&self) -> Arc<Mutex<Inventory>> {
        Arc::clone(&self.inventory)
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Reconciler sharing this manager's inventory
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            Arc::clone(&self.inventory),
            self.lifecycle.clone(),
            self.loader.clone(),
            Arc::clone(&self.store),
        )
    }

    /// Load the configuration and start applying changes
    ///
    /// Subscribes before loading so no edit made in between is lost.
    pub async fn start(&mut self) -> Result<usize, ModuleError> {
        info!("Starting module manager");
        let changes = self.store.subscribe();

        let tree = self.store.load_tree().await?;
        let loaded = {
            let mut inv = self.inventory.lock().await;
            self.loader.load_all(&mut inv, &tree).await?
        };

        let reconciler = self.reconciler();
        self.reconciler_handle = Some(tokio::spawn(reconciler.run(changes)));
        Ok(loaded)
    }

    /// One control-loop pass
    pub async fn tick(&mut self, now: Instant) -> TickSummary {
        let mut inv = self.inventory.lock().await;

        self.lifecycle.refresh_running(&mut inv);
        let started = self.lifecycle.start_eligible(&mut inv, now);
        self.lifecycle.escalate_stops(&mut inv).await;
        let running = self.lifecycle.refresh_running(&mut inv);
        self.lifecycle.poll_services(&mut inv).await;
        self.lifecycle.sample_resources(&mut inv, &mut self.monitor);

        debug!("Tick: {} started, {} running", started, running);
        TickSummary { started, running }
    }

    /// Run the control loop until a stop request arrives
    ///
    /// Returns the shutdown mode the caller should pass to [`Self::shutdown`].
    pub async fn run(
        &mut self,
        mut signals: mpsc::UnboundedReceiver<SupervisorSignal>,
    ) -> ShutdownMode {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let default_mode = if self.config.persist_pids_on_exit {
            ShutdownMode::PersistPids
        } else {
            ShutdownMode::TerminateAll
        };

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Instant::now()).await;
                }
                request = signals.recv() => match request {
                    Some(SupervisorSignal::Terminate) | None => return default_mode,
                    Some(SupervisorSignal::Quit) => return ShutdownMode::PersistPids,
                    Some(SupervisorSignal::Reload) => {
                        let store = Arc::clone(&self.store);
                        tokio::spawn(async move {
                            if let Err(e) = store.reload().await {
                                error!("Configuration reload failed: {}", e);
                            }
                        });
                    }
                    Some(SupervisorSignal::ExportGraph) => {
                        if let Err(e) = self.export_topology(None).await {
                            warn!("Failed to export interface graph: {}", e);
                        }
                    }
                },
            }
        }
    }

    /// Stop the reconciler and deal with the running instances
    pub async fn shutdown(&mut self, mode: ShutdownMode) -> Result<(), ModuleError> {
        if let Some(handle) = self.reconciler_handle.take() {
            handle.abort();
        }

        let mut inv = self.inventory.lock().await;
        match mode {
            ShutdownMode::TerminateAll => {
                self.lifecycle.terminate_all(&mut inv).await;
                info!("All instances terminated");
                Ok(())
            }
            ShutdownMode::PersistPids => {
                let pids = inv.running_pids();
                info!("Leaving {} instances running", pids.len());
                self.store.save_last_pids(&pids).await
            }
        }
    }

    /// Status of every instance in inventory order
    pub async fn status(&self) -> Vec<InstanceStatus> {
        let inv = self.inventory.lock().await;
        inv.instances()
            .map(|i| InstanceStatus {
                name: i.name.clone(),
                module: i.module.clone(),
                group: i.group.clone(),
                state: i.state(inv.is_enabled(i)),
                pid: i.pid,
                is_my_child: i.is_my_child,
                restarts_count: i.restarts_count,
                service_connected: i.service.is_some(),
                usage: i.usage.clone(),
                interfaces: i
                    .interfaces()
                    .map(|ifc| InterfaceStatus {
                        name: ifc.name.clone(),
                        direction: ifc.direction.to_string(),
                        transport: ifc.transport.type_name().to_string(),
                        spec: ifc.cli_arg(),
                        messages: ifc.stats.messages,
                        buffers: ifc.stats.buffers,
                        dropped_messages: ifc.stats.dropped_messages,
                        num_clients: ifc.stats.num_clients,
                    })
                    .collect(),
            })
            .collect()
    }

    /// Build the interface graph and write it as DOT
    ///
    /// Without an explicit path the configured `graph_output` is used, then
    /// `graph.dot` in the logs directory.
    pub async fn export_topology(&self, path: Option<&Path>) -> Result<PathBuf, ModuleError> {
        let path = path
            .map(Path::to_path_buf)
            .or_else(|| self.config.graph_output.clone())
            .unwrap_or_else(|| self.config.logs_dir.join("graph.dot"));
        let graph = {
            let inv = self.inventory.lock().await;
            InterfaceGraph::build(&inv)
        };
        graph.write_dot(&path)?;
        Ok(path)
    }
}
