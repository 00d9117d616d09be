//! Instance lifecycle controller
//!
//! Drives every instance between `Disabled`, `Stopped`, `Running`,
//! `StopRequested` and `KillRequested`: starts eligible instances under the
//! restart policy, escalates SIGINT to SIGKILL for instances that should stop,
//! reaps terminated children and removes their socket files.
//!
//! All operations take the inventory by `&mut`; callers hold the inventory
//! lock for the whole pass.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::module::interface::ifc_spec;
use crate::module::inventory::{Instance, InstanceId, Inventory, ModuleCapabilities};
use crate::module::ipc::client::ServiceClient;
use crate::module::params::build_exec_args;
use crate::module::process::monitor::ResourceMonitor;
use crate::module::traits::{
    ModuleError, ProbeResult, ProcessSpawner, ReapStatus, SpawnSpec, StopSignal,
};
use crate::utils::retry::RetryConfig;

/// Reap polling after a forced stop
const REAP_ATTEMPTS: u32 = 10;
const REAP_INTERVAL: Duration = Duration::from_millis(10);

/// Lifecycle operations over the inventory
#[derive(Clone)]
pub struct Lifecycle {
    spawner: Arc<dyn ProcessSpawner>,
    config: Arc<SupervisorConfig>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Lifecycle {
    pub fn new(spawner: Arc<dyn ProcessSpawner>, config: Arc<SupervisorConfig>) -> Self {
        Self { spawner, config }
    }

    pub fn spawner(&self) -> &Arc<dyn ProcessSpawner> {
        &self.spawner
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    fn should_stop(inv: &Inventory, instance: &Instance) -> bool {
        !inv.is_enabled(instance) || instance.should_die
    }

    /// Exec argument vector of an instance
    pub fn exec_args(inv: &Inventory, instance: &Instance) -> Result<Vec<String>, ModuleError> {
        let module = inv
            .module(&instance.module)
            .ok_or_else(|| ModuleError::ModuleNotFound(instance.module.clone()))?;

        let spec = if module.uses_ifc_spec() {
            ifc_spec(&instance.inputs, &instance.outputs)
        } else {
            None
        };
        Ok(build_exec_args(
            &instance.name,
            instance.params.as_deref(),
            spec,
        )?)
    }

    fn spawn_spec(&self, inv: &Inventory, instance: &Instance) -> Result<SpawnSpec, ModuleError> {
        let module = inv
            .module(&instance.module)
            .ok_or_else(|| ModuleError::ModuleNotFound(instance.module.clone()))?;
        let logs = self.config.instance_logs_dir();
        Ok(SpawnSpec {
            instance: instance.name.clone(),
            executable: module.path.clone(),
            args: Self::exec_args(inv, instance)?,
            stdout_log: Some(logs.join(format!("{}_stdout", instance.name))),
            stderr_log: Some(logs.join(format!("{}_stderr", instance.name))),
        })
    }

    /// Start every enabled instance that is not running
    ///
    /// Returns the number of processes created.
    pub fn start_eligible(&self, inv: &mut Inventory, now: Instant) -> usize {
        let mut started = 0;
        for id in inv.instance_ids() {
            if self.start_instance(inv, id, now) {
                started += 1;
            }
        }
        started
    }

    /// Apply the restart policy and try to start one instance
    pub fn start_instance(&self, inv: &mut Inventory, id: InstanceId, now: Instant) -> bool {
        let window = self.config.restart_window();
        let spec = {
            let Some(instance) = inv.instance(id) else {
                return false;
            };
            if instance.running || !inv.is_enabled(instance) {
                return false;
            }
            self.spawn_spec(inv, instance)
        };

        let Some(instance) = inv.instance_mut(id) else {
            return false;
        };

        match instance.restart_window_start {
            Some(window_start) if now.saturating_duration_since(window_start) < window => {
                instance.restarts_count += 1;
                if instance.restarts_count >= instance.max_restarts_per_minute {
                    warn!(
                        "Instance {} reached {} restarts within {:?}, disabling it",
                        instance.name, instance.restarts_count, window
                    );
                    instance.enabled = false;
                    instance.restarts_count = 0;
                    return false;
                }
            }
            _ => {
                instance.restarts_count = 0;
                instance.restart_window_start = Some(now);
            }
        }

        let spec = match spec {
            Ok(spec) => spec,
            Err(e) => {
                error!("Instance {} cannot be started: {}", instance.name, e);
                return false;
            }
        };

        info!(
            "Starting instance {} (attempt {} in current window)",
            instance.name,
            instance.restarts_count + 1
        );
        match self.spawner.spawn(&spec) {
            Ok(handle) => {
                instance.clear_process();
                instance.pid = Some(handle.pid);
                instance.running = true;
                instance.is_my_child = true;
                instance.should_die = false;
                true
            }
            Err(e) => {
                error!("Failed to start instance {}: {}", instance.name, e);
                instance.clear_process();
                false
            }
        }
    }

    /// Probe every instance that has a PID; returns the running count
    pub fn refresh_running(&self, inv: &mut Inventory) -> usize {
        let caps = Self::capabilities(inv);
        let mut running = 0;
        for instance in inv.instances_mut() {
            let module_caps = caps.get(&instance.module).copied();
            self.refresh_instance(instance, module_caps);
            if instance.running {
                running += 1;
            }
        }
        running
    }

    fn refresh_instance(&self, instance: &mut Instance, caps: Option<ModuleCapabilities>) {
        let Some(pid) = instance.pid else {
            instance.running = false;
            return;
        };

        match self.spawner.probe(pid) {
            ProbeResult::Alive => {
                instance.running = true;
                instance.root_perm_needed = false;
            }
            ProbeResult::PermissionDenied => {
                if !instance.root_perm_needed {
                    warn!(
                        "Instance {} (PID {}) runs under another user, it cannot be stopped",
                        instance.name, pid
                    );
                }
                instance.running = true;
                instance.root_perm_needed = true;
            }
            ProbeResult::NotRunning => {
                if instance.running {
                    info!("Instance {} (PID {}) is not running", instance.name, pid);
                }
                self.mark_dead(instance, caps);
            }
            ProbeResult::Failed(e) => {
                warn!("Liveness probe of instance {} failed: {}", instance.name, e);
                // Our own child is collected here or it would linger as a zombie
                if instance.is_my_child {
                    if !self.reap_one(instance, pid, caps) {
                        instance.running = true;
                    }
                    return;
                }
                self.mark_dead(instance, caps);
            }
        }
    }

    fn capabilities(inv: &Inventory) -> std::collections::HashMap<String, ModuleCapabilities> {
        inv.modules()
            .map(|m| (m.name.clone(), m.capabilities))
            .collect()
    }

    fn mark_dead(&self, instance: &mut Instance, caps: Option<ModuleCapabilities>) {
        self.clear_sockets(instance, caps);
        instance.clear_process();
    }

    /// Delete the socket files an instance leaves behind
    pub fn clear_sockets(&self, instance: &Instance, caps: Option<ModuleCapabilities>) {
        let caps = caps.unwrap_or_else(ModuleCapabilities::empty);
        let mut paths = Vec::new();

        if caps.contains(ModuleCapabilities::IFC_SPEC) {
            paths.extend(
                instance
                    .outputs
                    .iter()
                    .filter_map(|ifc| ifc.transport.unix_socket_name())
                    .map(|name| self.config.socket_path(name)),
            );
        }
        if caps.contains(ModuleCapabilities::SERVICE) {
            if let Some(pid) = instance.pid {
                paths.push(self.config.service_socket_path(pid));
            }
        }

        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => debug!("Removed socket {}", path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove socket {}: {}", path.display(), e),
            }
        }
    }

    /// SIGINT to every running instance that should stop and was not asked yet
    pub fn send_sigint(&self, inv: &mut Inventory) -> usize {
        let mut sent = 0;
        for id in inv.instance_ids() {
            let stop = match inv.instance(id) {
                Some(i) => Self::should_stop(inv, i),
                None => continue,
            };
            let Some(instance) = inv.instance_mut(id) else {
                continue;
            };
            if !stop || !instance.running || instance.sigint_sent || instance.root_perm_needed {
                continue;
            }
            let Some(pid) = instance.pid else {
                continue;
            };
            match self.spawner.signal(pid, StopSignal::Interrupt) {
                Ok(()) => {
                    info!("Stopping instance {} (PID {}) with SIGINT", instance.name, pid);
                    instance.sigint_sent = true;
                    instance.restarts_count = 0;
                    sent += 1;
                }
                Err(e) => warn!("Failed to stop instance {}: {}", instance.name, e),
            }
        }
        sent
    }

    /// SIGKILL to instances still alive after SIGINT
    pub fn send_sigkill(&self, inv: &mut Inventory) -> usize {
        let caps = Self::capabilities(inv);
        let mut sent = 0;
        for id in inv.instance_ids() {
            let stop = match inv.instance(id) {
                Some(i) => Self::should_stop(inv, i),
                None => continue,
            };
            let Some(instance) = inv.instance_mut(id) else {
                continue;
            };
            if !stop || !instance.running || !instance.sigint_sent || instance.sigkill_sent {
                continue;
            }
            let module_caps = caps.get(&instance.module).copied();
            self.refresh_instance(instance, module_caps);
            if !instance.running {
                continue;
            }
            let Some(pid) = instance.pid else {
                continue;
            };
            match self.spawner.signal(pid, StopSignal::Kill) {
                Ok(()) => {
                    warn!("Instance {} (PID {}) ignored SIGINT, sent SIGKILL", instance.name, pid);
                    instance.sigkill_sent = true;
                    sent += 1;
                }
                Err(e) => warn!("Failed to kill instance {}: {}", instance.name, e),
            }
        }
        sent
    }

    /// Non-blocking reap of every child; returns how many were collected
    pub fn reap_children(&self, inv: &mut Inventory) -> usize {
        let caps = Self::capabilities(inv);
        let mut reaped = 0;
        for instance in inv.instances_mut() {
            if !instance.is_my_child {
                continue;
            }
            let Some(pid) = instance.pid else {
                continue;
            };
            let module_caps = caps.get(&instance.module).copied();
            if self.reap_one(instance, pid, module_caps) {
                reaped += 1;
            }
        }
        reaped
    }

    fn reap_one(&self, instance: &mut Instance, pid: u32, caps: Option<ModuleCapabilities>) -> bool {
        match self.spawner.try_reap(pid) {
            ReapStatus::StillRunning => false,
            ReapStatus::Exited => {
                info!("Instance {} (PID {}) terminated", instance.name, pid);
                self.mark_dead(instance, caps);
                true
            }
            ReapStatus::NotMyChild => {
                debug!("Instance {} (PID {}) is no longer a child", instance.name, pid);
                self.mark_dead(instance, caps);
                true
            }
            ReapStatus::Failed(e) => {
                warn!("Reaping instance {} (PID {}) failed: {}", instance.name, pid, e);
                self.mark_dead(instance, caps);
                true
            }
        }
    }

    /// One signal escalation pass of the control loop
    pub async fn escalate_stops(&self, inv: &mut Inventory) {
        let interrupted = self.send_sigint(inv);
        if interrupted > 0 && !self.config.stop_grace().is_zero() {
            tokio::time::sleep(self.config.stop_grace()).await;
        }
        self.reap_children(inv);
        self.send_sigkill(inv);
        self.reap_children(inv);
    }

    /// Stop the given instances right away, waiting for them to die
    async fn stop_now(&self, inv: &mut Inventory, ids: &[InstanceId]) {
        let caps = Self::capabilities(inv);
        let mut interrupted = 0;

        for id in ids {
            let Some(instance) = inv.instance_mut(*id) else {
                continue;
            };
            instance.should_die = true;
            let (Some(pid), true) = (instance.pid, instance.running) else {
                continue;
            };
            if instance.root_perm_needed {
                warn!(
                    "Instance {} (PID {}) cannot be stopped without elevated permissions",
                    instance.name, pid
                );
                continue;
            }
            if instance.sigint_sent {
                continue;
            }
            match self.spawner.signal(pid, StopSignal::Interrupt) {
                Ok(()) => {
                    instance.sigint_sent = true;
                    interrupted += 1;
                }
                Err(e) => warn!("Failed to stop instance {}: {}", instance.name, e),
            }
        }

        if interrupted > 0 && !self.config.stop_grace().is_zero() {
            tokio::time::sleep(self.config.stop_grace()).await;
        }

        for id in ids {
            let Some(instance) = inv.instance_mut(*id) else {
                continue;
            };
            let Some(pid) = instance.pid else {
                continue;
            };
            if instance.is_my_child && self.spawner.try_reap(pid) != ReapStatus::StillRunning {
                self.mark_dead(instance, caps.get(&instance.module).copied());
                continue;
            }
            if instance.root_perm_needed {
                continue;
            }
            match self.spawner.probe(pid) {
                ProbeResult::Alive => {
                    match self.spawner.signal(pid, StopSignal::Kill) {
                        Ok(()) => {
                            warn!("Instance {} (PID {}) killed", instance.name, pid);
                            instance.sigkill_sent = true;
                        }
                        Err(e) => warn!("Failed to kill instance {}: {}", instance.name, e),
                    }
                }
                ProbeResult::PermissionDenied => {}
                ProbeResult::NotRunning | ProbeResult::Failed(_) => {
                    self.mark_dead(instance, caps.get(&instance.module).copied());
                }
            }
        }

        // Collect killed children so none is left as a zombie
        let mut pending: HashSet<InstanceId> = ids
            .iter()
            .copied()
            .filter(|id| {
                inv.instance(*id)
                    .map_or(false, |i| i.is_my_child && i.pid.is_some())
            })
            .collect();
        for attempt in 0..REAP_ATTEMPTS {
            pending.retain(|id| {
                let Some(instance) = inv.instance_mut(*id) else {
                    return false;
                };
                let Some(pid) = instance.pid else {
                    return false;
                };
                !self.reap_one(instance, pid, caps.get(&instance.module).copied())
            });
            if pending.is_empty() {
                break;
            }
            if attempt + 1 < REAP_ATTEMPTS {
                tokio::time::sleep(REAP_INTERVAL).await;
            }
        }
        for id in pending {
            if let Some(instance) = inv.instance(id) {
                warn!("Instance {} did not terminate in time", instance.name);
            }
        }
    }

    /// Stop instances and drop them from the inventory
    pub async fn stop_and_remove_instances(&self, inv: &mut Inventory, ids: &[InstanceId]) -> usize {
        self.stop_now(inv, ids).await;
        let caps = Self::capabilities(inv);
        let mut removed = 0;
        for id in ids {
            if let Some(instance) = inv.remove_instance(*id) {
                self.clear_sockets(&instance, caps.get(&instance.module).copied());
                info!("Instance {} removed", instance.name);
                removed += 1;
            }
        }
        removed
    }

    /// Stop and remove one instance by name; false when it is unknown
    pub async fn stop_and_remove_instance(&self, inv: &mut Inventory, name: &str) -> bool {
        match inv.id_of(name) {
            Some(id) => self.stop_and_remove_instances(inv, &[id]).await > 0,
            None => {
                debug!("Instance {} not loaded, nothing to remove", name);
                false
            }
        }
    }

    /// Stop and remove a module kind together with all its instances
    pub async fn stop_and_remove_module(&self, inv: &mut Inventory, name: &str) -> bool {
        let ids = inv.instances_of_module(name);
        self.stop_and_remove_instances(inv, &ids).await;
        let removed = inv.remove_module(name).is_some();
        if removed {
            info!("Module {} removed", name);
        }
        removed
    }

    /// Stop and remove a group, its module kinds and their instances
    pub async fn stop_and_remove_group(&self, inv: &mut Inventory, name: &str) -> bool {
        let modules = inv.modules_of_group(name);
        let ids: Vec<InstanceId> = modules
            .iter()
            .flat_map(|m| inv.instances_of_module(m))
            .collect();
        self.stop_and_remove_instances(inv, &ids).await;
        for module in &modules {
            inv.remove_module(module);
        }
        let removed = inv.remove_group(name).is_some();
        if removed {
            info!("Group {} removed", name);
        }
        removed
    }

    /// Stop every instance, keeping them in the inventory
    pub async fn terminate_all(&self, inv: &mut Inventory) {
        let ids = inv.instance_ids();
        info!("Terminating {} instances", ids.len());
        self.stop_now(inv, &ids).await;
    }

    fn service_retry(&self) -> RetryConfig {
        RetryConfig::fixed(
            self.config.service.retries,
            Duration::from_millis(self.config.service.timeout_ms),
        )
    }

    /// Connect service channels that are due and pull statistics over all of them
    ///
    /// A failed exchange drops the connection; it is attempted again on the
    /// next scheduled connection tick.
    pub async fn poll_services(&self, inv: &mut Inventory) {
        let period = self.config.service.connect_period_ticks.max(1);
        let max_payload = self.config.service.max_payload_bytes;
        let with_service: HashSet<String> = inv
            .modules()
            .filter(|m| m.has_service())
            .map(|m| m.name.clone())
            .collect();

        for instance in inv.instances_mut() {
            if !with_service.contains(&instance.module)
                || !instance.running
                || instance.service.is_some()
                || instance.interfaces().next().is_none()
            {
                continue;
            }
            let Some(pid) = instance.pid else {
                continue;
            };
            instance.service_conn_timer += 1;
            if (instance.service_conn_timer - 1) % period != 0 {
                continue;
            }
            let path = self.config.service_socket_path(pid);
            match ServiceClient::connect(&path, self.service_retry(), max_payload).await {
                Ok(client) => {
                    info!("Connected to service channel of instance {}", instance.name);
                    instance.service = Some(client);
                }
                Err(e) => debug!("Instance {} service not reachable: {}", instance.name, e),
            }
        }

        for instance in inv.instances_mut() {
            let Some(client) = instance.service.as_mut() else {
                continue;
            };
            if let Err(e) = client.send_request().await {
                warn!("Stats request to instance {} failed: {}", instance.name, e);
                instance.disconnect_service();
            }
        }

        for instance in inv.instances_mut() {
            let received = match instance.service.as_mut() {
                Some(client) => client.receive_stats().await,
                None => continue,
            };
            let applied = received.and_then(|stats| stats.apply_to(instance));
            if let Err(e) = applied {
                warn!("Stats of instance {} rejected: {}", instance.name, e);
                instance.disconnect_service();
            }
        }
    }

    /// Refresh CPU and memory usage of running instances
    pub fn sample_resources(&self, inv: &mut Inventory, monitor: &mut ResourceMonitor) {
        monitor.begin_tick();
        for instance in inv.instances_mut() {
            let (Some(pid), true) = (instance.pid, instance.running) else {
                continue;
            };
            if let Err(e) = monitor.sample(pid, &mut instance.usage) {
                debug!("Cannot sample usage of instance {}: {}", instance.name, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::interface::{Direction, Interface, TcpParams, Transport, UnixParams};
    use crate::module::inventory::ModuleKind;
    use crate::module::traits::ProcessHandle;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CountingSpawner {
        next_pid: Mutex<u32>,
        specs: Mutex<Vec<SpawnSpec>>,
    }

    impl ProcessSpawner for CountingSpawner {
        fn spawn(&self, spec: &SpawnSpec) -> Result<ProcessHandle, ModuleError> {
            self.specs.lock().unwrap().push(spec.clone());
            let mut pid = self.next_pid.lock().unwrap();
            *pid += 1;
            Ok(ProcessHandle { pid: 1000 + *pid })
        }
        fn signal(&self, _: u32, _: StopSignal) -> Result<(), ModuleError> {
            Ok(())
        }
        fn probe(&self, _: u32) -> ProbeResult {
            ProbeResult::NotRunning
        }
        fn try_reap(&self, _: u32) -> ReapStatus {
            ReapStatus::Exited
        }
        fn executable_path(&self, _: u32) -> Option<PathBuf> {
            None
        }
    }

    fn setup(uses_ifc_spec: bool) -> (Inventory, InstanceId) {
        let mut inv = Inventory::new();
        let kind = ModuleKind {
            name: "det".into(),
            path: PathBuf::from("/usr/bin/det"),
            group: None,
            capabilities: if uses_ifc_spec {
                ModuleCapabilities::IFC_SPEC
            } else {
                ModuleCapabilities::empty()
            },
        };
        inv.add_module(kind.clone()).unwrap();
        let mut inst = Instance::new("det1", &kind, 3);
        inst.params = Some(r#"-a 1 "two words""#.to_string());
        inst.add_interface(Interface::new(
            "out",
            Direction::Out,
            Transport::Tcp(TcpParams {
                host: None,
                port: 9999,
                max_clients: 0,
            }),
        ));
        let id = inv.add_instance(inst).unwrap();
        (inv, id)
    }

    #[test]
    fn test_exec_args_include_interface_spec() {
        let (inv, id) = setup(true);
        let args = Lifecycle::exec_args(&inv, inv.instance(id).unwrap()).unwrap();
        assert_eq!(args, vec!["det1", "-a", "1", "two words", "-i", "t:9999"]);
    }

    #[test]
    fn test_exec_args_without_interface_support() {
        let (inv, id) = setup(false);
        let args = Lifecycle::exec_args(&inv, inv.instance(id).unwrap()).unwrap();
        assert_eq!(args, vec!["det1", "-a", "1", "two words"]);
    }

    #[test]
    fn test_bad_params_keep_instance_stopped() {
        let (mut inv, id) = setup(true);
        inv.instance_mut(id).unwrap().params = Some("\"unterminated".into());
        let spawner = Arc::new(CountingSpawner::default());
        let lifecycle = Lifecycle::new(spawner.clone(), Arc::new(SupervisorConfig::default()));

        assert_eq!(lifecycle.start_eligible(&mut inv, Instant::now()), 0);
        assert!(!inv.instance(id).unwrap().running);
        assert!(spawner.specs.lock().unwrap().is_empty());
    }

    #[test]
    fn test_spawn_spec_uses_log_files() {
        let (mut inv, id) = setup(true);
        let spawner = Arc::new(CountingSpawner::default());
        let config = SupervisorConfig {
            logs_dir: PathBuf::from("/tmp/sup"),
            ..Default::default()
        };
        let lifecycle = Lifecycle::new(spawner.clone(), Arc::new(config));
        assert_eq!(lifecycle.start_eligible(&mut inv, Instant::now()), 1);

        let specs = spawner.specs.lock().unwrap();
        assert_eq!(specs[0].executable, PathBuf::from("/usr/bin/det"));
        assert_eq!(
            specs[0].stdout_log.as_deref(),
            Some(std::path::Path::new("/tmp/sup/modules_logs/det1_stdout"))
        );
        let inst = inv.instance(id).unwrap();
        assert!(inst.running && inst.is_my_child);
        assert_eq!(inst.pid, Some(1001));
    }

    #[test]
    fn test_clear_sockets_removes_unix_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            socket_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let lifecycle = Lifecycle::new(Arc::new(CountingSpawner::default()), Arc::new(config));
        let kind = ModuleKind {
            name: "m".into(),
            path: PathBuf::from("/bin/m"),
            group: None,
            capabilities: ModuleCapabilities::all(),
        };
        let mut inst = Instance::new("i", &kind, 3);
        inst.pid = Some(55);
        inst.add_interface(Interface::new(
            "o",
            Direction::Out,
            Transport::Unix(UnixParams {
                socket_name: "s1".into(),
                max_clients: 0,
            }),
        ));
        let unix = dir.path().join("trap-s1.sock");
        let service = dir.path().join("trap-service_55.sock");
        std::fs::write(&unix, b"").unwrap();
        std::fs::write(&service, b"").unwrap();

        lifecycle.clear_sockets(&inst, Some(kind.capabilities));
        assert!(!unix.exists());
        assert!(!service.exists());
    }
}
