//! Shared fixtures for supervisor integration tests
#![allow(dead_code)]

use module_supervisor::config::tree::SupervisorTree;
use module_supervisor::config::SupervisorConfig;
use module_supervisor::module::{
    ModuleError, ProbeResult, ProcessHandle, ProcessSpawner, ReapStatus, SpawnSpec, StopSignal,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// Call recorded by the fake spawner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Spawn { instance: String, pid: u32, args: Vec<String> },
    Signal { pid: u32, signal: StopSignal },
    Reaped { pid: u32 },
}

#[derive(Debug, Clone)]
struct FakeProcess {
    alive: bool,
    /// Exited child that was not collected yet
    zombie: bool,
    child: bool,
    ignores_sigint: bool,
    foreign_owner: bool,
    /// Liveness probes error out instead of answering
    probe_fails: bool,
    exe: PathBuf,
}

#[derive(Debug, Default)]
struct FakeState {
    next_pid: u32,
    processes: HashMap<u32, FakeProcess>,
    events: Vec<Event>,
    fail_spawn: bool,
}

/// In-memory process table standing in for the OS
#[derive(Debug)]
pub struct FakeSpawner {
    state: Mutex<FakeState>,
}

impl Default for FakeSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_pid: 1000,
                ..Default::default()
            }),
        }
    }

    pub fn set_fail_spawn(&self, fail: bool) {
        self.state.lock().unwrap().fail_spawn = fail;
    }

    /// A process this supervisor did not start
    pub fn add_foreign(&self, pid: u32, exe: impl Into<PathBuf>, foreign_owner: bool) {
        self.state.lock().unwrap().processes.insert(
            pid,
            FakeProcess {
                alive: true,
                zombie: false,
                child: false,
                ignores_sigint: false,
                foreign_owner,
                probe_fails: false,
                exe: exe.into(),
            },
        );
    }

    pub fn ignore_sigint(&self, pid: u32) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(&pid) {
            p.ignores_sigint = true;
        }
    }

    pub fn fail_probes(&self, pid: u32) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(&pid) {
            p.probe_fails = true;
        }
    }

    /// The process exits on its own
    pub fn crash(&self, pid: u32) {
        if let Some(p) = self.state.lock().unwrap().processes.get_mut(&pid) {
            p.alive = false;
            p.zombie = p.child;
        }
    }

    pub fn is_alive(&self, pid: u32) -> bool {
        self.state
            .lock()
            .unwrap()
            .processes
            .get(&pid)
            .map_or(false, |p| p.alive)
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn spawn_count(&self, instance: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Spawn { instance: i, .. } if i == instance))
            .count()
    }

    pub fn signals(&self, pid: u32) -> Vec<StopSignal> {
        self.events()
            .iter()
            .filter_map(|e| match e {
                Event::Signal { pid: p, signal } if *p == pid => Some(*signal),
                _ => None,
            })
            .collect()
    }

    pub fn last_spawn_args(&self, instance: &str) -> Option<Vec<String>> {
        self.events().into_iter().rev().find_map(|e| match e {
            Event::Spawn { instance: i, args, .. } if i == instance => Some(args),
            _ => None,
        })
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<ProcessHandle, ModuleError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_spawn {
            return Err(ModuleError::SpawnFailed(format!("{}: refused", spec.instance)));
        }
        state.next_pid += 1;
        let pid = state.next_pid;
        state.processes.insert(
            pid,
            FakeProcess {
                alive: true,
                zombie: false,
                child: true,
                ignores_sigint: false,
                foreign_owner: false,
                probe_fails: false,
                exe: spec.executable.clone(),
            },
        );
        state.events.push(Event::Spawn {
            instance: spec.instance.clone(),
            pid,
            args: spec.args.clone(),
        });
        Ok(ProcessHandle { pid })
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ModuleError> {
        let mut state = self.state.lock().unwrap();
        let process = match state.processes.get_mut(&pid) {
            Some(p) if p.alive || p.zombie => p,
            _ => return Err(ModuleError::SignalFailed(format!("no process {}", pid))),
        };
        if process.foreign_owner {
            return Err(ModuleError::SignalFailed(format!("EPERM for {}", pid)));
        }
        let dies = match signal {
            StopSignal::Interrupt => !process.ignores_sigint,
            StopSignal::Kill => true,
        };
        if dies && process.alive {
            process.alive = false;
            process.zombie = process.child;
        }
        state.events.push(Event::Signal { pid, signal });
        Ok(())
    }

    fn probe(&self, pid: u32) -> ProbeResult {
        let state = self.state.lock().unwrap();
        match state.processes.get(&pid) {
            Some(p) if p.probe_fails => ProbeResult::Failed(format!("probe of {} failed", pid)),
            Some(p) if p.alive || p.zombie => {
                if p.foreign_owner {
                    ProbeResult::PermissionDenied
                } else {
                    ProbeResult::Alive
                }
            }
            _ => ProbeResult::NotRunning,
        }
    }

    fn try_reap(&self, pid: u32) -> ReapStatus {
        let mut state = self.state.lock().unwrap();
        let status = match state.processes.get_mut(&pid) {
            Some(p) if p.child && p.zombie => {
                p.zombie = false;
                ReapStatus::Exited
            }
            Some(p) if p.child && p.alive => ReapStatus::StillRunning,
            _ => ReapStatus::NotMyChild,
        };
        if status == ReapStatus::Exited {
            state.events.push(Event::Reaped { pid });
        }
        status
    }

    fn executable_path(&self, pid: u32) -> Option<PathBuf> {
        let state = self.state.lock().unwrap();
        state
            .processes
            .get(&pid)
            .filter(|p| p.alive)
            .map(|p| p.exe.clone())
    }
}

/// Settings pointing every directory into `dir`, with a short grace delay
pub fn test_config(dir: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        tick_interval_ms: 20,
        stop_grace_ms: 10,
        socket_dir: dir.join("sockets"),
        logs_dir: dir.join("logs"),
        ..Default::default()
    };
    config.service.timeout_ms = 200;
    config
}

pub fn temp_dir() -> TempDir {
    tempfile::tempdir().expect("temp dir")
}

/// One group `g` with module `m` (path `/usr/bin/m`) and instance `i`
pub fn single_instance_tree() -> SupervisorTree {
    serde_json::from_value(serde_json::json!({
        "groups": [{
            "name": "g",
            "modules": [{
                "name": "m",
                "path": "/usr/bin/m",
                "instances": [{
                    "name": "i",
                    "params": "-v",
                    "interfaces": [
                        {"name": "out", "direction": "OUT", "type": "UNIXSOCKET", "socket-name": "i-out"}
                    ]
                }]
            }]
        }]
    }))
    .expect("valid tree")
}

/// Ungrouped producer/consumer pair linked over TCP port 7000
pub fn pipeline_tree() -> SupervisorTree {
    serde_json::from_value(serde_json::json!({
        "modules": [
            {
                "name": "source",
                "path": "/usr/bin/source",
                "instances": [{
                    "name": "src",
                    "interfaces": [{"name": "o", "direction": "OUT", "type": "TCP", "port": 7000}]
                }]
            },
            {
                "name": "sink",
                "path": "/usr/bin/sink",
                "instances": [
                    {
                        "name": "sink1",
                        "interfaces": [{"name": "i", "direction": "IN", "type": "TCP", "port": 7000}]
                    },
                    {
                        "name": "sink2",
                        "interfaces": [{"name": "i", "direction": "IN", "type": "TCP", "port": 7000}]
                    }
                ]
            }
        ]
    }))
    .expect("valid tree")
}
