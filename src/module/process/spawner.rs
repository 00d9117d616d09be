//! Module process spawning and control
//!
//! Production implementation of [`ProcessSpawner`]: launches instance
//! processes in their own process group with stdout/stderr redirected to
//! per-instance log files, and wraps the POSIX calls used to stop, probe and
//! reap them.

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

use crate::module::traits::{
    ModuleError, ProbeResult, ProcessHandle, ProcessSpawner, ReapStatus, SpawnSpec, StopSignal,
};

/// Spawn and control module processes through the OS
#[derive(Debug, Clone)]
pub struct ModuleProcessSpawner {
    /// Root of the procfs tree used to resolve executables
    proc_root: PathBuf,
}

impl Default for ModuleProcessSpawner {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleProcessSpawner {
    pub fn new() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
        }
    }

    fn open_log(path: &Path) -> Result<File, ModuleError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(file)
    }

    fn to_pid(pid: u32) -> Result<Pid, ModuleError> {
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| ModuleError::SignalFailed(format!("invalid pid {}", pid)))
    }
}

impl ProcessSpawner for ModuleProcessSpawner {
    fn spawn(&self, spec: &SpawnSpec) -> Result<ProcessHandle, ModuleError> {
        let (argv0, args) = spec
            .args
            .split_first()
            .ok_or_else(|| ModuleError::SpawnFailed("empty argument vector".to_string()))?;

        let mut command = Command::new(&spec.executable);
        command.arg0(argv0).args(args).stdin(Stdio::null());
        // Own process group, so a terminal ^C aimed at the supervisor does not reach it
        command.process_group(0);

        match &spec.stdout_log {
            Some(path) => {
                let mut log = Self::open_log(path)?;
                writeln!(
                    log,
                    "[{}] Executing {} {}",
                    crate::utils::time::log_timestamp(),
                    spec.executable.display(),
                    spec.args.join(" ")
                )?;
                command.stdout(log);
            }
            None => {
                command.stdout(Stdio::null());
            }
        }
        match &spec.stderr_log {
            Some(path) => {
                command.stderr(Self::open_log(path)?);
            }
            None => {
                command.stderr(Stdio::null());
            }
        }

        debug!(
            "Spawning instance {}: {:?} {:?}",
            spec.instance, spec.executable, spec.args
        );

        // Dropping the Child neither waits nor kills; reaping goes through try_reap
        let child = command.spawn().map_err(|e| {
            ModuleError::SpawnFailed(format!(
                "{} ({}): {}",
                spec.instance,
                spec.executable.display(),
                e
            ))
        })?;

        let pid = child.id();
        info!("Instance {} started with PID {}", spec.instance, pid);
        Ok(ProcessHandle { pid })
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ModuleError> {
        let sig = match signal {
            StopSignal::Interrupt => Signal::SIGINT,
            StopSignal::Kill => Signal::SIGKILL,
        };
        kill(Self::to_pid(pid)?, sig)
            .map_err(|e| ModuleError::SignalFailed(format!("{} to {}: {}", sig, pid, e.desc())))
    }

    fn probe(&self, pid: u32) -> ProbeResult {
        let pid = match Self::to_pid(pid) {
            Ok(pid) => pid,
            Err(e) => return ProbeResult::Failed(e.to_string()),
        };
        match kill(pid, None) {
            Ok(()) => ProbeResult::Alive,
            Err(Errno::EPERM) => ProbeResult::PermissionDenied,
            Err(Errno::ESRCH) => ProbeResult::NotRunning,
            Err(e) => ProbeResult::Failed(e.desc().to_string()),
        }
    }

    fn try_reap(&self, pid: u32) -> ReapStatus {
        let pid = match Self::to_pid(pid) {
            Ok(pid) => pid,
            Err(e) => return ReapStatus::Failed(e.to_string()),
        };
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => ReapStatus::StillRunning,
            Ok(status) => {
                debug!("Reaped process {}: {:?}", pid, status);
                ReapStatus::Exited
            }
            Err(Errno::ECHILD) => ReapStatus::NotMyChild,
            Err(e) => {
                warn!("waitpid({}) failed: {}", pid, e.desc());
                ReapStatus::Failed(e.desc().to_string())
            }
        }
    }

    fn executable_path(&self, pid: u32) -> Option<PathBuf> {
        std::fs::read_link(self.proc_root.join(pid.to_string()).join("exe")).ok()
    }
}
