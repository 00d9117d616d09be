//! Module system traits and shared types
//!
//! Defines the error type used across the supervisor, the observable instance
//! state, and the process-control seam that isolates every OS call the
//! lifecycle logic needs.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Observable lifecycle state of an instance
///
/// `Starting` and `Reaped` are momentary and never observed between ticks:
/// a started instance is `Running` (or back to `Stopped` on spawn failure) and
/// a reaped one is `Stopped` or `Disabled` again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    /// Not desired to run and not running
    Disabled,
    /// Desired to run but not running (waiting for the next tick)
    Stopped,
    /// Running normally
    Running,
    /// SIGINT delivered, waiting for the process to exit
    StopRequested,
    /// SIGKILL delivered, waiting to be reaped
    KillRequested,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InstanceState::Disabled => "disabled",
            InstanceState::Stopped => "stopped",
            InstanceState::Running => "running",
            InstanceState::StopRequested => "stop-requested",
            InstanceState::KillRequested => "kill-requested",
        };
        f.write_str(s)
    }
}

/// Signal used to stop an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    /// Graceful stop request (SIGINT)
    Interrupt,
    /// Forced termination (SIGKILL)
    Kill,
}

/// Result of an existence probe (signal 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// Process exists and can be signalled
    Alive,
    /// Process exists but belongs to someone this supervisor cannot signal
    PermissionDenied,
    /// No such process
    NotRunning,
    /// Probe failed for another reason
    Failed(String),
}

/// Result of a non-blocking reap attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReapStatus {
    /// Child has not changed state yet
    StillRunning,
    /// Child terminated and was collected
    Exited,
    /// The PID is not a child of this process
    NotMyChild,
    /// waitpid failed for another reason
    Failed(String),
}

/// Everything needed to launch one instance process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Instance name (also used as argv[0])
    pub instance: String,
    /// Module executable
    pub executable: PathBuf,
    /// Full argument vector, argv[0] included
    pub args: Vec<String>,
    /// File receiving the child's stdout
    pub stdout_log: Option<PathBuf>,
    /// File receiving the child's stderr
    pub stderr_log: Option<PathBuf>,
}

/// Handle to a freshly created process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Process control seam
///
/// The lifecycle controller never touches the OS directly. The production
/// implementation is [`crate::module::process::spawner::ModuleProcessSpawner`];
/// tests substitute a fake that records calls.
pub trait ProcessSpawner: Send + Sync {
    /// Create a new process described by `spec`
    fn spawn(&self, spec: &SpawnSpec) -> Result<ProcessHandle, ModuleError>;

    /// Deliver a stop signal
    fn signal(&self, pid: u32, signal: StopSignal) -> Result<(), ModuleError>;

    /// Existence probe without delivering a signal
    fn probe(&self, pid: u32) -> ProbeResult;

    /// Non-blocking reap of a child process
    fn try_reap(&self, pid: u32) -> ReapStatus;

    /// Resolved executable of a running process, if it can be read
    fn executable_path(&self, pid: u32) -> Option<PathBuf>;
}

/// Supervisor error types
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to signal process: {0}")]
    SignalFailed(String),

    #[error("Invalid instance parameters: {0}")]
    InvalidParams(String),

    #[error("Group not found: {0}")]
    GroupNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Duplicate entity: {0}")]
    Duplicate(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Configuration store error: {0}")]
    ConfigStore(String),

    #[error("Invalid change path: {0}")]
    InvalidChangePath(String),

    #[error("IPC error: {0}")]
    IpcError(String),

    #[error("Malformed stats payload: {0}")]
    MalformedStats(String),

    #[error("Stats do not match configuration: {0}")]
    StatsMismatch(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ModuleError {
    fn from(err: std::io::Error) -> Self {
        ModuleError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ModuleError {
    fn from(err: serde_json::Error) -> Self {
        ModuleError::SerializationError(err.to_string())
    }
}

impl From<toml::de::Error> for ModuleError {
    fn from(err: toml::de::Error) -> Self {
        ModuleError::SerializationError(err.to_string())
    }
}

impl From<nix::errno::Errno> for ModuleError {
    fn from(err: nix::errno::Errno) -> Self {
        ModuleError::SignalFailed(err.desc().to_string())
    }
}
