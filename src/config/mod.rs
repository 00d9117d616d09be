//! Configuration management for the supervisor
//!
//! Handles daemon settings loading and validation. The desired-state tree the
//! supervisor reconciles against lives in [`tree`], the store that holds it and
//! publishes edits in [`store`].

pub mod store;
pub mod tree;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log filter (e.g. "info", "module_supervisor=debug"); RUST_LOG takes precedence
    #[serde(default)]
    pub filter: Option<String>,

    /// Emit JSON formatted logs (requires the json-logging feature)
    #[serde(default)]
    pub json_format: bool,
}

/// Service (statistics) channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// A connection attempt is made every this many control-loop ticks
    #[serde(default = "default_connect_period_ticks")]
    pub connect_period_ticks: u64,

    /// Wait per send/receive attempt in milliseconds
    #[serde(default = "default_service_timeout_ms")]
    pub timeout_ms: u64,

    /// Attempts before the connection is dropped
    #[serde(default = "default_service_retries")]
    pub retries: u32,

    /// Largest accepted stats payload
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

fn default_connect_period_ticks() -> u64 {
    30
}

fn default_service_timeout_ms() -> u64 {
    25
}

fn default_service_retries() -> u32 {
    3
}

fn default_max_payload_bytes() -> usize {
    1024 * 1024
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            connect_period_ticks: default_connect_period_ticks(),
            timeout_ms: default_service_timeout_ms(),
            retries: default_service_retries(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

/// Supervisor daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Control loop period in milliseconds
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Delay between SIGINT and SIGKILL in milliseconds
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Length of the restart counting window in seconds
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,

    /// Used for instances that do not configure their own limit
    #[serde(default = "default_max_restarts_per_minute")]
    pub default_max_restarts_per_minute: u32,

    /// Directory holding libtrap UNIX sockets (`trap-<name>.sock`)
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// Instance stdout/stderr go to `<logs_dir>/modules_logs/`
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// On exit, persist running PIDs instead of stopping the instances
    #[serde(default)]
    pub persist_pids_on_exit: bool,

    /// Where the topology graph is exported
    #[serde(default)]
    pub graph_output: Option<PathBuf>,

    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_tick_interval_ms() -> u64 {
    1500
}

fn default_stop_grace_ms() -> u64 {
    500
}

fn default_restart_window_secs() -> u64 {
    60
}

fn default_max_restarts_per_minute() -> u32 {
    3
}

fn default_socket_dir() -> PathBuf {
    PathBuf::from("/var/run/libtrap")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("/var/log/module-supervisor")
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            restart_window_secs: default_restart_window_secs(),
            default_max_restarts_per_minute: default_max_restarts_per_minute(),
            socket_dir: default_socket_dir(),
            logs_dir: default_logs_dir(),
            persist_pids_on_exit: false,
            graph_output: None,
            service: ServiceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from a JSON or TOML file (by extension)
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => {
                let content = std::fs::read_to_string(path)?;
                let config: SupervisorConfig = toml::from_str(&content)?;
                Ok(config)
            }
            _ => Self::from_json_file(path),
        }
    }

    /// Load configuration from JSON file
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: SupervisorConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to JSON file
    pub fn to_json_file(&self, path: &Path) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tick_interval_ms == 0 {
            anyhow::bail!("tick_interval_ms must be greater than zero");
        }
        if self.restart_window_secs == 0 {
            anyhow::bail!("restart_window_secs must be greater than zero");
        }
        if self.service.connect_period_ticks == 0 {
            anyhow::bail!("service.connect_period_ticks must be greater than zero");
        }
        if self.service.retries == 0 {
            anyhow::bail!("service.retries must be greater than zero");
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }

    /// Directory receiving instance stdout/stderr files
    pub fn instance_logs_dir(&self) -> PathBuf {
        self.logs_dir.join("modules_logs")
    }

    /// Path of a libtrap UNIX socket with the given name
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("trap-{}.sock", name))
    }

    /// Path of the private service socket of the process `pid`
    pub fn service_socket_path(&self, pid: u32) -> PathBuf {
        self.socket_path(&format!("service_{}", pid))
    }
}
