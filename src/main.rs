//! Module supervisor daemon
//!
//! Usage:
//!   module-supervisor --tree <file> [--config <file>] [--log-filter <filter>]

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use module_supervisor::config::store::MemoryConfigStore;
use module_supervisor::config::SupervisorConfig;
use module_supervisor::module::{ModuleManager, ModuleProcessSpawner};
use module_supervisor::utils::{init_logging_from_config, spawn_signal_listener};

#[derive(Parser, Debug)]
#[command(version, about = "Keeps configured module instances running")]
struct Args {
    /// Desired-state tree (JSON or TOML)
    #[arg(long)]
    tree: PathBuf,

    /// Supervisor settings (JSON or TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log filter, overrides the configured one (RUST_LOG still wins)
    #[arg(long)]
    log_filter: Option<String>,

    /// Where to write the interface graph on SIGUSR1
    #[arg(long)]
    graph_output: Option<PathBuf>,

    /// Leave instances running on exit and persist their PIDs
    #[arg(long)]
    persist_pids: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => SupervisorConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SupervisorConfig::default(),
    };
    if args.log_filter.is_some() {
        config.logging.filter = args.log_filter.clone();
    }
    if args.graph_output.is_some() {
        config.graph_output = args.graph_output.clone();
    }
    config.persist_pids_on_exit |= args.persist_pids;
    config.validate()?;

    init_logging_from_config(Some(&config.logging));
    info!("Module supervisor starting (tree {})", args.tree.display());

    let store = Arc::new(
        MemoryConfigStore::open(&args.tree)
            .with_context(|| format!("opening {}", args.tree.display()))?,
    );
    let spawner = Arc::new(ModuleProcessSpawner::new());
    let mut manager = ModuleManager::new(config, store, spawner);

    let signals = spawn_signal_listener();
    manager.start().await?;

    let mode = manager.run(signals).await;
    info!("Shutting down ({:?})", mode);
    if let Err(e) = manager.shutdown(mode).await {
        error!("Shutdown incomplete: {}", e);
    }
    Ok(())
}
