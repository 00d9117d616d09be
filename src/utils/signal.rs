//! Signal handling for the supervisor daemon
//!
//! Maps process signals to supervisor requests: SIGTERM and SIGINT stop the
//! supervisor, SIGQUIT stops it while leaving instances running, SIGHUP
//! reloads the configuration file and SIGUSR1 exports the interface graph.

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Request delivered to the control loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorSignal {
    /// Stop the supervisor using the configured shutdown mode
    Terminate,
    /// Stop the supervisor, persisting PIDs of running instances
    Quit,
    /// Re-read the configuration file
    Reload,
    /// Write the interface graph
    ExportGraph,
}

/// What happens to running instances when the supervisor exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop every instance
    TerminateAll,
    /// Record running PIDs and leave the processes alive for adoption
    PersistPids,
}

/// Listen for process signals in the background
///
/// Handlers that cannot be installed are skipped with a warning.
pub fn spawn_signal_listener() -> mpsc::UnboundedReceiver<SupervisorSignal> {
    let (tx, rx) = mpsc::unbounded_channel();

    let kinds = [
        (SignalKind::terminate(), "SIGTERM", SupervisorSignal::Terminate),
        (SignalKind::interrupt(), "SIGINT", SupervisorSignal::Terminate),
        (SignalKind::quit(), "SIGQUIT", SupervisorSignal::Quit),
        (SignalKind::hangup(), "SIGHUP", SupervisorSignal::Reload),
        (SignalKind::user_defined1(), "SIGUSR1", SupervisorSignal::ExportGraph),
    ];

    for (kind, name, request) in kinds {
        let mut stream = match signal(kind) {
            Ok(s) => s,
            Err(e) => {
                warn!("Failed to register {} handler: {}", name, e);
                continue;
            }
        };
        let tx = tx.clone();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                info!("Received {}", name);
                if tx.send(request).is_err() {
                    break;
                }
            }
        });
    }

    rx
}
