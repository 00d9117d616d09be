//! Service channel client
//!
//! Connects to an instance's private service socket and pulls interface
//! statistics. Every send and receive is bounded: each attempt waits at most
//! one retry delay and the connection is given up after the configured number
//! of attempts, so a stuck instance never blocks the control loop.

use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

use crate::module::ipc::protocol::{ServiceCodec, ServiceCommand, ServiceFrame, StatsPayload};
use crate::module::traits::ModuleError;
use crate::utils::retry::RetryConfig;

/// Connected service channel of one instance
#[derive(Debug)]
pub struct ServiceClient {
    framed: Framed<UnixStream, ServiceCodec>,
    retry: RetryConfig,
    socket_path: PathBuf,
}

impl ServiceClient {
    /// Connect to the service socket
    pub async fn connect<P: AsRef<Path>>(
        socket_path: P,
        retry: RetryConfig,
        max_payload: usize,
    ) -> Result<Self, ModuleError> {
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = timeout(retry.total_budget(), UnixStream::connect(&socket_path))
            .await
            .map_err(|_| {
                ModuleError::Timeout(format!("connecting to {}", socket_path.display()))
            })?
            .map_err(|e| {
                ModuleError::IpcError(format!(
                    "Failed to connect to {}: {}",
                    socket_path.display(),
                    e
                ))
            })?;

        debug!("Connected to service socket {}", socket_path.display());
        Ok(Self {
            framed: Framed::new(stream, ServiceCodec::new(max_payload)),
            retry,
            socket_path,
        })
    }

    /// Send a stats request
    pub async fn send_request(&mut self) -> Result<(), ModuleError> {
        self.framed
            .feed(ServiceFrame::get_request())
            .await
            .map_err(|e| ModuleError::IpcError(format!("Failed to queue request: {}", e)))?;

        for attempt in 0..self.retry.max_attempts {
            match timeout(self.retry.delay_for(attempt), self.framed.flush()).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => {
                    return Err(ModuleError::IpcError(format!("Failed to send request: {}", e)))
                }
                Err(_) => debug!(
                    "Send to {} would block (attempt {}/{})",
                    self.socket_path.display(),
                    attempt + 1,
                    self.retry.max_attempts
                ),
            }
        }
        Err(ModuleError::Timeout(format!(
            "sending to {}",
            self.socket_path.display()
        )))
    }

    /// Receive and decode one stats reply
    pub async fn receive_stats(&mut self) -> Result<StatsPayload, ModuleError> {
        for attempt in 0..self.retry.max_attempts {
            match timeout(self.retry.delay_for(attempt), self.framed.next()).await {
                Ok(Some(Ok(frame))) => {
                    if frame.command != ServiceCommand::OkReply {
                        return Err(ModuleError::IpcError(format!(
                            "Unexpected reply {:?} from {}",
                            frame.command,
                            self.socket_path.display()
                        )));
                    }
                    return StatsPayload::from_bytes(&frame.payload);
                }
                Ok(Some(Err(e))) => {
                    return Err(ModuleError::IpcError(format!("Failed to read reply: {}", e)))
                }
                Ok(None) => {
                    return Err(ModuleError::IpcError(format!(
                        "{} closed the connection",
                        self.socket_path.display()
                    )))
                }
                Err(_) => debug!(
                    "No reply from {} yet (attempt {}/{})",
                    self.socket_path.display(),
                    attempt + 1,
                    self.retry.max_attempts
                ),
            }
        }
        Err(ModuleError::Timeout(format!(
            "receiving from {}",
            self.socket_path.display()
        )))
    }
}
