//! Service channel IPC
//!
//! Each instance whose module supports it listens on a private UNIX socket
//! (`trap-service_<pid>.sock`) and answers stats requests with a JSON document
//! describing its interface counters.

pub mod client;
pub mod protocol;

pub use client::ServiceClient;
pub use protocol::{ServiceCodec, ServiceCommand, ServiceFrame, StatsPayload};
