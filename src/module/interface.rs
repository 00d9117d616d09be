//! Instance interfaces
//!
//! An interface is one input or output data connection of an instance. The
//! transport is a sum type; every transport-dependent operation (CLI encoding,
//! link identity, client capacity) dispatches on it in one place.

use serde::{Deserialize, Serialize};

use crate::config::tree::InterfaceConfig;

/// Default capacity of an output interface's consumer list
pub const DEFAULT_CHILDREN_CAPACITY: usize = 10;

/// Data direction of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "IN")]
    In,
    #[serde(rename = "OUT")]
    Out,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => f.write_str("IN"),
            Direction::Out => f.write_str("OUT"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpParams {
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub max_clients: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TcpTlsParams {
    #[serde(default)]
    pub host: Option<String>,
    pub port: u16,
    #[serde(default)]
    pub max_clients: u16,
    pub keyfile: String,
    pub certfile: String,
    pub cafile: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UnixParams {
    pub socket_name: String,
    #[serde(default)]
    pub max_clients: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileParams {
    /// Location of the file on disk
    pub path: String,
    #[serde(default)]
    pub mode: Option<String>,
    /// Rotation size, 0 = unset
    #[serde(default)]
    pub size: u32,
    /// Rotation time, 0 = unset
    #[serde(default)]
    pub time: u32,
}

/// Transport of an interface together with its type-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Transport {
    #[serde(rename = "TCP")]
    Tcp(TcpParams),
    #[serde(rename = "TCP-TLS")]
    TcpTls(TcpTlsParams),
    #[serde(rename = "UNIXSOCKET")]
    Unix(UnixParams),
    #[serde(rename = "FILE")]
    File(FileParams),
    #[serde(rename = "BLACKHOLE")]
    Blackhole,
}

/// Identity under which an OUT interface is reachable by an IN interface
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LinkKey {
    Tcp(u16),
    TcpTls(u16),
    Unix(String),
}

/// Resource an OUT interface binds; two producers must never share one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BindKey {
    Port(u16),
    Socket(String),
}

impl std::fmt::Display for BindKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BindKey::Port(port) => write!(f, "port {}", port),
            BindKey::Socket(name) => write!(f, "socket '{}'", name),
        }
    }
}

impl Transport {
    /// Transport-specific part of the `-i` argument
    pub fn cli_arg(&self) -> String {
        match self {
            Transport::Tcp(p) => {
                let mut arg = String::from("t");
                if let Some(host) = &p.host {
                    arg.push(':');
                    arg.push_str(host);
                }
                arg.push_str(&format!(":{}", p.port));
                if p.max_clients > 0 {
                    arg.push_str(&format!(":{}", p.max_clients));
                }
                arg
            }
            Transport::TcpTls(p) => {
                let mut arg = String::from("T");
                if let Some(host) = &p.host {
                    arg.push(':');
                    arg.push_str(host);
                }
                arg.push_str(&format!(":{}", p.port));
                if p.max_clients > 0 {
                    arg.push_str(&format!(":{}", p.max_clients));
                }
                arg.push_str(&format!(":{}:{}:{}", p.keyfile, p.certfile, p.cafile));
                arg
            }
            Transport::Unix(p) => {
                let mut arg = format!("u:{}", p.socket_name);
                if p.max_clients > 0 {
                    arg.push_str(&format!(":{}", p.max_clients));
                }
                arg
            }
            Transport::File(p) => {
                let mut arg = format!("f:{}", p.path);
                if let Some(mode) = &p.mode {
                    arg.push(':');
                    arg.push_str(mode);
                }
                if p.size > 0 {
                    arg.push_str(&format!(":{}", p.size));
                }
                if p.time > 0 {
                    arg.push_str(&format!(":{}", p.time));
                }
                arg
            }
            Transport::Blackhole => String::from("b"),
        }
    }

    /// Matching identity; FILE and blackhole have no peer
    pub fn link_key(&self) -> Option<LinkKey> {
        match self {
            Transport::Tcp(p) => Some(LinkKey::Tcp(p.port)),
            Transport::TcpTls(p) => Some(LinkKey::TcpTls(p.port)),
            Transport::Unix(p) => Some(LinkKey::Unix(p.socket_name.clone())),
            Transport::File(_) | Transport::Blackhole => None,
        }
    }

    /// Bound resource; TCP and TCP-TLS compete for the same port space
    pub fn bind_key(&self) -> Option<BindKey> {
        match self {
            Transport::Tcp(p) => Some(BindKey::Port(p.port)),
            Transport::TcpTls(p) => Some(BindKey::Port(p.port)),
            Transport::Unix(p) => Some(BindKey::Socket(p.socket_name.clone())),
            Transport::File(_) | Transport::Blackhole => None,
        }
    }

    /// Explicit client limit, if configured
    pub fn max_clients(&self) -> Option<u16> {
        let max = match self {
            Transport::Tcp(p) => p.max_clients,
            Transport::TcpTls(p) => p.max_clients,
            Transport::Unix(p) => p.max_clients,
            Transport::File(_) | Transport::Blackhole => 0,
        };
        (max > 0).then_some(max)
    }

    pub fn unix_socket_name(&self) -> Option<&str> {
        match self {
            Transport::Unix(p) => Some(&p.socket_name),
            _ => None,
        }
    }

    /// Short type tag used in logs and graph labels
    pub fn type_name(&self) -> &'static str {
        match self {
            Transport::Tcp(_) => "TCP",
            Transport::TcpTls(_) => "TCP-TLS",
            Transport::Unix(_) => "UNIXSOCKET",
            Transport::File(_) => "FILE",
            Transport::Blackhole => "BLACKHOLE",
        }
    }
}

/// Live counters reported by the instance over its service channel
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceStats {
    /// Received (IN) or sent (OUT) messages
    pub messages: u64,
    /// Received (IN) or sent (OUT) buffers
    pub buffers: u64,
    /// OUT only
    pub dropped_messages: u64,
    /// OUT only
    pub autoflushes: u64,
    /// OUT only
    pub num_clients: i32,
    /// IN only, connection state as reported by the module
    pub state: i32,
    /// Transport type as reported by the module
    pub reported_type: i64,
    /// Identity as reported by the module
    pub reported_id: Option<String>,
}

/// One configured interface of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub direction: Direction,
    pub transport: Transport,
    pub buffer: Option<String>,
    pub autoflush: Option<String>,
    pub timeout: Option<String>,
    pub stats: InterfaceStats,
}

impl Interface {
    pub fn new(name: impl Into<String>, direction: Direction, transport: Transport) -> Self {
        Self {
            name: name.into(),
            direction,
            transport,
            buffer: None,
            autoflush: None,
            timeout: None,
            stats: InterfaceStats::default(),
        }
    }

    pub fn from_config(config: &InterfaceConfig) -> Self {
        Self {
            name: config.name.clone(),
            direction: config.direction,
            transport: config.transport.clone(),
            buffer: config.buffer.clone(),
            autoflush: config.autoflush.clone(),
            timeout: config.timeout.clone(),
            stats: InterfaceStats::default(),
        }
    }

    /// Full `-i` entry of this interface including optional settings
    pub fn cli_arg(&self) -> String {
        let mut arg = self.transport.cli_arg();
        if let Some(buffer) = &self.buffer {
            arg.push_str(":buffer=");
            arg.push_str(buffer);
        }
        if let Some(autoflush) = &self.autoflush {
            arg.push_str(":autoflush=");
            arg.push_str(autoflush);
        }
        if let Some(timeout) = &self.timeout {
            arg.push_str(":timeout=");
            arg.push_str(timeout);
        }
        arg
    }

    /// Initial capacity of the consumer list when this is a producer
    pub fn children_capacity(&self) -> usize {
        self.transport
            .max_clients()
            .map(usize::from)
            .unwrap_or(DEFAULT_CHILDREN_CAPACITY)
    }
}

/// Build the `-i` value: IN interfaces first, then OUT, comma separated
///
/// Returns `None` when there are no interfaces at all.
pub fn ifc_spec<'a>(
    inputs: impl IntoIterator<Item = &'a Interface>,
    outputs: impl IntoIterator<Item = &'a Interface>,
) -> Option<String> {
    let parts: Vec<String> = inputs
        .into_iter()
        .chain(outputs)
        .map(Interface::cli_arg)
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(","))
    }
}
