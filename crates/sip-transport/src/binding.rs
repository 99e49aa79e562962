//! Binding information: the 5-tuple that keys connections and listeners.
//!
//! A [`BindingInfo`] is a plain value. Connection keys carry every field,
//! listen keys leave the remote side unspecified and outbound lookup keys
//! leave the local side unspecified. Unspecified fields are stored as
//! sentinels and take part in equality and hashing like any other value.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Transport protocol of a connection or listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransportType {
    Udp,
    Tcp,
    Tls,
    Multicast,
}

impl TransportType {
    /// All transport types, in reporting order
    pub const ALL: [TransportType; 4] = [
        TransportType::Udp,
        TransportType::Tcp,
        TransportType::Tls,
        TransportType::Multicast,
    ];

    /// TCP and TLS connections count against the connection ceiling
    pub fn is_stream(&self) -> bool {
        matches!(self, TransportType::Tcp | TransportType::Tls)
    }

    /// Whether the transport retransmits on its own
    pub fn is_reliable(&self) -> bool {
        self.is_stream()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Udp => "UDP",
            TransportType::Tcp => "TCP",
            TransportType::Tls => "TLS",
            TransportType::Multicast => "MULTICAST",
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(TransportType::Udp),
            "TCP" => Ok(TransportType::Tcp),
            "TLS" => Ok(TransportType::Tls),
            "MULTICAST" => Ok(TransportType::Multicast),
            _ => Err(Error::UnsupportedTransport(s.to_string())),
        }
    }
}

/// The 5-tuple identifying a connection or a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindingInfo {
    local_addr: Option<IpAddr>,
    local_port: u16,
    remote_addr: Option<IpAddr>,
    remote_port: u16,
    transport: Option<TransportType>,
}

impl BindingInfo {
    /// Local port sentinel for keys that do not pin the local side
    pub const LOCAL_PORT_UNSPECIFIED: u16 = 0;
    /// Remote port sentinel used by listen keys
    pub const REMOTE_PORT_UNSPECIFIED: u16 = 0;
    /// Transport sentinel
    pub const TRANSPORT_UNSPECIFIED: Option<TransportType> = None;

    pub fn new(
        local_addr: Option<IpAddr>,
        local_port: u16,
        remote_addr: Option<IpAddr>,
        remote_port: u16,
        transport: Option<TransportType>,
    ) -> Self {
        Self {
            local_addr,
            local_port,
            remote_addr,
            remote_port,
            transport,
        }
    }

    /// Fully qualified key of an established connection
    pub fn connection(local: SocketAddr, remote: SocketAddr, transport: TransportType) -> Self {
        Self::new(
            Some(local.ip()),
            local.port(),
            Some(remote.ip()),
            remote.port(),
            Some(transport),
        )
    }

    /// Key of a listening socket; the remote side is unspecified
    pub fn listen(local: SocketAddr, transport: TransportType) -> Self {
        Self::new(
            Some(local.ip()),
            local.port(),
            None,
            Self::REMOTE_PORT_UNSPECIFIED,
            Some(transport),
        )
    }

    /// Key of an outbound connection whose local side is chosen by the OS
    pub fn remote(remote: SocketAddr, transport: TransportType) -> Self {
        Self::new(
            None,
            Self::LOCAL_PORT_UNSPECIFIED,
            Some(remote.ip()),
            remote.port(),
            Some(transport),
        )
    }

    pub fn local_addr(&self) -> Option<IpAddr> {
        self.local_addr
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn remote_addr(&self) -> Option<IpAddr> {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub fn transport(&self) -> Option<TransportType> {
        self.transport
    }

    pub fn is_local_port_specified(&self) -> bool {
        self.local_port != Self::LOCAL_PORT_UNSPECIFIED
    }

    pub fn is_remote_port_specified(&self) -> bool {
        self.remote_port != Self::REMOTE_PORT_UNSPECIFIED
    }

    pub fn is_transport_specified(&self) -> bool {
        self.transport.is_some()
    }

    /// Local socket address, if both address and port are specified
    pub fn local_socket_addr(&self) -> Option<SocketAddr> {
        match self.local_addr {
            Some(ip) if self.is_local_port_specified() => Some(SocketAddr::new(ip, self.local_port)),
            _ => None,
        }
    }

    /// Remote socket address, if both address and port are specified
    pub fn remote_socket_addr(&self) -> Option<SocketAddr> {
        match self.remote_addr {
            Some(ip) if self.is_remote_port_specified() => Some(SocketAddr::new(ip, self.remote_port)),
            _ => None,
        }
    }

    /// Copy of this key with a different transport
    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = Some(transport);
        self
    }
}

fn fmt_endpoint(f: &mut fmt::Formatter<'_>, addr: Option<IpAddr>, port: u16) -> fmt::Result {
    match addr {
        Some(IpAddr::V6(ip)) => write!(f, "[{}]", ip)?,
        Some(ip) => write!(f, "{}", ip)?,
        None => f.write_str("*")?,
    }
    if port == 0 {
        f.write_str(":*")
    } else {
        write!(f, ":{}", port)
    }
}

impl fmt::Display for BindingInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        fmt_endpoint(f, self.local_addr, self.local_port)?;
        f.write_str(" -> ")?;
        fmt_endpoint(f, self.remote_addr, self.remote_port)?;
        match self.transport {
            Some(t) => write!(f, " {}]", t),
            None => f.write_str(" *]"),
        }
    }
}
