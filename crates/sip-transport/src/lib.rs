//! SIP transport and connection management.
//!
//! This crate owns every live network connection of a SIP stack (UDP
//! associations, TCP and TLS streams, multicast senders) and the listening
//! sockets that produce them:
//!
//! - [`ConnectionRegistry`] keeps the table of connections keyed by
//!   [`BindingInfo`], enforces the TCP+TLS connection ceiling by switching
//!   stream listeners on and off, and evicts idle unreferenced connections;
//! - [`Listener`] drives the lifecycle of a listening socket around a
//!   protocol-specific [`ListenPoint`];
//! - [`Connector`] opens outbound connections;
//! - [`MessageReader`] turns stream reads into [`TransportEvent`]s.
//!
//! Message framing and parsing happen above this crate.

pub mod binding;
pub mod config;
pub mod connection;
pub mod debug;
pub mod error;
pub mod events;
pub mod listener;
pub mod network;
pub mod registry;
#[cfg(feature = "tls")]
pub mod tls;

pub use binding::{BindingInfo, TransportType};
pub use config::TransportConfig;
pub use connection::{
    Connection, ConnectionEventHandler, ConnectionLease, ConnectionState, ConnectionStatus, Connector,
    MessageReader, MulticastConnection, StreamConnection, UdpConnection,
};
pub use debug::{set_transport_debug, DebugPosition, TransportDebug};
pub use error::{Error, Result};
pub use events::TransportEvent;
pub use listener::{ListenContext, ListenPoint, Listener, ListenerStatus, Selector, TcpListenPoint, UdpListenPoint};
#[cfg(feature = "tls")]
pub use listener::{TlsConnectionFactory, TlsListenPoint, TlsSelectorListenPoint};
pub use network::Network;
pub use registry::{ConnectionRegistry, ConnectionSummary, TransportCounts};
#[cfg(feature = "tls")]
pub use tls::TlsContext;

use std::sync::Arc;

use tokio::sync::mpsc;

/// Creates a registry, its event channel and the reader feeding it
pub fn new_registry(
    config: &TransportConfig,
) -> Result<(Arc<ConnectionRegistry>, MessageReader, mpsc::Receiver<TransportEvent>)> {
    let registry = ConnectionRegistry::new(config)?;
    let (tx, rx) = mpsc::channel(events::DEFAULT_CHANNEL_CAPACITY);
    let reader = MessageReader::new(&registry, tx, config.read_buffer_size);
    Ok((registry, reader, rx))
}

/// Re-export of common types for easier use
pub mod prelude {
    pub use crate::{
        new_registry, BindingInfo, Connection, ConnectionLease, ConnectionRegistry, ConnectionStatus, Connector,
        Error, ListenContext, Listener, Network, Result, TransportConfig, TransportEvent, TransportType,
    };
}

#[cfg(test)]
mod test_support;
