use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::binding::BindingInfo;

/// A type alias for handling `Result`s with `Error`
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the SIP transport layer
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket creation kept failing for a listener
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, #[source] io::Error),

    /// Socket close kept failing for a listener
    #[error("Failed to close listener on {0}: {1}")]
    CloseFailed(SocketAddr, #[source] io::Error),

    /// Failed to send data
    #[error("Failed to send to {0}: {1}")]
    SendFailed(SocketAddr, #[source] io::Error),

    /// Outbound connect failed
    #[error("Failed to connect to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] io::Error),

    /// The connection has not finished connecting
    #[error("Connection {0} is not connected yet")]
    NotConnected(BindingInfo),

    /// The connection socket has been closed
    #[error("Connection {0} is closed")]
    ConnectionClosed(BindingInfo),

    /// Packet exceeds the datagram size limit
    #[error("Packet too large: {0} bytes (max {1})")]
    PacketTooLarge(usize, usize),

    /// Transport type not handled by this operation
    #[error("Unsupported transport: {0}")]
    UnsupportedTransport(String),

    /// TLS configuration or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// TLS handshake did not complete in time
    #[error("TLS handshake with {0} timed out")]
    HandshakeTimeout(SocketAddr),

    /// Configuration rejected by validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The connection registry was dropped
    #[error("Connection registry is no longer available")]
    RegistryUnavailable,
}

impl Error {
    /// Returns true when the error means the peer or socket went away
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed(_) | Error::RegistryUnavailable)
    }
}

#[cfg(feature = "tls")]
impl From<rustls::Error> for Error {
    fn from(e: rustls::Error) -> Self {
        Error::Tls(e.to_string())
    }
}
