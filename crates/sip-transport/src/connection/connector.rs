use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use super::{BoxedReader, BoxedWriter, Connection, MessageReader, MulticastConnection, StreamConnection, UdpConnection};
use crate::binding::{BindingInfo, TransportType};
use crate::config::DEFAULT_HANDSHAKE_TIMEOUT_MS;
use crate::error::{Error, Result};
use crate::network::Network;
use crate::registry::ConnectionRegistry;
#[cfg(feature = "tls")]
use crate::tls::TlsContext;

/// Opens outbound connections and registers them.
///
/// A stream connect is entered into the registry in the connecting state
/// before the socket is opened, so concurrent senders to the same peer wait
/// for one connect instead of racing their own. If the caller gives up on a
/// connect, the placeholder is closed and dropped from the registry so the
/// next attempt starts afresh.
pub struct Connector {
    registry: Arc<ConnectionRegistry>,
    reader: MessageReader,
    network: Arc<Network>,
    #[cfg(feature = "tls")]
    tls: Option<TlsContext>,
    handshake_timeout: Duration,
    multicast_ttl: u32,
}

/// Owns a registered connecting placeholder until the connect completes
struct PendingConnect<'a> {
    registry: &'a ConnectionRegistry,
    connection: Arc<dyn Connection>,
    armed: bool,
}

impl PendingConnect<'_> {
    fn complete(mut self) -> Arc<dyn Connection> {
        self.armed = false;
        self.connection.clone()
    }
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!("Abandoning connect to {}", self.connection.binding_info());
            self.connection.state().mark_closed();
            self.registry.forget(&self.connection);
        }
    }
}

impl Connector {
    pub fn new(registry: Arc<ConnectionRegistry>, reader: MessageReader, network: Arc<Network>) -> Self {
        Self {
            registry,
            reader,
            network,
            #[cfg(feature = "tls")]
            tls: None,
            handshake_timeout: Duration::from_millis(DEFAULT_HANDSHAKE_TIMEOUT_MS),
            multicast_ttl: 1,
        }
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsContext) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Bounds the client side of an outbound TLS handshake
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_multicast_ttl(mut self, ttl: u32) -> Self {
        self.multicast_ttl = ttl;
        self
    }

    /// Returns the registered connection to `remote`, connecting first if needed
    pub async fn get_or_connect(&self, remote: SocketAddr, transport: TransportType) -> Result<Arc<dyn Connection>> {
        let key = BindingInfo::remote(remote, transport);
        if let Some(existing) = self.registry.get_active_or_connecting(&key) {
            return self.await_connected(existing).await;
        }

        match transport {
            TransportType::Udp => self.open_udp(remote).await,
            TransportType::Multicast => self.open_multicast(remote),
            TransportType::Tcp | TransportType::Tls => self.open_stream(key, remote, transport).await,
        }
    }

    async fn await_connected(&self, connection: Arc<dyn Connection>) -> Result<Arc<dyn Connection>> {
        if connection.is_connecting() {
            debug!("Waiting for pending connect to {}", connection.binding_info());
            if !connection.state().wait_until_connected().await {
                return Err(Error::NotConnected(connection.binding_info()));
            }
        }
        Ok(connection)
    }

    async fn open_udp(&self, remote: SocketAddr) -> Result<Arc<dyn Connection>> {
        let local = match remote {
            SocketAddr::V4(_) => SocketAddr::from(([0, 0, 0, 0], 0)),
            SocketAddr::V6(_) => SocketAddr::from(([0u16; 8], 0)),
        };
        let connection: Arc<dyn Connection> = Arc::new(
            UdpConnection::bind(local, remote, self.network.outgoing_connection_timeout()).await?,
        );
        Ok(self.register(connection))
    }

    fn open_multicast(&self, remote: SocketAddr) -> Result<Arc<dyn Connection>> {
        let group = match remote {
            SocketAddr::V4(group) if group.ip().is_multicast() => group,
            other => return Err(Error::UnsupportedTransport(format!("{} is not an IPv4 multicast group", other))),
        };
        let connection: Arc<dyn Connection> = Arc::new(MulticastConnection::bind(
            0,
            group,
            self.multicast_ttl,
            self.network.outgoing_connection_timeout(),
        )?);
        debug!("Opened multicast sender for {}", group);
        Ok(self.register(connection))
    }

    /// Registers a datagram connection unless one was registered meanwhile
    fn register(&self, connection: Arc<dyn Connection>) -> Arc<dyn Connection> {
        match self.registry.put_if_absent(connection.clone()) {
            Some(existing) => existing,
            None => connection,
        }
    }

    async fn open_stream(
        &self,
        key: BindingInfo,
        remote: SocketAddr,
        transport: TransportType,
    ) -> Result<Arc<dyn Connection>> {
        let pending = Arc::new(StreamConnection::connecting(
            key,
            remote,
            transport,
            self.network.outgoing_connection_timeout(),
        ));
        let connection: Arc<dyn Connection> = pending.clone();
        if let Some(existing) = self.registry.put_if_absent(connection.clone()) {
            return self.await_connected(existing).await;
        }
        let guard = PendingConnect {
            registry: &self.registry,
            connection,
            armed: true,
        };

        info!("Connecting to {} over {}", remote, transport);
        let (reader, writer) = self.connect_stream(remote, transport).await?;
        pending.connected(writer).await?;
        let connection = guard.complete();
        self.reader.attach(connection.clone(), reader);
        Ok(connection)
    }

    async fn connect_stream(&self, remote: SocketAddr, transport: TransportType) -> Result<(BoxedReader, BoxedWriter)> {
        let stream = TcpStream::connect(remote)
            .await
            .map_err(|e| Error::ConnectFailed(remote, e))?;
        stream.set_nodelay(true)?;

        match transport {
            TransportType::Tcp => {
                let (read_half, write_half) = stream.into_split();
                Ok((Box::new(read_half), Box::new(write_half)))
            }
            #[cfg(feature = "tls")]
            TransportType::Tls => {
                let tls = self
                    .tls
                    .as_ref()
                    .ok_or_else(|| Error::Tls("no TLS context configured".into()))?;
                let handshake = tls.connector()?.connect(tls.server_name_for(remote)?, stream);
                let stream = tokio::time::timeout(self.handshake_timeout, handshake)
                    .await
                    .map_err(|_| Error::HandshakeTimeout(remote))?
                    .map_err(|e| Error::ConnectFailed(remote, e))?;
                let (read_half, write_half) = tokio::io::split(stream);
                Ok((Box::new(read_half), Box::new(write_half)))
            }
            other => Err(Error::UnsupportedTransport(other.to_string())),
        }
    }
}
