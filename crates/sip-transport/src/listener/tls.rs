use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use super::selector::{AcceptQueue, Selector};
use super::tcp::{bind_stream_listener, SharedListener};
use super::{ListenContext, ListenPoint};
use crate::binding::TransportType;
use crate::connection::{BoxedReader, StreamConnection};
use crate::error::Error;

/// Runs the server side of the TLS handshake for raw accepted sockets
#[derive(Clone)]
pub struct TlsConnectionFactory {
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl TlsConnectionFactory {
    pub fn new(acceptor: TlsAcceptor, handshake_timeout: Duration) -> Self {
        Self {
            acceptor,
            handshake_timeout,
        }
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    async fn handshake(&self, stream: TcpStream, timeout_secs: u64) -> io::Result<(Arc<StreamConnection>, BoxedReader)> {
        let local = stream.local_addr()?;
        let peer = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let tls = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, Error::HandshakeTimeout(peer)))??;

        let (read_half, write_half) = tokio::io::split(tls);
        let connection = StreamConnection::accepted(local, peer, TransportType::Tls, Box::new(write_half), timeout_secs);
        Ok((Arc::new(connection), Box::new(read_half)))
    }

    /// Handshakes `stream` and admits the result, on a task of its own
    pub fn create_connection(&self, stream: TcpStream, context: Arc<ListenContext>) -> JoinHandle<()> {
        let factory = self.clone();
        tokio::spawn(async move {
            let peer = stream.peer_addr().ok();
            match factory.handshake(stream, context.incoming_timeout()).await {
                Ok((connection, reader)) => {
                    if let Err(e) = context.admit(connection, reader) {
                        warn!("Unable to register TLS connection from {:?}: {}", peer, e);
                    }
                }
                Err(e) => warn!("TLS handshake with {:?} failed: {}", peer, e),
            }
        })
    }
}

/// Blocking-model TLS listen point; each handshake runs inside `do_listen`
pub struct TlsListenPoint {
    addr: SocketAddr,
    backlog: u32,
    socket: SharedListener,
    factory: TlsConnectionFactory,
    context: Arc<ListenContext>,
}

impl TlsListenPoint {
    pub fn new(addr: SocketAddr, backlog: u32, factory: TlsConnectionFactory, context: Arc<ListenContext>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            backlog,
            socket: SharedListener::default(),
            factory,
            context,
        })
    }
}

#[async_trait]
impl ListenPoint for TlsListenPoint {
    fn transport(&self) -> TransportType {
        TransportType::Tls
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    fn create_socket(&self) -> io::Result<()> {
        let listener = bind_stream_listener(self.addr, self.backlog)?;
        info!("SIP TLS listener bound to {}", listener.local_addr()?);
        self.socket.open(listener);
        Ok(())
    }

    fn close_socket(&self) -> io::Result<()> {
        self.socket.close();
        Ok(())
    }

    async fn do_listen(&self) -> io::Result<()> {
        let (stream, _) = self.socket.accept().await?;
        let (connection, reader) = self
            .factory
            .handshake(stream, self.context.incoming_timeout())
            .await?;
        self.context.admit(connection, reader)
    }
}

/// Selector-driven TLS listen point.
///
/// The shared [`Selector`] accepts raw sockets into a bounded queue; each
/// `do_listen` takes one queued socket and starts its handshake on a task, so
/// a slow peer never holds up the accept path.
pub struct TlsSelectorListenPoint {
    addr: SocketAddr,
    backlog: u32,
    selector: Arc<Selector>,
    socket: SharedListener,
    registration: Mutex<Option<u64>>,
    queue: Arc<AcceptQueue>,
    factory: TlsConnectionFactory,
    context: Arc<ListenContext>,
}

impl TlsSelectorListenPoint {
    pub fn new(
        addr: SocketAddr,
        backlog: u32,
        queue_capacity: usize,
        selector: Arc<Selector>,
        factory: TlsConnectionFactory,
        context: Arc<ListenContext>,
    ) -> Arc<Self> {
        Arc::new(Self {
            addr,
            backlog,
            selector,
            socket: SharedListener::default(),
            registration: Mutex::new(None),
            queue: AcceptQueue::new(addr, queue_capacity),
            factory,
            context,
        })
    }

    /// Sockets accepted but not yet handed to a handshake
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.lock().is_some()
    }

    fn process(&self, stream: TcpStream) {
        debug!("Processing queued connection on {}", self.addr);
        self.factory.create_connection(stream, self.context.clone());
    }
}

#[async_trait]
impl ListenPoint for TlsSelectorListenPoint {
    fn transport(&self) -> TransportType {
        TransportType::Tls
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    fn create_socket(&self) -> io::Result<()> {
        let listener = bind_stream_listener(self.addr, self.backlog)?;
        info!("SIP TLS selector listener bound to {}", listener.local_addr()?);
        self.socket.open(listener);
        self.queue.reopen();
        match self.selector.register(self.socket.clone(), self.queue.clone()) {
            Ok(id) => {
                *self.registration.lock() = Some(id);
                Ok(())
            }
            Err(e) => {
                self.socket.close();
                Err(e)
            }
        }
    }

    fn close_socket(&self) -> io::Result<()> {
        self.socket.close();
        if let Some(id) = self.registration.lock().take() {
            if let Err(e) = self.selector.deregister(id) {
                debug!("Deregistering {} from selector: {}", self.addr, e);
            }
        }
        let dropped = self.queue.close();
        if dropped > 0 {
            info!("Closed {} queued connections on {}", dropped, self.addr);
        }
        Ok(())
    }

    async fn do_listen(&self) -> io::Result<()> {
        let stream = self.queue.pop().await?;
        self.process(stream);
        Ok(())
    }
}
