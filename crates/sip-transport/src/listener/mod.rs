//! Listener lifecycle.
//!
//! A [`Listener`] is one reusable state machine,
//! `Inactive -> Initializing -> Active -> Closing -> Inactive`, driving a
//! [`ListenPoint`] that knows how to open its socket, close it and perform
//! one unit of accept work. The accept loop runs on its own task while the
//! listener is active.
//!
//! Listen points come in two execution models:
//!
//! - blocking: [`TcpListenPoint`], [`TlsListenPoint`], [`UdpListenPoint`] wait
//!   on the OS accept (or receive) inside `do_listen`;
//! - selector-driven: [`TlsSelectorListenPoint`] lets a shared [`Selector`]
//!   perform raw accepts into a bounded queue, and `do_listen` drains one
//!   queued socket per iteration into a handshake task.

mod selector;
mod tcp;
#[cfg(feature = "tls")]
mod tls;
mod udp;

pub use selector::{AcceptQueue, Selectable, Selector};
pub use tcp::{SharedListener, TcpListenPoint};
#[cfg(feature = "tls")]
pub use tls::{TlsConnectionFactory, TlsListenPoint, TlsSelectorListenPoint};
pub use udp::UdpListenPoint;

use std::any::Any;
use std::io;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::binding::{BindingInfo, TransportType};
use crate::connection::{BoxedReader, Connection, MessageReader};
use crate::error::{Error, Result};
use crate::events::TransportEvent;
use crate::network::Network;
use crate::registry::ConnectionRegistry;

/// Attempts at creating the listening socket before giving up
pub const MAX_CREATE_TRIES: usize = 20;
/// Attempts at closing the listening socket before giving up
pub const MAX_CLOSE_TRIES: usize = 3;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Lifecycle status of a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerStatus {
    Inactive,
    Initializing,
    Active,
    Closing,
}

/// Protocol-specific part of a listener
#[async_trait]
pub trait ListenPoint: Send + Sync + 'static {
    fn transport(&self) -> TransportType;

    /// Configured address
    fn local_addr(&self) -> SocketAddr;

    /// Address the socket is actually bound to, once open
    fn bound_addr(&self) -> Option<SocketAddr>;

    /// Opens and binds the socket
    fn create_socket(&self) -> io::Result<()>;

    /// Closes the socket. A `do_listen` still waiting for a socket must wake
    /// and fail; one that already has its socket finishes its work.
    fn close_socket(&self) -> io::Result<()>;

    /// One unit of accept work: accept, register with the registry, start reading
    async fn do_listen(&self) -> io::Result<()>;
}

/// Shared plumbing handed to listen points
pub struct ListenContext {
    reader: MessageReader,
    network: Arc<Network>,
    incoming_timeout_secs: AtomicU64,
}

impl ListenContext {
    pub fn new(reader: MessageReader, network: Arc<Network>) -> Arc<Self> {
        Arc::new(Self {
            incoming_timeout_secs: AtomicU64::new(network.incoming_connection_timeout()),
            reader,
            network,
        })
    }

    pub fn network(&self) -> &Arc<Network> {
        &self.network
    }

    pub fn reader(&self) -> &MessageReader {
        &self.reader
    }

    pub fn events(&self) -> &tokio::sync::mpsc::Sender<TransportEvent> {
        self.reader.events()
    }

    /// Idle timeout applied to accepted connections
    pub fn incoming_timeout(&self) -> u64 {
        self.incoming_timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_incoming_timeout(&self, secs: u64) {
        self.incoming_timeout_secs.store(secs, Ordering::Relaxed);
    }

    pub(crate) fn registry(&self) -> io::Result<Arc<ConnectionRegistry>> {
        self.reader
            .registry()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, Error::RegistryUnavailable))
    }

    /// Registers an accepted stream connection, then starts reading from it
    pub(crate) fn admit(&self, connection: Arc<dyn Connection>, reader: BoxedReader) -> io::Result<()> {
        let registry = self.registry()?;
        let binding = connection.binding_info();
        connection.set_timeout(self.incoming_timeout());
        registry.put(connection.clone());
        self.reader.attach(connection, reader);
        debug!("Accepted connection {}", binding);
        let _ = self.events().try_send(TransportEvent::ConnectionAccepted { binding });
        Ok(())
    }
}

struct ListenerInner {
    status: ListenerStatus,
    shutdown: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

/// Lifecycle around a [`ListenPoint`]
pub struct Listener {
    key: BindingInfo,
    point: Arc<dyn ListenPoint>,
    network: Arc<Network>,
    inner: Mutex<ListenerInner>,
    running: AtomicBool,
    context: Option<Weak<ListenContext>>,
}

impl Listener {
    pub fn new(point: Arc<dyn ListenPoint>, network: Arc<Network>) -> Arc<Self> {
        Self::build(point, network, None)
    }

    /// Listener whose incoming timeout can be changed through the context
    pub fn with_context(point: Arc<dyn ListenPoint>, context: &Arc<ListenContext>) -> Arc<Self> {
        Self::build(point, context.network().clone(), Some(Arc::downgrade(context)))
    }

    fn build(point: Arc<dyn ListenPoint>, network: Arc<Network>, context: Option<Weak<ListenContext>>) -> Arc<Self> {
        Arc::new(Self {
            key: BindingInfo::listen(point.local_addr(), point.transport()),
            point,
            network,
            inner: Mutex::new(ListenerInner {
                status: ListenerStatus::Inactive,
                shutdown: None,
                task: None,
            }),
            running: AtomicBool::new(false),
            context,
        })
    }

    pub fn key(&self) -> BindingInfo {
        self.key
    }

    pub fn transport(&self) -> TransportType {
        self.point.transport()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.point.local_addr()
    }

    pub fn bound_addr(&self) -> Option<SocketAddr> {
        self.point.bound_addr()
    }

    pub fn status(&self) -> ListenerStatus {
        self.inner.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.status() == ListenerStatus::Active
    }

    /// True while an accept loop is executing
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Applies to connections accepted after the call
    pub fn set_incoming_connection_timeout(&self, secs: u64) {
        if let Some(context) = self.context.as_ref().and_then(Weak::upgrade) {
            context.set_incoming_timeout(secs);
        }
    }

    /// Moves the listener to the requested side; a no-op if already there.
    ///
    /// Activation needs a tokio runtime to host the accept loop.
    pub fn set_active(self: &Arc<Self>, active: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        let is_active = inner.status == ListenerStatus::Active;
        if active == is_active {
            return Ok(());
        }

        if active {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| Error::Io(io::Error::new(io::ErrorKind::Other, e)))?;
            inner.status = ListenerStatus::Initializing;
            if let Err(e) = self.initialize() {
                inner.status = ListenerStatus::Inactive;
                return Err(e);
            }

            let token = CancellationToken::new();
            let previous = inner.task.take();
            let this = Arc::clone(self);
            let loop_token = token.clone();
            inner.task = Some(runtime.spawn(async move {
                if let Some(previous) = previous {
                    let _ = previous.await;
                }
                this.run(loop_token).await;
            }));
            inner.shutdown = Some(token);
            inner.status = ListenerStatus::Active;
            info!("Listener {} active", self.key);
        } else {
            inner.status = ListenerStatus::Closing;
            if let Some(token) = inner.shutdown.take() {
                token.cancel();
            }
            let result = self.do_close();
            inner.status = ListenerStatus::Inactive;
            info!("Listener {} inactive", self.key);
            result?;
        }
        Ok(())
    }

    /// Creates the socket with bounded retries, then registers with the network
    fn initialize(&self) -> Result<()> {
        let mut last_error = None;
        for attempt in 1..=MAX_CREATE_TRIES {
            match self.point.create_socket() {
                Ok(()) => {
                    self.network.add_listener(self.key);
                    return Ok(());
                }
                Err(e) => {
                    debug!("Attempt {} to create socket for {} failed: {}", attempt, self.key, e);
                    last_error = Some(e);
                }
            }
        }
        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "error constructing server socket"));
        error!("Giving up creating socket for {}: {}", self.key, error);
        Err(Error::BindFailed(self.point.local_addr(), error))
    }

    /// Deregisters from the network, then closes the socket with bounded retries
    fn do_close(&self) -> Result<()> {
        self.network.remove_listener(&self.key);
        let mut last_error = None;
        for attempt in 1..=MAX_CLOSE_TRIES {
            match self.point.close_socket() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Attempt {} to close socket for {} failed: {}", attempt, self.key, e);
                    last_error = Some(e);
                }
            }
        }
        let error = last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "error closing server socket"));
        Err(Error::CloseFailed(self.point.local_addr(), error))
    }

    /// Accept loop. Returns immediately if another loop is already running.
    ///
    /// `shutdown` is only checked between iterations: a step in progress
    /// runs to completion, and a step still waiting for a socket is woken by
    /// the socket close that accompanies deactivation.
    pub async fn run(&self, shutdown: CancellationToken) {
        if self.running.swap(true, Ordering::AcqRel) {
            debug!("Listener {} loop already running", self.key);
            return;
        }
        debug!("Listener {} loop started", self.key);

        while !shutdown.is_cancelled() {
            let outcome = AssertUnwindSafe(self.point.do_listen()).catch_unwind().await;

            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if shutdown.is_cancelled() {
                        break;
                    }
                    error!("Exception in socket listening on {}: {}", self.key, e);
                    self.report_error(&e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
                Err(panic) => {
                    error!("Listener {} accept step panicked: {}", self.key, panic_message(&panic));
                }
            }
        }

        self.running.store(false, Ordering::Release);
        debug!("Listener {} loop stopped", self.key);
    }

    fn report_error(&self, e: &io::Error) {
        if let Some(context) = self.context.as_ref().and_then(Weak::upgrade) {
            let _ = context.events().try_send(TransportEvent::Error {
                error: format!("{}: {}", self.key, e),
            });
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listener({}, {:?})", self.key, self.status())
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

pub(crate) fn closed_socket_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "listening socket is closed")
}
