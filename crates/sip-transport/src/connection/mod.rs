//! Connections: reference-counted network endpoints kept in the registry.
//!
//! Every variant (UDP, multicast, TCP, TLS) implements [`Connection`] and
//! embeds a [`ConnectionState`] holding the bookkeeping shared by all of
//! them: reference count, activity timestamp, idle timeout and status.
//!
//! A connection becomes eligible for eviction once nobody holds a reference
//! and it has been idle for longer than its timeout, see
//! [`Connection::should_close`].

mod connector;
mod lease;
mod reader;
mod stream;
mod udp;

pub use connector::Connector;
pub use lease::ConnectionLease;
pub use reader::MessageReader;
pub use stream::StreamConnection;
pub use udp::{MulticastConnection, UdpConnection};

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::binding::{BindingInfo, TransportType};
use crate::error::Result;

/// Read half handed to a [`MessageReader`]
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Write half owned by a [`StreamConnection`]
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Application data attached to a connection
pub type ApplicationContext = Arc<dyn Any + Send + Sync>;

/// Milliseconds since the Unix epoch, the clock used for idle tracking
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Lifecycle status of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectionStatus {
    /// Outbound connect still in progress
    #[serde(rename = "connecting")]
    Connecting,
    #[serde(rename = "active")]
    Active,
    /// Closing or closed; no further sends are valid
    #[serde(rename = "shuttingDown")]
    ShuttingDown,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Active => "active",
            ConnectionStatus::ShuttingDown => "shuttingDown",
        })
    }
}

/// Notified when a connection's socket is closed
pub trait ConnectionEventHandler: Send + Sync {
    fn connection_closed(&self, binding: &BindingInfo);
}

/// Bookkeeping shared by every connection variant
pub struct ConnectionState {
    binding: BindingInfo,
    transport: TransportType,
    ref_count: AtomicU32,
    timestamp: AtomicU64,
    timeout_secs: AtomicU64,
    persistent: AtomicBool,
    status: watch::Sender<ConnectionStatus>,
    closed: CancellationToken,
    app_context: Mutex<Option<ApplicationContext>>,
    event_handler: Mutex<Option<Arc<dyn ConnectionEventHandler>>>,
}

impl ConnectionState {
    /// State for a connection that is ready to carry traffic
    pub fn new(binding: BindingInfo, transport: TransportType, timeout_secs: u64) -> Self {
        Self::with_status(binding, transport, timeout_secs, ConnectionStatus::Active)
    }

    /// State for an outbound connection whose connect has not completed
    pub fn connecting(binding: BindingInfo, transport: TransportType, timeout_secs: u64) -> Self {
        Self::with_status(binding, transport, timeout_secs, ConnectionStatus::Connecting)
    }

    fn with_status(
        binding: BindingInfo,
        transport: TransportType,
        timeout_secs: u64,
        status: ConnectionStatus,
    ) -> Self {
        let (status, _) = watch::channel(status);
        Self {
            binding: binding.with_transport(transport),
            transport,
            ref_count: AtomicU32::new(0),
            timestamp: AtomicU64::new(now_millis()),
            timeout_secs: AtomicU64::new(timeout_secs),
            persistent: AtomicBool::new(false),
            status,
            closed: CancellationToken::new(),
            app_context: Mutex::new(None),
            event_handler: Mutex::new(None),
        }
    }

    pub fn binding(&self) -> BindingInfo {
        self.binding
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn ref_count(&self) -> u32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub fn add_reference(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; reaching zero starts the idle clock
    pub fn remove_reference(&self) {
        match self
            .ref_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1))
        {
            Ok(1) => self.update_timestamp(),
            Ok(_) => {}
            Err(_) => warn!("remove_reference on unreferenced connection {}", self.binding),
        }
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Acquire)
    }

    pub fn update_timestamp(&self) {
        self.timestamp.store(now_millis(), Ordering::Release);
    }

    pub fn timeout(&self) -> u64 {
        self.timeout_secs.load(Ordering::Acquire)
    }

    pub fn set_timeout(&self, secs: u64) {
        self.timeout_secs.store(secs, Ordering::Release);
    }

    /// Unreferenced and idle for longer than the timeout at `now` (millis)
    pub fn should_close(&self, now: u64) -> bool {
        if self.ref_count() > 0 {
            return false;
        }
        let idle = now.saturating_sub(self.timestamp());
        idle > self.timeout().saturating_mul(1000)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::Acquire)
    }

    pub fn set_persistent(&self, persistent: bool) {
        self.persistent.store(persistent, Ordering::Release);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    pub fn is_connecting(&self) -> bool {
        self.status() == ConnectionStatus::Connecting
    }

    pub fn is_shutting_down(&self) -> bool {
        self.status() == ConnectionStatus::ShuttingDown
    }

    /// Connecting -> Active; a closed connection stays closed
    pub fn mark_connected(&self) -> bool {
        self.status.send_if_modified(|status| {
            if *status == ConnectionStatus::Connecting {
                *status = ConnectionStatus::Active;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_shutting_down(&self) {
        self.status.send_replace(ConnectionStatus::ShuttingDown);
    }

    /// Waits for a pending connect to resolve; true if the connection is usable
    pub async fn wait_until_connected(&self) -> bool {
        let mut rx = self.status.subscribe();
        let result = rx.wait_for(|status| *status != ConnectionStatus::Connecting).await;
        matches!(result.as_deref(), Ok(ConnectionStatus::Active))
    }

    /// Token cancelled once the socket is closed
    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the socket closed and fires the event handler once
    pub fn mark_closed(&self) -> bool {
        self.mark_shutting_down();
        if self.closed.is_cancelled() {
            return false;
        }
        self.closed.cancel();
        debug!("Connection {} closed", self.binding);
        let handler = self.event_handler.lock().take();
        if let Some(handler) = handler {
            handler.connection_closed(&self.binding);
        }
        true
    }

    pub fn application_context(&self) -> Option<ApplicationContext> {
        self.app_context.lock().clone()
    }

    pub fn set_application_context(&self, context: Option<ApplicationContext>) {
        *self.app_context.lock() = context;
    }

    pub fn set_event_handler(&self, handler: Option<Arc<dyn ConnectionEventHandler>>) {
        *self.event_handler.lock() = handler;
    }

    /// Applies the per-connection options a caller may request in one go
    pub fn set_connection_options(
        &self,
        persistent: bool,
        handler: Option<Arc<dyn ConnectionEventHandler>>,
        timeout_secs: Option<u64>,
        context: Option<ApplicationContext>,
    ) {
        self.set_persistent(persistent);
        self.set_event_handler(handler);
        if let Some(secs) = timeout_secs {
            self.set_timeout(secs);
        }
        self.set_application_context(context);
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("binding", &self.binding)
            .field("ref_count", &self.ref_count())
            .field("timestamp", &self.timestamp())
            .field("timeout_secs", &self.timeout())
            .field("status", &self.status())
            .finish()
    }
}

/// A network endpoint that can carry SIP traffic
#[async_trait]
pub trait Connection: Send + Sync + fmt::Debug {
    fn state(&self) -> &ConnectionState;

    /// Sends to the connection's remote peer
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Sends to an explicit destination; stream connections ignore it
    async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()>;

    /// Closes the underlying socket; no further sends are valid afterwards
    async fn close_socket(&self) -> Result<()>;

    /// Sends currently waiting for the socket
    fn queued_send_count(&self) -> usize {
        0
    }

    fn binding_info(&self) -> BindingInfo {
        self.state().binding()
    }

    fn transport(&self) -> TransportType {
        self.state().transport()
    }

    fn add_reference(&self) {
        self.state().add_reference()
    }

    fn remove_reference(&self) {
        self.state().remove_reference()
    }

    fn should_close(&self, now: u64) -> bool {
        self.state().should_close(now)
    }

    fn update_timestamp(&self) {
        self.state().update_timestamp()
    }

    fn set_timeout(&self, secs: u64) {
        self.state().set_timeout(secs)
    }

    fn status(&self) -> ConnectionStatus {
        self.state().status()
    }

    fn is_connecting(&self) -> bool {
        self.state().is_connecting()
    }

    fn is_shutting_down(&self) -> bool {
        self.state().is_shutting_down()
    }
}

/// Identity comparison for shared connections
pub(crate) fn same_connection(a: &Arc<dyn Connection>, b: &Arc<dyn Connection>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
