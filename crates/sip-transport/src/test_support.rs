//! Fakes shared by the unit tests.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::binding::{BindingInfo, TransportType};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionState};
use crate::error::Result;
use crate::listener::{ListenPoint, Listener};
use crate::network::Network;

/// Listen point without a socket, recording every lifecycle call
#[derive(Default)]
pub(crate) struct FakePoint {
    transport: Option<TransportType>,
    port: u16,
    /// Number of upcoming `create_socket` calls that fail
    pub create_failures: AtomicUsize,
    pub fail_close: AtomicBool,
    /// Number of upcoming `do_listen` calls that fail
    pub listen_errors: AtomicUsize,
    pub panic_next: AtomicBool,
    pub creates: AtomicUsize,
    pub closes: AtomicUsize,
    pub listens: AtomicUsize,
    pub open: AtomicBool,
    /// When non-zero, each `do_listen` works this long and then succeeds
    pub step_millis: AtomicU64,
    /// Steps that ran to completion
    pub completed: AtomicUsize,
    socket: Mutex<CancellationToken>,
}

impl FakePoint {
    pub fn new(transport: TransportType, port: u16) -> Arc<Self> {
        Arc::new(Self {
            transport: Some(transport),
            port,
            ..Default::default()
        })
    }
}

#[async_trait]
impl ListenPoint for FakePoint {
    fn transport(&self) -> TransportType {
        self.transport.unwrap_or(TransportType::Tcp)
    }

    fn local_addr(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.open.load(Ordering::SeqCst).then(|| self.local_addr())
    }

    fn create_socket(&self) -> io::Result<()> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let remaining = self.create_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.create_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::AddrInUse, "address in use"));
        }
        *self.socket.lock() = CancellationToken::new();
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_socket(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "close failed"));
        }
        self.socket.lock().cancel();
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn do_listen(&self) -> io::Result<()> {
        self.listens.fetch_add(1, Ordering::SeqCst);
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("accept step exploded");
        }
        let remaining = self.listen_errors.load(Ordering::SeqCst);
        if remaining > 0 {
            self.listen_errors.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(io::ErrorKind::ConnectionAborted, "accept failed"));
        }
        let step = self.step_millis.load(Ordering::SeqCst);
        if step > 0 {
            tokio::time::sleep(Duration::from_millis(step)).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            return Ok(());
        }
        let socket = self.socket.lock().clone();
        socket.cancelled().await;
        Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"))
    }
}

pub(crate) fn network() -> Arc<Network> {
    Network::new("test", &TransportConfig::default())
}

pub(crate) fn listener(transport: TransportType, port: u16) -> (Arc<Listener>, Arc<FakePoint>) {
    let point = FakePoint::new(transport, port);
    (Listener::new(point.clone(), network()), point)
}

/// Connection that never touches the network
#[derive(Debug)]
pub(crate) struct MockConnection {
    state: ConnectionState,
    pub closes: AtomicUsize,
}

impl MockConnection {
    pub fn new(transport: TransportType, remote_port: u16, timeout_secs: u64) -> Arc<Self> {
        let binding = BindingInfo::connection(
            SocketAddr::from(([127, 0, 0, 1], 5060)),
            SocketAddr::from(([10, 0, 0, 1], remote_port)),
            transport,
        );
        Self::with_state(ConnectionState::new(binding, transport, timeout_secs))
    }

    pub fn with_state(state: ConnectionState) -> Arc<Self> {
        Arc::new(Self {
            state,
            closes: AtomicUsize::new(0),
        })
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(&self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn send_to(&self, _data: &[u8], _dest: SocketAddr) -> Result<()> {
        Ok(())
    }

    async fn close_socket(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.state.mark_closed();
        Ok(())
    }
}

/// Polls `condition` until it holds or a second has passed
pub(crate) async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
