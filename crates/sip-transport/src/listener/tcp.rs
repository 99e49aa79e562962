use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio_stream::Stream;
use tracing::info;

use super::{closed_socket_error, ListenContext, ListenPoint};
use crate::binding::TransportType;
use crate::connection::StreamConnection;

/// Opens a non-blocking listening socket with address reuse and the given backlog
pub(crate) fn bind_stream_listener(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;
    socket.set_nonblocking(true)?;
    TcpListener::from_std(socket.into())
}

/// A listening socket slot.
///
/// Accepts only borrow the socket while polling, so [`close`](Self::close)
/// releases the port at once even while an accept is pending. The pending
/// accept is woken and fails with a closed-socket error, even if the slot is
/// reopened before it runs again.
#[derive(Clone, Default)]
pub struct SharedListener {
    slot: Arc<Mutex<Option<TcpListener>>>,
    closed: Arc<AtomicWaker>,
    closes: Arc<AtomicU64>,
}

impl SharedListener {
    pub fn open(&self, listener: TcpListener) {
        *self.slot.lock() = Some(listener);
    }

    /// Drops the socket; returns false if it was already closed
    pub fn close(&self) -> bool {
        let was_open = {
            let mut slot = self.slot.lock();
            self.closes.fetch_add(1, Ordering::AcqRel);
            slot.take().is_some()
        };
        self.closed.wake();
        was_open
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.slot.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    fn poll_accept(&self, opened_at: u64, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        self.closed.register(cx.waker());
        let slot = self.slot.lock();
        match slot.as_ref() {
            Some(listener) if self.closes.load(Ordering::Acquire) == opened_at => listener.poll_accept(cx),
            _ => Poll::Ready(Err(closed_socket_error())),
        }
    }

    /// Waits for one connection; fails if the socket is closed meanwhile
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        let opened_at = self.closes.load(Ordering::Acquire);
        poll_fn(|cx| self.poll_accept(opened_at, cx)).await
    }
}

/// Ends once the socket is closed
impl Stream for SharedListener {
    type Item = io::Result<TcpStream>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.closed.register(cx.waker());
        match self.slot.lock().as_ref() {
            Some(listener) => listener
                .poll_accept(cx)
                .map(|accepted| Some(accepted.map(|(stream, _)| stream))),
            None => Poll::Ready(None),
        }
    }
}

/// Blocking-model TCP listen point
pub struct TcpListenPoint {
    addr: SocketAddr,
    backlog: u32,
    socket: SharedListener,
    context: Arc<ListenContext>,
}

impl TcpListenPoint {
    pub fn new(addr: SocketAddr, backlog: u32, context: Arc<ListenContext>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            backlog,
            socket: SharedListener::default(),
            context,
        })
    }
}

#[async_trait]
impl ListenPoint for TcpListenPoint {
    fn transport(&self) -> TransportType {
        TransportType::Tcp
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.socket.local_addr()
    }

    fn create_socket(&self) -> io::Result<()> {
        let listener = bind_stream_listener(self.addr, self.backlog)?;
        info!("SIP TCP listener bound to {}", listener.local_addr()?);
        self.socket.open(listener);
        Ok(())
    }

    fn close_socket(&self) -> io::Result<()> {
        self.socket.close();
        Ok(())
    }

    async fn do_listen(&self) -> io::Result<()> {
        let (stream, peer) = self.socket.accept().await?;
        let local = stream.local_addr()?;
        stream.set_nodelay(true)?;
        let (read_half, write_half) = stream.into_split();
        let connection = Arc::new(StreamConnection::accepted(
            local,
            peer,
            TransportType::Tcp,
            Box::new(write_half),
            self.context.incoming_timeout(),
        ));
        self.context.admit(connection, Box::new(read_half))
    }
}
