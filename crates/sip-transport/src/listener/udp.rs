use std::future::poll_fn;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::Poll;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::task::AtomicWaker;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::ReadBuf;
use tokio::net::UdpSocket;
use tracing::{info, trace};

use super::{closed_socket_error, ListenContext, ListenPoint};
use crate::binding::{BindingInfo, TransportType};
use crate::connection::{Connection, UdpConnection};
use crate::debug::{self, DebugPosition};
use crate::events::TransportEvent;

/// Datagram listen point for unicast UDP or an IPv4 multicast group.
///
/// Each datagram is attributed to a per-peer [`UdpConnection`] sharing this
/// socket; the association is created in the registry on first contact.
pub struct UdpListenPoint {
    addr: SocketAddr,
    transport: TransportType,
    group: Option<Ipv4Addr>,
    max_packet_size: usize,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    closed: AtomicWaker,
    closes: AtomicU64,
    recv_buf: Mutex<BytesMut>,
    context: Arc<ListenContext>,
}

impl UdpListenPoint {
    pub fn new(addr: SocketAddr, max_packet_size: usize, context: Arc<ListenContext>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            transport: TransportType::Udp,
            group: None,
            max_packet_size,
            socket: Mutex::new(None),
            closed: AtomicWaker::new(),
            closes: AtomicU64::new(0),
            recv_buf: Mutex::new(BytesMut::new()),
            context,
        })
    }

    /// Listens on `port` and joins `group` on the default interface
    pub fn multicast(group: Ipv4Addr, port: u16, max_packet_size: usize, context: Arc<ListenContext>) -> Arc<Self> {
        Arc::new(Self {
            addr: SocketAddr::new(IpAddr::V4(group), port),
            transport: TransportType::Multicast,
            group: Some(group),
            max_packet_size,
            socket: Mutex::new(None),
            closed: AtomicWaker::new(),
            closes: AtomicU64::new(0),
            recv_buf: Mutex::new(BytesMut::new()),
            context,
        })
    }

    /// The bound socket, shared with the associations it carries
    pub fn socket(&self) -> Option<Arc<UdpSocket>> {
        self.socket.lock().clone()
    }

    fn open(&self) -> io::Result<UdpSocket> {
        let bind_addr = match self.group {
            Some(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.addr.port()),
            None => self.addr,
        };
        let socket = Socket::new(Domain::for_address(bind_addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&bind_addr.into())?;
        if let Some(group) = self.group {
            socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
        }
        socket.set_nonblocking(true)?;
        UdpSocket::from_std(socket.into())
    }
}

#[async_trait]
impl ListenPoint for UdpListenPoint {
    fn transport(&self) -> TransportType {
        self.transport
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    fn create_socket(&self) -> io::Result<()> {
        let socket = self.open()?;
        info!("SIP {} transport bound to {}", self.transport, socket.local_addr()?);
        *self.socket.lock() = Some(Arc::new(socket));
        Ok(())
    }

    fn close_socket(&self) -> io::Result<()> {
        {
            let mut socket = self.socket.lock();
            self.closes.fetch_add(1, Ordering::AcqRel);
            socket.take();
        }
        self.closed.wake();
        Ok(())
    }

    async fn do_listen(&self) -> io::Result<()> {
        let opened_at = self.closes.load(Ordering::Acquire);
        let (data, source) = poll_fn(|cx| {
            self.closed.register(cx.waker());
            let guard = self.socket.lock();
            let socket = match guard.as_ref() {
                Some(socket) if self.closes.load(Ordering::Acquire) == opened_at => socket,
                _ => return Poll::Ready(Err(closed_socket_error())),
            };
            let mut buf = self.recv_buf.lock();
            if buf.len() < self.max_packet_size {
                buf.resize(self.max_packet_size, 0);
            }
            let mut read_buf = ReadBuf::new(&mut buf[..self.max_packet_size]);
            match socket.poll_recv_from(cx, &mut read_buf) {
                Poll::Ready(Ok(source)) => Poll::Ready(Ok((Bytes::copy_from_slice(read_buf.filled()), source))),
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await?;

        let socket = self.socket().ok_or_else(closed_socket_error)?;
        let binding = BindingInfo::connection(socket.local_addr()?, source, self.transport);
        trace!("Received {} byte datagram on {}", data.len(), binding);

        let registry = self.context.registry()?;
        let connection = match registry.get(&binding) {
            Some(connection) => connection,
            None => {
                let connection: Arc<dyn Connection> = Arc::new(UdpConnection::new(
                    socket,
                    binding,
                    source,
                    self.transport,
                    self.context.incoming_timeout(),
                ));
                registry.put(connection.clone());
                connection
            }
        };
        connection.update_timestamp();
        debug::message_in(DebugPosition::Listener, &binding, &data);

        self.context
            .events()
            .send(TransportEvent::DataReceived { binding, data })
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "transport event channel closed"))
    }
}
