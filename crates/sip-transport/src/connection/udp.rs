use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

use super::{Connection, ConnectionState};
use crate::binding::{BindingInfo, TransportType};
use crate::config::MAX_UDP_PACKET_SIZE;
use crate::debug::{self, DebugPosition};
use crate::error::{Error, Result};

fn check_size(data: &[u8]) -> Result<()> {
    if data.len() > MAX_UDP_PACKET_SIZE {
        return Err(Error::PacketTooLarge(data.len(), MAX_UDP_PACKET_SIZE));
    }
    Ok(())
}

/// A UDP association with one remote peer.
///
/// Inbound associations share the datagram listener's socket; outbound ones
/// bind their own ephemeral socket. Closing never closes a shared socket.
pub struct UdpConnection {
    state: ConnectionState,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
}

impl UdpConnection {
    /// Association over an existing socket, typically the listener's
    pub fn new(
        socket: Arc<UdpSocket>,
        binding: BindingInfo,
        remote: SocketAddr,
        transport: TransportType,
        timeout_secs: u64,
    ) -> Self {
        Self {
            state: ConnectionState::new(binding, transport, timeout_secs),
            socket,
            remote,
        }
    }

    /// Outbound association on a fresh socket, keyed by the remote side only
    pub async fn bind(local: SocketAddr, remote: SocketAddr, timeout_secs: u64) -> Result<Self> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| Error::BindFailed(local, e))?;
        debug!("Bound outbound UDP socket {} for {}", socket.local_addr()?, remote);
        Ok(Self::new(
            Arc::new(socket),
            BindingInfo::remote(remote, TransportType::Udp),
            remote,
            TransportType::Udp,
            timeout_secs,
        ))
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().map_err(Error::Io)
    }
}

#[async_trait]
impl Connection for UdpConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_to(data, self.remote).await
    }

    async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        if self.state.is_closed() {
            return Err(Error::ConnectionClosed(self.state.binding()));
        }
        check_size(data)?;
        debug::message_out(DebugPosition::Connection, &self.state.binding(), data);
        trace!("Sending {} byte datagram to {}", data.len(), dest);
        self.socket
            .send_to(data, dest)
            .await
            .map_err(|e| Error::SendFailed(dest, e))?;
        self.state.update_timestamp();
        Ok(())
    }

    async fn close_socket(&self) -> Result<()> {
        self.state.mark_closed();
        Ok(())
    }
}

impl fmt::Debug for UdpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UdpConnection({})", self.state.binding())
    }
}

/// A sending socket for an IPv4 multicast group.
///
/// The TTL is applied on every send so a changed value takes effect for the
/// next datagram.
pub struct MulticastConnection {
    state: ConnectionState,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    group: SocketAddrV4,
    ttl: u32,
}

impl MulticastConnection {
    /// Binds a reusable socket on `local_port` for sending to `group`
    pub fn bind(local_port: u16, group: SocketAddrV4, ttl: u32, timeout_secs: u64) -> Result<Self> {
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port));
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket
            .bind(&local.into())
            .map_err(|e| Error::BindFailed(local, e))?;
        socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(socket.into())?;
        let local = socket.local_addr()?;
        debug!("Multicast socket {} bound for group {} (ttl {})", local, group, ttl);

        Ok(Self {
            state: ConnectionState::new(
                BindingInfo::remote(SocketAddr::V4(group), TransportType::Multicast),
                TransportType::Multicast,
                timeout_secs,
            ),
            socket: Mutex::new(Some(Arc::new(socket))),
            group,
            ttl,
        })
    }

    pub fn group(&self) -> SocketAddrV4 {
        self.group
    }

    pub fn ttl(&self) -> u32 {
        self.ttl
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| Error::ConnectionClosed(self.state.binding()))
    }
}

#[async_trait]
impl Connection for MulticastConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        self.send_to(data, SocketAddr::V4(self.group)).await
    }

    async fn send_to(&self, data: &[u8], dest: SocketAddr) -> Result<()> {
        let socket = self.socket()?;
        check_size(data)?;
        socket.set_multicast_ttl_v4(self.ttl)?;
        debug::message_out(DebugPosition::Connection, &self.state.binding(), data);
        socket
            .send_to(data, dest)
            .await
            .map_err(|e| Error::SendFailed(dest, e))?;
        self.state.update_timestamp();
        Ok(())
    }

    async fn close_socket(&self) -> Result<()> {
        self.socket.lock().take();
        self.state.mark_closed();
        Ok(())
    }
}

impl fmt::Debug for MulticastConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MulticastConnection({}, ttl {})", self.state.binding(), self.ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_udp_send_updates_timestamp() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let conn = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), peer_addr, 60)
            .await
            .unwrap();
        let before = conn.state().timestamp();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        conn.send(b"OPTIONS sip:a@b SIP/2.0\r\n\r\n").await.unwrap();
        assert!(conn.state().timestamp() > before);

        let mut buf = [0u8; 64];
        let (n, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"OPTIONS sip:a@b SIP/2.0\r\n\r\n");
        assert_eq!(from, conn.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_udp_closed_rejects_send() {
        let conn = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap(), 60)
            .await
            .unwrap();
        conn.close_socket().await.unwrap();
        assert!(matches!(conn.send(b"x").await, Err(Error::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_udp_rejects_oversized_packet() {
        let conn = UdpConnection::bind("127.0.0.1:0".parse().unwrap(), "127.0.0.1:9".parse().unwrap(), 60)
            .await
            .unwrap();
        let big = vec![0u8; MAX_UDP_PACKET_SIZE + 1];
        assert!(matches!(conn.send(&big).await, Err(Error::PacketTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_multicast_keyed_by_group() {
        let group = SocketAddrV4::new(Ipv4Addr::new(224, 0, 1, 75), 5060);
        let conn = MulticastConnection::bind(0, group, 1, 60).unwrap();
        assert_eq!(conn.transport(), TransportType::Multicast);
        assert_eq!(
            conn.binding_info(),
            BindingInfo::remote(SocketAddr::V4(group), TransportType::Multicast)
        );
        assert_eq!(conn.ttl(), 1);

        conn.close_socket().await.unwrap();
        assert!(matches!(conn.send(b"x").await, Err(Error::ConnectionClosed(_))));
    }
}
