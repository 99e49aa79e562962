use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{BoxedWriter, Connection, ConnectionState};
use crate::binding::{BindingInfo, TransportType};
use crate::debug::{self, DebugPosition};
use crate::error::{Error, Result};

/// Longest a close waits for the write side to shut down cleanly
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A TCP or TLS connection.
///
/// The read half belongs to a [`MessageReader`](super::MessageReader); this
/// type owns the write half. An outbound connection starts without a writer
/// and in the connecting state until [`StreamConnection::connected`] is
/// called.
pub struct StreamConnection {
    state: ConnectionState,
    peer: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    queued: AtomicUsize,
}

struct QueuedSend<'a>(&'a AtomicUsize);

impl<'a> QueuedSend<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for QueuedSend<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl StreamConnection {
    /// Connection for an accepted (or already connected) stream
    pub fn accepted(
        local: SocketAddr,
        peer: SocketAddr,
        transport: TransportType,
        writer: BoxedWriter,
        timeout_secs: u64,
    ) -> Self {
        Self {
            state: ConnectionState::new(
                BindingInfo::connection(local, peer, transport),
                transport,
                timeout_secs,
            ),
            peer,
            writer: Mutex::new(Some(writer)),
            queued: AtomicUsize::new(0),
        }
    }

    /// Placeholder for an outbound connect that has not completed yet
    pub fn connecting(binding: BindingInfo, peer: SocketAddr, transport: TransportType, timeout_secs: u64) -> Self {
        Self {
            state: ConnectionState::connecting(binding, transport, timeout_secs),
            peer,
            writer: Mutex::new(None),
            queued: AtomicUsize::new(0),
        }
    }

    /// Installs the writer of a completed connect and marks the connection active
    pub async fn connected(&self, writer: BoxedWriter) -> Result<()> {
        let mut slot = self.writer.lock().await;
        if self.state.is_closed() {
            return Err(Error::ConnectionClosed(self.state.binding()));
        }
        *slot = Some(writer);
        self.state.update_timestamp();
        self.state.mark_connected();
        debug!("Connection {} established", self.state.binding());
        Ok(())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

#[async_trait]
impl Connection for StreamConnection {
    fn state(&self) -> &ConnectionState {
        &self.state
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        if self.state.is_connecting() {
            return Err(Error::NotConnected(self.state.binding()));
        }
        let _queued = QueuedSend::enter(&self.queued);
        let closed = self.state.closed_token();
        let write = async {
            let mut writer = self.writer.lock().await;
            let writer = writer
                .as_mut()
                .ok_or_else(|| Error::ConnectionClosed(self.state.binding()))?;

            debug::message_out(DebugPosition::Connection, &self.state.binding(), data);
            trace!("Writing {} bytes to {}", data.len(), self.peer);
            writer
                .write_all(data)
                .await
                .map_err(|e| Error::SendFailed(self.peer, e))?;
            writer.flush().await.map_err(|e| Error::SendFailed(self.peer, e))
        };

        // Closing the connection abandons a write the peer is not draining
        tokio::select! {
            biased;
            _ = closed.cancelled() => Err(Error::ConnectionClosed(self.state.binding())),
            written = write => {
                written?;
                self.state.update_timestamp();
                Ok(())
            }
        }
    }

    async fn send_to(&self, data: &[u8], _dest: SocketAddr) -> Result<()> {
        self.send(data).await
    }

    async fn close_socket(&self) -> Result<()> {
        self.state.mark_closed();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, writer.shutdown()).await {
                Ok(Err(e)) if e.kind() != std::io::ErrorKind::NotConnected => return Err(Error::Io(e)),
                Ok(_) => {}
                Err(_) => debug!("Shutdown of {} timed out, dropping the socket", self.state.binding()),
            }
        }
        Ok(())
    }

    fn queued_send_count(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }
}

impl fmt::Debug for StreamConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamConnection({}, {})", self.state.binding(), self.state.status())
    }
}
