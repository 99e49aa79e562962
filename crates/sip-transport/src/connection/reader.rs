use std::sync::{Arc, Weak};

use bytes::BytesMut;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use super::{BoxedReader, Connection};
use crate::debug::{self, DebugPosition};
use crate::events::TransportEvent;
use crate::registry::ConnectionRegistry;

/// Reads raw bytes from stream connections and forwards them as events.
///
/// When the peer closes the stream or a read fails, the connection is
/// removed from the registry. A connection closed locally stops its reader
/// through the connection's closed token.
#[derive(Clone)]
pub struct MessageReader {
    registry: Weak<ConnectionRegistry>,
    events_tx: mpsc::Sender<TransportEvent>,
    buffer_size: usize,
}

impl MessageReader {
    pub fn new(
        registry: &Arc<ConnectionRegistry>,
        events_tx: mpsc::Sender<TransportEvent>,
        buffer_size: usize,
    ) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            events_tx,
            buffer_size,
        }
    }

    pub fn events(&self) -> &mpsc::Sender<TransportEvent> {
        &self.events_tx
    }

    pub(crate) fn registry(&self) -> Option<Arc<ConnectionRegistry>> {
        self.registry.upgrade()
    }

    /// Spawns the read loop for `connection`
    pub fn attach(&self, connection: Arc<dyn Connection>, mut reader: BoxedReader) -> JoinHandle<()> {
        let this = self.clone();
        let closed = connection.state().closed_token();

        tokio::spawn(async move {
            let binding = connection.binding_info();
            let mut buf = BytesMut::with_capacity(this.buffer_size);

            loop {
                buf.reserve(this.buffer_size);
                let read = tokio::select! {
                    _ = closed.cancelled() => break,
                    read = reader.read_buf(&mut buf) => read,
                };

                match read {
                    Ok(0) => {
                        debug!("Connection {} closed by peer", binding);
                        break;
                    }
                    Ok(n) => {
                        trace!("Read {} bytes from {}", n, binding);
                        connection.update_timestamp();
                        let data = buf.split().freeze();
                        debug::message_in(DebugPosition::Reader, &binding, &data);
                        if let Err(e) = this.events_tx.send(TransportEvent::DataReceived { binding, data }).await {
                            error!("Error sending event: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        if !closed.is_cancelled() {
                            error!("Error reading from {}: {}", binding, e);
                        }
                        break;
                    }
                }
            }

            if !closed.is_cancelled() {
                if let Some(registry) = this.registry() {
                    registry.remove_if_same(&connection, false).await;
                } else if let Err(e) = connection.close_socket().await {
                    debug!("Error closing {}: {}", binding, e);
                }
            }
            let _ = this.events_tx.send(TransportEvent::ConnectionClosed { binding }).await;
        })
    }
}
