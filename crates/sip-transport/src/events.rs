use bytes::Bytes;

use crate::binding::BindingInfo;

/// Default channel capacity for transport events
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Events emitted by listeners and connection readers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Raw bytes read from a connection; framing happens above this layer
    DataReceived {
        binding: BindingInfo,
        data: Bytes,
    },

    /// A new inbound connection was registered
    ConnectionAccepted {
        binding: BindingInfo,
    },

    /// A connection reached end of stream or failed while reading
    ConnectionClosed {
        binding: BindingInfo,
    },

    /// Error on a receive path
    Error {
        error: String,
    },
}
