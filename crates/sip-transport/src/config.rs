//! Transport configuration.
//!
//! Every field has a default, so a partial document deserializes cleanly.
//! Values that matter at runtime (ceiling, sweep period, timeouts) can also
//! be changed later through the registry and network setters.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default sweep period in seconds
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 60;
/// Default ceiling for live TCP+TLS connections with blocking listeners
pub const DEFAULT_MAX_CONNECTIONS: usize = 256;
/// Default ceiling when listeners run in selector mode
pub const DEFAULT_MAX_CONNECTIONS_NON_BLOCKING: usize = 256_000;
/// Idle timeout applied to connections, four hours
pub const DEFAULT_CONNECTION_TIMEOUT_SECS: u64 = 4 * 60 * 60;
pub const DEFAULT_TCP_BACKLOG: u32 = 50;
pub const DEFAULT_NON_BLOCKING_BACKLOG: u32 = 1024;
pub const DEFAULT_ACCEPT_QUEUE_CAPACITY: usize = 1024;
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_MULTICAST_TTL: u32 = 1;
pub const DEFAULT_SAMPLING_INTERVAL_SECS: u64 = 1;
/// Number of samples between two peak-count reports
pub const DEFAULT_NOTIFICATION_INTERVAL: u32 = 5;
/// Maximum UDP payload over IPv4
pub const MAX_UDP_PACKET_SIZE: usize = 65_507;
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Configuration for the connection registry, listeners and connections
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Sweep period in seconds
    pub cleanup_interval_secs: u64,
    /// Ceiling for live TCP+TLS connections
    pub max_connections: usize,
    pub incoming_connection_timeout_secs: u64,
    pub outgoing_connection_timeout_secs: u64,
    pub tcp_backlog: u32,
    pub non_blocking_backlog: u32,
    /// Raw accepted sockets waiting for a TLS handshake
    pub accept_queue_capacity: usize,
    pub handshake_timeout_ms: u64,
    pub multicast_ttl: u32,
    pub sampling_interval_secs: u64,
    pub notification_interval: u32,
    pub max_udp_packet_size: usize,
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            incoming_connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            outgoing_connection_timeout_secs: DEFAULT_CONNECTION_TIMEOUT_SECS,
            tcp_backlog: DEFAULT_TCP_BACKLOG,
            non_blocking_backlog: DEFAULT_NON_BLOCKING_BACKLOG,
            accept_queue_capacity: DEFAULT_ACCEPT_QUEUE_CAPACITY,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            sampling_interval_secs: DEFAULT_SAMPLING_INTERVAL_SECS,
            notification_interval: DEFAULT_NOTIFICATION_INTERVAL,
            max_udp_packet_size: MAX_UDP_PACKET_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl TransportConfig {
    /// Preset for selector-driven listeners, which can carry far more connections
    pub fn non_blocking() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS_NON_BLOCKING,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cleanup_interval_secs == 0 {
            return Err(Error::InvalidConfig("cleanup interval must be positive".into()));
        }
        if self.sampling_interval_secs == 0 {
            return Err(Error::InvalidConfig("sampling interval must be positive".into()));
        }
        if self.notification_interval == 0 {
            return Err(Error::InvalidConfig("notification interval must be positive".into()));
        }
        if self.accept_queue_capacity == 0 {
            return Err(Error::InvalidConfig("accept queue capacity must be positive".into()));
        }
        if self.read_buffer_size == 0 {
            return Err(Error::InvalidConfig("read buffer size must be positive".into()));
        }
        Ok(())
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling_interval_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.max_connections, 256);
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.incoming_connection_timeout_secs, 14_400);
        assert_eq!(TransportConfig::non_blocking().max_connections, 256_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: TransportConfig =
            serde_json::from_str(r#"{ "max_connections": 2, "cleanup_interval_secs": 5 }"#).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.cleanup_interval_secs, 5);
        assert_eq!(config.tcp_backlog, DEFAULT_TCP_BACKLOG);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let config = TransportConfig {
            cleanup_interval_secs: 0,
            ..TransportConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }
}
