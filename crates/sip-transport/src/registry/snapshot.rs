//! Read-only views of the table for monitoring.

use std::net::IpAddr;

use serde::Serialize;

use super::ConnectionRegistry;
use crate::binding::TransportType;
use crate::connection::ConnectionStatus;

/// Connection counts for one transport, split by status
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportSummary {
    pub total: usize,
    pub active: usize,
    pub shutting_down: usize,
    pub connecting: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub udp: TransportSummary,
    pub tcp: TransportSummary,
    pub tls: TransportSummary,
    pub multicast: TransportSummary,
}

impl ConnectionSummary {
    pub fn get(&self, transport: TransportType) -> &TransportSummary {
        match transport {
            TransportType::Udp => &self.udp,
            TransportType::Tcp => &self.tcp,
            TransportType::Tls => &self.tls,
            TransportType::Multicast => &self.multicast,
        }
    }

    fn get_mut(&mut self, transport: TransportType) -> &mut TransportSummary {
        match transport {
            TransportType::Udp => &mut self.udp,
            TransportType::Tcp => &mut self.tcp,
            TransportType::Tls => &mut self.tls,
            TransportType::Multicast => &mut self.multicast,
        }
    }
}

/// One row of the per-connection view
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetail {
    pub local_ip: Option<IpAddr>,
    pub local_port: u16,
    pub remote_ip: Option<IpAddr>,
    pub remote_port: u16,
    pub transport: TransportType,
    pub state: ConnectionStatus,
    pub queued_sends: usize,
}

impl ConnectionRegistry {
    pub fn summary(&self) -> ConnectionSummary {
        let table = self.table.lock();
        let mut summary = ConnectionSummary::default();
        for connection in table.connections.values() {
            let entry = summary.get_mut(connection.transport());
            entry.total += 1;
            match connection.status() {
                ConnectionStatus::Active => entry.active += 1,
                ConnectionStatus::ShuttingDown => entry.shutting_down += 1,
                ConnectionStatus::Connecting => entry.connecting += 1,
            }
        }
        summary
    }

    pub fn details(&self) -> Vec<ConnectionDetail> {
        let table = self.table.lock();
        table
            .connections
            .values()
            .map(|connection| {
                let binding = connection.binding_info();
                ConnectionDetail {
                    local_ip: binding.local_addr(),
                    local_port: binding.local_port(),
                    remote_ip: binding.remote_addr(),
                    remote_port: binding.remote_port(),
                    transport: connection.transport(),
                    state: connection.status(),
                    queued_sends: connection.queued_send_count(),
                }
            })
            .collect()
    }
}
