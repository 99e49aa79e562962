//! The connection registry.
//!
//! One table maps [`BindingInfo`] keys to live connections and listening
//! sockets. A single lock guards the map, the per-transport counts and the
//! connection ceiling, so the live TCP+TLS count always equals the number of
//! stream entries in the map.
//!
//! # Admission control
//!
//! Once the number of live TCP+TLS connections reaches the ceiling, every
//! TCP/TLS listener is deactivated and new inbound stream connections are
//! refused at the OS level. UDP and multicast traffic is unaffected. The
//! check is level-triggered: every stream `put`, `remove`, sweep and ceiling
//! change converges listener state to `count < ceiling` while still holding
//! the table lock, so the boundary `count == ceiling` always means inactive.
//!
//! Socket closes happen after the lock is released.

mod maintenance;
mod snapshot;

pub use maintenance::ConnectionSampler;
pub use snapshot::{ConnectionDetail, ConnectionSummary, TransportSummary};

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::binding::{BindingInfo, TransportType};
use crate::config::TransportConfig;
use crate::connection::{same_connection, Connection};
use crate::error::{Error, Result};
use crate::listener::Listener;

use maintenance::Maintenance;

/// Number of table entries per transport
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransportCounts {
    pub udp: usize,
    pub tcp: usize,
    pub tls: usize,
    pub multicast: usize,
}

impl TransportCounts {
    pub fn get(&self, transport: TransportType) -> usize {
        match transport {
            TransportType::Udp => self.udp,
            TransportType::Tcp => self.tcp,
            TransportType::Tls => self.tls,
            TransportType::Multicast => self.multicast,
        }
    }

    fn slot(&mut self, transport: TransportType) -> &mut usize {
        match transport {
            TransportType::Udp => &mut self.udp,
            TransportType::Tcp => &mut self.tcp,
            TransportType::Tls => &mut self.tls,
            TransportType::Multicast => &mut self.multicast,
        }
    }

    /// Live TCP+TLS connections
    pub fn stream(&self) -> usize {
        self.tcp + self.tls
    }

    pub fn total(&self) -> usize {
        self.udp + self.tcp + self.tls + self.multicast
    }

    /// Field-wise maximum
    pub fn max(&self, other: &TransportCounts) -> TransportCounts {
        TransportCounts {
            udp: self.udp.max(other.udp),
            tcp: self.tcp.max(other.tcp),
            tls: self.tls.max(other.tls),
            multicast: self.multicast.max(other.multicast),
        }
    }
}

struct Table {
    connections: HashMap<BindingInfo, Arc<dyn Connection>>,
    counts: TransportCounts,
    max_connections: usize,
    listeners: HashMap<BindingInfo, Arc<Listener>>,
}

impl Table {
    fn admits_streams(&self) -> bool {
        self.counts.stream() < self.max_connections
    }

    fn insert(&mut self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let transport = connection.transport();
        let previous = self.connections.insert(connection.binding_info(), connection);
        if previous.is_none() {
            *self.counts.slot(transport) += 1;
        }
        previous
    }

    fn take(&mut self, key: &BindingInfo) -> Option<Arc<dyn Connection>> {
        let removed = self.connections.remove(key)?;
        let slot = self.counts.slot(removed.transport());
        *slot = slot.saturating_sub(1);
        Some(removed)
    }

    /// Drives every stream listener to `count < ceiling`
    fn converge_listeners(&self) {
        let active = self.admits_streams();
        for listener in self.listeners.values() {
            if !listener.transport().is_stream() || listener.is_active() == active {
                continue;
            }
            if active {
                info!(
                    "{} stream connections below ceiling {}, activating listener {}",
                    self.counts.stream(),
                    self.max_connections,
                    listener.key()
                );
            } else {
                warn!(
                    "{} stream connections reached ceiling {}, deactivating listener {}",
                    self.counts.stream(),
                    self.max_connections,
                    listener.key()
                );
            }
            if let Err(e) = listener.set_active(active) {
                warn!("Failed to set listener {} active={}: {}", listener.key(), active, e);
            }
        }
    }
}

/// Table of live connections and listening sockets
pub struct ConnectionRegistry {
    table: Mutex<Table>,
    udp_cursor: AtomicUsize,
    cleanup_interval_secs: AtomicU64,
    sampling_interval: Duration,
    notification_interval: u32,
    peak_counts: Mutex<TransportCounts>,
    maintenance: Mutex<Maintenance>,
}

impl ConnectionRegistry {
    pub fn new(config: &TransportConfig) -> Result<Arc<Self>> {
        config.validate()?;
        Ok(Arc::new(Self {
            table: Mutex::new(Table {
                connections: HashMap::new(),
                counts: TransportCounts::default(),
                max_connections: config.max_connections,
                listeners: HashMap::new(),
            }),
            udp_cursor: AtomicUsize::new(0),
            cleanup_interval_secs: AtomicU64::new(config.cleanup_interval_secs),
            sampling_interval: config.sampling_interval(),
            notification_interval: config.notification_interval,
            peak_counts: Mutex::new(TransportCounts::default()),
            maintenance: Mutex::new(Maintenance::default()),
        }))
    }

    /// Looks up a ready connection, skipping ones that are shutting down
    pub fn get(&self, key: &BindingInfo) -> Option<Arc<dyn Connection>> {
        self.get_with(key, true)
    }

    /// Looks up a ready connection. Connecting entries are never returned;
    /// shutting-down entries only when `check_shutdown` is false.
    pub fn get_with(&self, key: &BindingInfo, check_shutdown: bool) -> Option<Arc<dyn Connection>> {
        let table = self.table.lock();
        let connection = table.connections.get(key)?;
        if connection.is_connecting() {
            debug!("Connection {} is still connecting", key);
            return None;
        }
        if check_shutdown && connection.is_shutting_down() {
            debug!("Connection {} is shutting down", key);
            return None;
        }
        Some(connection.clone())
    }

    /// Like [`get`](Self::get) but also returns connecting entries
    pub fn get_active_or_connecting(&self, key: &BindingInfo) -> Option<Arc<dyn Connection>> {
        let table = self.table.lock();
        let connection = table.connections.get(key)?;
        if connection.is_shutting_down() {
            return None;
        }
        Some(connection.clone())
    }

    /// Inserts a connection under its own key, returning any entry it replaced.
    ///
    /// The replaced connection is not closed. Admission control never fails a
    /// put; it only changes listener state for what comes next.
    pub fn put(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let key = connection.binding_info();
        let transport = connection.transport();
        let mut table = self.table.lock();
        let previous = table.insert(connection);
        debug!(
            "Put connection {} ({}), {} stream connections",
            key,
            if previous.is_some() { "replaced" } else { "new" },
            table.counts.stream()
        );
        if transport.is_stream() {
            table.converge_listeners();
        }
        previous
    }

    /// Inserts `connection` unless a live entry already holds its key, in
    /// which case that entry is returned and the table is left unchanged
    pub fn put_if_absent(&self, connection: Arc<dyn Connection>) -> Option<Arc<dyn Connection>> {
        let key = connection.binding_info();
        let transport = connection.transport();
        let mut table = self.table.lock();
        if let Some(existing) = table.connections.get(&key) {
            if !existing.is_shutting_down() {
                return Some(existing.clone());
            }
        }
        table.insert(connection);
        if transport.is_stream() {
            table.converge_listeners();
        }
        None
    }

    /// Removes whatever is stored under the connection's key and closes the
    /// connection's socket unless `skip_close` is set.
    ///
    /// A connection that is still connecting is dropped from the table
    /// without closing, its connect attempt owns the socket. Returns true if
    /// an entry was removed.
    pub async fn remove(&self, connection: &Arc<dyn Connection>, skip_close: bool) -> bool {
        let removed = self.detach(connection, false);
        self.close_removed(connection, skip_close).await;
        removed
    }

    /// Like [`remove`](Self::remove), but a newer connection stored under the
    /// same key is left in place. Used when a connection reports its own end.
    pub async fn remove_if_same(&self, connection: &Arc<dyn Connection>, skip_close: bool) -> bool {
        let removed = self.detach(connection, true);
        self.close_removed(connection, skip_close).await;
        removed
    }

    /// Drops this very connection from the table without touching its socket
    pub(crate) fn forget(&self, connection: &Arc<dyn Connection>) -> bool {
        self.detach(connection, true)
    }

    fn detach(&self, connection: &Arc<dyn Connection>, only_same: bool) -> bool {
        let key = connection.binding_info();
        let mut table = self.table.lock();
        let stored_is_same = table
            .connections
            .get(&key)
            .map(|existing| same_connection(existing, connection));
        let removed = match stored_is_same {
            None => {
                debug!("Connection {} not in table", key);
                return false;
            }
            Some(false) if only_same => {
                debug!("Connection {} was replaced, leaving the newer entry", key);
                return false;
            }
            Some(same) => {
                if !same {
                    debug!("Removing replacement of {} by key", key);
                }
                table.take(&key)
            }
        };
        match removed {
            Some(removed) => {
                if removed.transport().is_stream() {
                    table.converge_listeners();
                }
                true
            }
            None => false,
        }
    }

    async fn close_removed(&self, connection: &Arc<dyn Connection>, skip_close: bool) {
        if connection.is_connecting() {
            debug!("Removed connecting connection {} without closing", connection.binding_info());
            return;
        }
        if !skip_close {
            close_quietly(connection).await;
        }
    }

    /// Evicts every connection that should close at `now` (millis).
    ///
    /// Returns the number of evicted connections. Evicted sockets are closed
    /// concurrently, each within [`CLOSE_TIMEOUT`].
    pub async fn sweep(&self, now: u64) -> usize {
        let evicted: Vec<Arc<dyn Connection>> = {
            let mut table = self.table.lock();
            let expired: Vec<BindingInfo> = table
                .connections
                .iter()
                .filter(|(_, connection)| connection.should_close(now))
                .map(|(key, _)| *key)
                .collect();
            let evicted = expired.iter().filter_map(|key| table.take(key)).collect();
            table.converge_listeners();
            evicted
        };

        for connection in &evicted {
            debug!("Sweeping idle connection {}", connection.binding_info());
        }
        close_all(&evicted).await;
        evicted.len()
    }

    pub fn max_connections(&self) -> usize {
        self.table.lock().max_connections
    }

    /// Changes the ceiling and converges listener state immediately
    pub fn set_max_connections(&self, max: usize) {
        let mut table = self.table.lock();
        info!("Max connections changed from {} to {}", table.max_connections, max);
        table.max_connections = max;
        table.converge_listeners();
    }

    /// Live TCP+TLS connections
    pub fn stream_connection_count(&self) -> usize {
        self.table.lock().counts.stream()
    }

    pub fn connection_count(&self) -> usize {
        self.table.lock().connections.len()
    }

    pub fn counts(&self) -> TransportCounts {
        self.table.lock().counts
    }

    /// Peak counts from the last completed sampling window
    pub fn peak_counts(&self) -> TransportCounts {
        *self.peak_counts.lock()
    }

    pub(crate) fn record_peak(&self, peak: TransportCounts) {
        *self.peak_counts.lock() = peak;
    }

    /// Sweep period
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.load(Ordering::Relaxed))
    }

    /// Registers a listener; a stream listener immediately follows admission state
    pub fn add_listener(&self, listener: Arc<Listener>) -> Result<()> {
        let mut table = self.table.lock();
        let key = listener.key();
        let mut result = Ok(());
        if listener.transport().is_stream() {
            result = listener.set_active(table.admits_streams());
        }
        table.listeners.insert(key, listener);
        info!("Added {} listener {}", key.transport().map(|t| t.as_str()).unwrap_or("*"), key);
        result
    }

    /// Forgets a listener without closing it
    pub fn remove_listener(&self, key: &BindingInfo) -> Option<Arc<Listener>> {
        self.table.lock().listeners.remove(key)
    }

    pub fn listener(&self, key: &BindingInfo) -> Option<Arc<Listener>> {
        self.table.lock().listeners.get(key).cloned()
    }

    pub fn listeners(&self) -> Vec<Arc<Listener>> {
        self.table.lock().listeners.values().cloned().collect()
    }

    pub fn listening_transports(&self) -> HashSet<TransportType> {
        self.table
            .lock()
            .listeners
            .values()
            .map(|listener| listener.transport())
            .collect()
    }

    /// Key of any listener bound for `transport`
    pub fn listen_key_for_transport(&self, transport: TransportType) -> Option<BindingInfo> {
        self.table
            .lock()
            .listeners
            .keys()
            .find(|key| key.transport() == Some(transport))
            .copied()
    }

    /// Picks UDP listen points in turn
    pub fn select_udp_listen_point(&self) -> Option<BindingInfo> {
        let table = self.table.lock();
        let keys: Vec<BindingInfo> = table
            .listeners
            .keys()
            .filter(|key| key.transport() == Some(TransportType::Udp))
            .copied()
            .collect();
        if keys.is_empty() {
            return None;
        }
        let index = self.udp_cursor.fetch_add(1, Ordering::Relaxed) % keys.len();
        Some(keys[index])
    }

    /// Activates or deactivates every registered listener.
    ///
    /// Stream listeners are only activated while admission allows it.
    /// Returns the first failure after trying all of them.
    pub fn set_listeners_active(&self, active: bool) -> Result<()> {
        let table = self.table.lock();
        let admits = table.admits_streams();
        let mut first_error = None;
        for listener in table.listeners.values() {
            let target = active && (admits || !listener.transport().is_stream());
            if let Err(e) = listener.set_active(target) {
                warn!("Failed to set listener {} active={}: {}", listener.key(), target, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Starts the maintenance tasks and activates all listeners
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.start_maintenance();
        self.set_listeners_active(true)
    }

    /// Stops maintenance, deactivates listeners and closes every connection
    pub async fn stop(&self) {
        self.stop_maintenance().await;
        if let Err(e) = self.set_listeners_active(false) {
            warn!("Error deactivating listeners: {}", e);
        }
        let drained = self.drain_connections();
        close_all(&drained).await;
        info!("Connection registry stopped, closed {} connections", drained.len());
    }

    /// Closes and removes every connection
    pub async fn clear_connections(&self) {
        let drained = self.drain_connections();
        self.table.lock().converge_listeners();
        close_all(&drained).await;
        debug!("Cleared {} connections", drained.len());
    }

    fn drain_connections(&self) -> Vec<Arc<dyn Connection>> {
        let mut table = self.table.lock();
        table.counts = TransportCounts::default();
        table.connections.drain().map(|(_, c)| c).collect()
    }

    /// Human-readable table contents
    pub fn dump(&self) -> String {
        let table = self.table.lock();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Connections ({} stream / ceiling {}):",
            table.counts.stream(),
            table.max_connections
        );
        for (key, connection) in &table.connections {
            let _ = writeln!(
                out,
                "  {} status={} refs={} timeout={}s",
                key,
                connection.status(),
                connection.state().ref_count(),
                connection.state().timeout()
            );
        }
        let _ = writeln!(out, "Listeners:");
        for (key, listener) in &table.listeners {
            let _ = writeln!(out, "  {} {:?}", key, listener.status());
        }
        out
    }

    fn validate_interval(interval: Duration) -> Result<()> {
        if interval.as_secs() == 0 {
            return Err(Error::InvalidConfig("cleanup interval must be at least one second".into()));
        }
        Ok(())
    }
}

/// Longest the registry waits on one socket close
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

async fn close_quietly(connection: &Arc<dyn Connection>) {
    match tokio::time::timeout(CLOSE_TIMEOUT, connection.close_socket()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Error closing connection {}: {}", connection.binding_info(), e),
        Err(_) => {
            warn!("Timed out closing connection {}", connection.binding_info());
            connection.state().mark_closed();
        }
    }
}

async fn close_all(connections: &[Arc<dyn Connection>]) {
    join_all(connections.iter().map(close_quietly)).await;
}

#[cfg(test)]
mod tests;
