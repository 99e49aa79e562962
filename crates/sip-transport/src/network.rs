//! Logical network configuration.
//!
//! Listeners register their keys here once their socket is bound and
//! deregister before closing, so the set always reflects sockets that can
//! still accept work.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::binding::BindingInfo;
use crate::config::TransportConfig;

#[derive(Debug)]
pub struct Network {
    name: String,
    listeners: Mutex<HashSet<BindingInfo>>,
    incoming_timeout_secs: AtomicU64,
    outgoing_timeout_secs: AtomicU64,
}

impl Network {
    pub fn new(name: impl Into<String>, config: &TransportConfig) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            listeners: Mutex::new(HashSet::new()),
            incoming_timeout_secs: AtomicU64::new(config.incoming_connection_timeout_secs),
            outgoing_timeout_secs: AtomicU64::new(config.outgoing_connection_timeout_secs),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Records a bound listener; returns false if it was already registered
    pub fn add_listener(&self, key: BindingInfo) -> bool {
        let added = self.listeners.lock().insert(key);
        debug!("Network {}: registered listener {}", self.name, key);
        added
    }

    pub fn remove_listener(&self, key: &BindingInfo) -> bool {
        let removed = self.listeners.lock().remove(key);
        if removed {
            debug!("Network {}: deregistered listener {}", self.name, key);
        }
        removed
    }

    pub fn has_listener(&self, key: &BindingInfo) -> bool {
        self.listeners.lock().contains(key)
    }

    pub fn listeners(&self) -> Vec<BindingInfo> {
        self.listeners.lock().iter().copied().collect()
    }

    /// Idle timeout in seconds for inbound connections
    pub fn incoming_connection_timeout(&self) -> u64 {
        self.incoming_timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_incoming_connection_timeout(&self, secs: u64) {
        self.incoming_timeout_secs.store(secs, Ordering::Relaxed);
    }

    /// Idle timeout in seconds for outbound connections
    pub fn outgoing_connection_timeout(&self) -> u64 {
        self.outgoing_timeout_secs.load(Ordering::Relaxed)
    }

    pub fn set_outgoing_connection_timeout(&self, secs: u64) {
        self.outgoing_timeout_secs.store(secs, Ordering::Relaxed);
    }
}
