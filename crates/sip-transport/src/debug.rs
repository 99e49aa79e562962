//! Optional transport-debug hook.
//!
//! A single process-wide slot receives a copy of every buffer that crosses
//! the transport, together with its binding. Nothing is called while the
//! slot is empty, and errors or panics raised by the hook are logged and
//! dropped so the send and receive paths never see them.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use lazy_static::lazy_static;
use parking_lot::RwLock;
use tracing::warn;

use crate::binding::BindingInfo;

/// Where in the stack a buffer was observed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebugPosition {
    /// Read by a datagram listener
    Listener,
    /// Written through a connection
    Connection,
    /// Read by a stream message reader
    Reader,
}

/// Receiver for copies of inbound and outbound buffers
pub trait TransportDebug: Send + Sync {
    fn message_in(&self, position: DebugPosition, binding: &BindingInfo, data: &[u8]) -> anyhow::Result<()>;

    fn message_out(&self, position: DebugPosition, binding: &BindingInfo, data: &[u8]) -> anyhow::Result<()>;
}

lazy_static! {
    static ref TRANSPORT_DEBUG: RwLock<Option<Arc<dyn TransportDebug>>> = RwLock::new(None);
}

/// Installs or clears the global transport-debug hook
pub fn set_transport_debug(hook: Option<Arc<dyn TransportDebug>>) {
    *TRANSPORT_DEBUG.write() = hook;
}

pub fn is_transport_debug_set() -> bool {
    TRANSPORT_DEBUG.read().is_some()
}

fn current() -> Option<Arc<dyn TransportDebug>> {
    TRANSPORT_DEBUG.read().clone()
}

fn invoke<F>(direction: &str, binding: &BindingInfo, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Transport debug hook failed on {} for {}: {}", direction, binding, e),
        Err(_) => warn!("Transport debug hook panicked on {} for {}", direction, binding),
    }
}

pub(crate) fn message_in(position: DebugPosition, binding: &BindingInfo, data: &[u8]) {
    if let Some(hook) = current() {
        invoke("message_in", binding, || hook.message_in(position, binding, data));
    }
}

pub(crate) fn message_out(position: DebugPosition, binding: &BindingInfo, data: &[u8]) {
    if let Some(hook) = current() {
        invoke("message_out", binding, || hook.message_out(position, binding, data));
    }
}
