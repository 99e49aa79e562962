use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sipconn_transport::ConnectionLease;
use tracing::{debug, trace, warn};

use super::{Rel100Support, RemovalListener, TransactionKey, TransactionKind, TransactionState};
use crate::error::{Error, Result};
use crate::timer::{TimerId, TimerProfile};

/// Smallest RSeq a UAS may start from
pub const MIN_RSEQ: u32 = 1;
/// Largest RSeq value, 2^31 - 1
pub const MAX_RSEQ: u32 = (1 << 31) - 1;

#[derive(Debug, Default)]
struct Reliability {
    support: Rel100Support,
    /// Next RSeq to hand out on the server side
    next: Option<u32>,
    /// Set once a reliable provisional went out; the start can no longer change
    sent: bool,
    /// Last RSeq accepted on the client side
    last_received: Option<u32>,
    /// A provisional response other than 100 has been sent
    provisional_sent: bool,
}

/// Lifecycle state shared by every transaction.
///
/// The state lives in an `AtomicU8` so the CANCEL path and normal request
/// processing can race on it without a lock. Only the rarely touched parts
/// (listener, lease, RSeq bookkeeping) sit behind mutexes.
pub struct TransactionLifecycle {
    key: TransactionKey,
    kind: TransactionKind,
    profile: Arc<TimerProfile>,
    state: AtomicU8,
    fresh: AtomicBool,
    removal_listener: Mutex<Option<Arc<dyn RemovalListener>>>,
    connection: Mutex<Option<ConnectionLease>>,
    reliability: Mutex<Reliability>,
}

impl TransactionLifecycle {
    pub fn new(key: TransactionKey, profile: Arc<TimerProfile>) -> Self {
        let kind = TransactionKind::for_key(&key);
        Self {
            key,
            kind,
            profile,
            state: AtomicU8::new(TransactionState::New as u8),
            fresh: AtomicBool::new(true),
            removal_listener: Mutex::new(None),
            connection: Mutex::new(None),
            reliability: Mutex::new(Reliability::default()),
        }
    }

    pub fn key(&self) -> &TransactionKey {
        &self.key
    }

    pub fn kind(&self) -> TransactionKind {
        self.kind
    }

    pub fn profile(&self) -> &Arc<TimerProfile> {
        &self.profile
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// True for exactly one caller: whoever first looks the transaction up after creation
    pub fn is_new(&self) -> bool {
        self.fresh.swap(false, Ordering::AcqRel)
    }

    /// Moves New to Started. Calling it again on a started transaction is a no-op.
    pub fn mark_started(&self) -> Result<()> {
        match self.state.compare_exchange(
            TransactionState::New as u8,
            TransactionState::Started as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                trace!("Transaction {} started", self.key);
                Ok(())
            }
            Err(current) if current == TransactionState::Started as u8 => Ok(()),
            Err(current) => Err(Error::InvalidStateTransition(format!(
                "{} cannot start from {}",
                self.key,
                TransactionState::from_u8(current)
            ))),
        }
    }

    /// Cancels a transaction that has not started yet.
    ///
    /// Returns false once processing has begun; the caller then has to
    /// route the CANCEL through the normal state machine.
    pub fn try_mark_cancelled(&self) -> bool {
        let cancelled = self
            .state
            .compare_exchange(
                TransactionState::New as u8,
                TransactionState::Cancelled as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if cancelled {
            debug!("Transaction {} cancelled before processing", self.key);
        }
        cancelled
    }

    pub fn is_terminated(&self) -> bool {
        self.state() == TransactionState::Terminated
    }

    pub fn set_removal_listener(&self, listener: Arc<dyn RemovalListener>) {
        *self.removal_listener.lock() = Some(listener);
    }

    /// Terminates the transaction.
    ///
    /// Only the first call notifies the removal listener and releases the
    /// connection lease; it returns true, later calls return false.
    pub fn terminate(&self) -> bool {
        let previous = self.state.swap(TransactionState::Terminated as u8, Ordering::AcqRel);
        if previous == TransactionState::Terminated as u8 {
            return false;
        }
        debug!("Transaction {} terminated", self.key);

        let lease = self.connection.lock().take();
        drop(lease);

        let listener = self.removal_listener.lock().take();
        if let Some(listener) = listener {
            listener.transaction_removed(&self.key);
        }
        true
    }

    /// Holds a reference on `lease`'s connection until termination
    pub fn attach_connection(&self, lease: ConnectionLease) {
        if self.is_terminated() {
            return;
        }
        *self.connection.lock() = Some(lease);
    }

    pub fn connection(&self) -> Option<ConnectionLease> {
        self.connection.lock().clone()
    }

    /// Maximum lifetime from the timer profile, client or server side
    pub fn max_lifetime(&self) -> Duration {
        if self.kind.is_server() {
            self.profile.duration(TimerId::ServerTn)
        } else {
            self.profile.duration(TimerId::ClientTn)
        }
    }

    /// Retransmissions allowed for this kind; 0 for non-INVITE servers
    pub fn retry_limit(&self) -> u8 {
        self.kind
            .transaction_type()
            .map(|kind| self.profile.retries(kind))
            .unwrap_or(0)
    }

    pub fn rel100_support(&self) -> Rel100Support {
        self.reliability.lock().support
    }

    /// Changes 100rel support. Ignored once a provisional other than 100 has gone out.
    pub fn set_rel100_support(&self, support: Rel100Support) -> bool {
        let mut reliability = self.reliability.lock();
        if reliability.provisional_sent {
            warn!(
                "Ignoring 100rel change to {:?} on {}: a provisional response was already sent",
                support, self.key
            );
            return false;
        }
        reliability.support = support;
        true
    }

    /// Records a provisional response sent on this transaction
    pub fn mark_provisional_sent(&self, status: u16) {
        if (101..200).contains(&status) {
            self.reliability.lock().provisional_sent = true;
        }
    }

    /// Chooses the first RSeq; allowed once and only before the first reliable provisional
    pub fn set_starting_rseq(&self, rseq: u32) -> Result<()> {
        if !(MIN_RSEQ..=MAX_RSEQ).contains(&rseq) {
            return Err(Error::RSeqOutOfRange(u64::from(rseq)));
        }
        let mut reliability = self.reliability.lock();
        if reliability.sent || reliability.next.is_some() {
            return Err(Error::RSeqAlreadySet);
        }
        reliability.next = Some(rseq);
        Ok(())
    }

    /// RSeq for the next reliable provisional, starting at 1 when none was chosen
    pub fn next_rseq(&self) -> Result<u32> {
        let mut reliability = self.reliability.lock();
        let rseq = reliability.next.unwrap_or(MIN_RSEQ);
        if rseq > MAX_RSEQ {
            return Err(Error::RSeqOutOfRange(u64::from(rseq)));
        }
        reliability.next = Some(rseq + 1);
        reliability.sent = true;
        Ok(rseq)
    }

    /// Client side: accepts an RSeq if it is in range and follows the last one
    pub fn accept_rseq(&self, rseq: u32) -> bool {
        if !(MIN_RSEQ..=MAX_RSEQ).contains(&rseq) {
            return false;
        }
        let mut reliability = self.reliability.lock();
        let in_order = match reliability.last_received {
            None => true,
            Some(last) => rseq == last.wrapping_add(1),
        };
        if in_order {
            reliability.last_received = Some(rseq);
        } else {
            trace!("Dropping out-of-order RSeq {} on {}", rseq, self.key);
        }
        in_order
    }
}

impl std::fmt::Debug for TransactionLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLifecycle")
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}
