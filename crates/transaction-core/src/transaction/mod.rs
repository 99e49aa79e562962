//! Shared transaction state that every concrete SIP transaction builds on.
//!
//! Concrete state machines (INVITE client, non-INVITE server, ...) live above
//! this crate. What they share is here: the coarse lifecycle
//! (new, started, cancelled, terminated), the removal callback fired on
//! termination, reliable-provisional sequence numbers and the timer profile
//! lookups that depend on the transaction kind.

mod lifecycle;

pub use lifecycle::{TransactionLifecycle, MAX_RSEQ, MIN_RSEQ};

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};

use crate::timer::TransactionType;

/// Identifies a transaction: the top Via branch, the method and the side
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionKey {
    pub branch: String,
    /// Upper-case method name; CANCEL and ACK get their own keys
    pub method: String,
    pub is_server: bool,
}

impl TransactionKey {
    pub fn new(branch: impl Into<String>, method: impl AsRef<str>, is_server: bool) -> Self {
        Self {
            branch: branch.into(),
            method: method.as_ref().to_ascii_uppercase(),
            is_server,
        }
    }

    pub fn is_invite(&self) -> bool {
        self.method == "INVITE"
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            self.branch,
            self.method,
            if self.is_server { "server" } else { "client" }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    InviteClient,
    NonInviteClient,
    InviteServer,
    NonInviteServer,
}

impl TransactionKind {
    pub fn for_key(key: &TransactionKey) -> Self {
        match (key.is_server, key.is_invite()) {
            (false, true) => TransactionKind::InviteClient,
            (false, false) => TransactionKind::NonInviteClient,
            (true, true) => TransactionKind::InviteServer,
            (true, false) => TransactionKind::NonInviteServer,
        }
    }

    pub fn is_server(&self) -> bool {
        matches!(self, TransactionKind::InviteServer | TransactionKind::NonInviteServer)
    }

    /// Profile slot holding this kind's retry count; non-INVITE servers never retransmit
    pub fn transaction_type(&self) -> Option<TransactionType> {
        match self {
            TransactionKind::InviteClient => Some(TransactionType::InviteClient),
            TransactionKind::NonInviteClient => Some(TransactionType::Client),
            TransactionKind::InviteServer => Some(TransactionType::InviteServer),
            TransactionKind::NonInviteServer => None,
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionKind::InviteClient => "InviteClient",
            TransactionKind::NonInviteClient => "NonInviteClient",
            TransactionKind::InviteServer => "InviteServer",
            TransactionKind::NonInviteServer => "NonInviteServer",
        })
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    New = 0,
    Started = 1,
    /// Cancelled before processing started
    Cancelled = 2,
    Terminated = 3,
}

impl TransactionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::New,
            1 => TransactionState::Started,
            2 => TransactionState::Cancelled,
            _ => TransactionState::Terminated,
        }
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// 100rel support advertised for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Rel100Support {
    #[default]
    Unsupported,
    Supported,
    Require,
}

/// Told when a transaction terminates so the owning table can drop it
pub trait RemovalListener: Send + Sync {
    fn transaction_removed(&self, key: &TransactionKey);
}

/// Capability shared by all transaction state machines
pub trait Transaction: Send + Sync {
    fn lifecycle(&self) -> &TransactionLifecycle;

    /// Called when sending on the transaction's connection fails
    fn on_io_error(&self, error: &io::Error);

    fn key(&self) -> &TransactionKey {
        self.lifecycle().key()
    }

    fn kind(&self) -> TransactionKind {
        self.lifecycle().kind()
    }

    fn is_started(&self) -> bool {
        self.lifecycle().state() == TransactionState::Started
    }

    fn terminate(&self) -> bool {
        self.lifecycle().terminate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_key() {
        let key = TransactionKey::new("z9hG4bK776asdhds", "invite", false);
        assert_eq!(key.method, "INVITE");
        assert_eq!(TransactionKind::for_key(&key), TransactionKind::InviteClient);

        let key = TransactionKey::new("z9hG4bK776asdhds", "BYE", true);
        let kind = TransactionKind::for_key(&key);
        assert_eq!(kind, TransactionKind::NonInviteServer);
        assert!(kind.is_server());
        assert_eq!(kind.transaction_type(), None);
        assert_eq!(key.to_string(), "z9hG4bK776asdhds:BYE:server");
    }

    #[test]
    fn test_state_from_u8() {
        for state in [
            TransactionState::New,
            TransactionState::Started,
            TransactionState::Cancelled,
            TransactionState::Terminated,
        ] {
            assert_eq!(TransactionState::from_u8(state as u8), state);
        }
    }
}
