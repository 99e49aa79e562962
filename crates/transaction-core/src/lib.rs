//! # sipconn-transaction-core
//!
//! Retransmission timers and the lifecycle shared by SIP transactions.
//!
//! - [`TimerProfile`] holds the RFC 3261 timer values (T1, T2, T4, ...) and
//!   retry counts of one logical network. Values can change at runtime and
//!   take effect for the next transaction that reads them.
//! - [`TransactionLifecycle`] is the state every concrete transaction carries:
//!   the New/Started/Cancelled/Terminated flags with lock-free transitions,
//!   the removal callback, RSeq numbering for reliable provisional responses
//!   and the connection lease that keeps the transport connection alive.
//!
//! ```
//! use std::sync::Arc;
//! use sipconn_transaction_core::{TimerId, TimerProfile, TransactionKey, TransactionLifecycle};
//!
//! let profile = Arc::new(TimerProfile::new("internal"));
//! profile.set(TimerId::T1, 250);
//!
//! let tx = TransactionLifecycle::new(TransactionKey::new("z9hG4bK74bf9", "INVITE", true), profile);
//! assert!(tx.is_new());
//! assert!(tx.try_mark_cancelled());
//! assert!(tx.terminate());
//! ```

pub mod error;
pub mod timer;
pub mod transaction;

pub use error::{Error, Result};
pub use timer::{TimerId, TimerProfile, TransactionType};
pub use transaction::{
    Rel100Support, RemovalListener, Transaction, TransactionKey, TransactionKind, TransactionLifecycle,
    TransactionState, MAX_RSEQ, MIN_RSEQ,
};
