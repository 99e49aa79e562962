//! Retransmission timer identifiers and the per-network timer profile.
//!
//! Timer values are milliseconds. The identifiers keep their historical
//! numeric ids so configuration that addresses timers by number keeps working:
//!
//! | id | timer | default |
//! |----|-------|---------|
//! | 0 | T1 | 500 |
//! | 1 | T2 | 4000 |
//! | 2 | T3 | 16000 (unused by retransmission) |
//! | 3 | T4 | 5000 |
//! | 4 | TU1 | 5000 |
//! | 5 | TU2 | 32000 |
//! | 6 | TU3 | `u32::MAX` |
//! | 7 | client Tn | 64000 |
//! | 8 | server Tn | 64000 |
//! | 9 | Tn (deprecated) | both lifetimes |

mod profile;

pub use profile::TimerProfile;

use std::fmt;

use serde::{Deserialize, Serialize};

/// A timer in the profile
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimerId {
    /// RTT estimate, base retransmission interval
    T1 = 0,
    /// Retransmission interval cap
    T2 = 1,
    /// Kept for compatibility; nothing reads it
    T3 = 2,
    /// Maximum time a message stays in the network
    T4 = 3,
    TU1 = 4,
    TU2 = 5,
    /// Delay before a non-INVITE server sends a provisional response
    TU3 = 6,
    /// Maximum client transaction lifetime
    ClientTn = 7,
    /// Maximum server transaction lifetime
    ServerTn = 8,
    /// Deprecated alias: sets both lifetimes, reads the server one
    Tn = 9,
}

impl TimerId {
    pub const ALL: [TimerId; 10] = [
        TimerId::T1,
        TimerId::T2,
        TimerId::T3,
        TimerId::T4,
        TimerId::TU1,
        TimerId::TU2,
        TimerId::TU3,
        TimerId::ClientTn,
        TimerId::ServerTn,
        TimerId::Tn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerId::T1 => "T1",
            TimerId::T2 => "T2",
            TimerId::T3 => "T3",
            TimerId::T4 => "T4",
            TimerId::TU1 => "TU1",
            TimerId::TU2 => "TU2",
            TimerId::TU3 => "TU3",
            TimerId::ClientTn => "clientTn",
            TimerId::ServerTn => "serverTn",
            TimerId::Tn => "Tn",
        }
    }
}

impl TryFrom<u8> for TimerId {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        TimerId::ALL.get(value as usize).copied().ok_or(value)
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction types that carry a retry count
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    InviteClient = 0,
    /// Non-INVITE client
    Client = 1,
    InviteServer = 2,
}

impl TransactionType {
    pub const ALL: [TransactionType; 3] = [
        TransactionType::InviteClient,
        TransactionType::Client,
        TransactionType::InviteServer,
    ];
}

impl TryFrom<u8> for TransactionType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, u8> {
        TransactionType::ALL.get(value as usize).copied().ok_or(value)
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransactionType::InviteClient => "inviteClient",
            TransactionType::Client => "client",
            TransactionType::InviteServer => "inviteServer",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_ids_round_trip_through_numbers() {
        for id in TimerId::ALL {
            assert_eq!(TimerId::try_from(id as u8), Ok(id));
        }
        assert_eq!(TimerId::try_from(10), Err(10));
        assert_eq!(TimerId::try_from(99), Err(99));
        assert_eq!(TransactionType::try_from(1), Ok(TransactionType::Client));
        assert!(TransactionType::try_from(3).is_err());
    }

    #[test]
    fn test_names() {
        assert_eq!(TimerId::ClientTn.to_string(), "clientTn");
        assert_eq!(TransactionType::InviteServer.to_string(), "inviteServer");
        assert_eq!(serde_json::to_string(&TimerId::TU3).unwrap(), "\"TU3\"");
    }
}
