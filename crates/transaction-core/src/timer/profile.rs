use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use super::{TimerId, TransactionType};

const DEFAULT_T1: u32 = 500;
const DEFAULT_T2: u32 = 4_000;
const DEFAULT_T3: u32 = 16_000;
const DEFAULT_T4: u32 = 5_000;
const DEFAULT_TU1: u32 = 5_000;
const DEFAULT_TU2: u32 = 32_000;
/// Effectively infinite: non-INVITE servers never send a provisional on their own
const DEFAULT_TU3: u32 = u32::MAX;
const DEFAULT_TN: u32 = 64_000;

const DEFAULT_INVITE_CLIENT_RETRIES: u8 = 5;
const DEFAULT_CLIENT_RETRIES: u8 = 9;
const DEFAULT_INVITE_SERVER_RETRIES: u8 = 9;

/// Number of stored timers; `Tn` has no slot of its own
const STORED_TIMERS: usize = 9;

/// Retransmission timer values and retry counts of one network.
///
/// Each value is its own atomic, so readers never block and a change is
/// seen by the next transaction that reads it.
///
/// # TU3
///
/// TU3 defaults to `u32::MAX`, which disables provisional responses sent by
/// a non-INVITE server transaction on its own. Setting any other value turns
/// that behavior on: the server sends a 100 after TU3 milliseconds without a
/// final response. [`non_invite_provisional_enabled`](Self::non_invite_provisional_enabled)
/// reports which mode is in effect.
#[derive(Debug)]
pub struct TimerProfile {
    network: String,
    timers: [AtomicU32; STORED_TIMERS],
    retries: [AtomicU8; 3],
}

impl TimerProfile {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            timers: [
                AtomicU32::new(DEFAULT_T1),
                AtomicU32::new(DEFAULT_T2),
                AtomicU32::new(DEFAULT_T3),
                AtomicU32::new(DEFAULT_T4),
                AtomicU32::new(DEFAULT_TU1),
                AtomicU32::new(DEFAULT_TU2),
                AtomicU32::new(DEFAULT_TU3),
                AtomicU32::new(DEFAULT_TN),
                AtomicU32::new(DEFAULT_TN),
            ],
            retries: [
                AtomicU8::new(DEFAULT_INVITE_CLIENT_RETRIES),
                AtomicU8::new(DEFAULT_CLIENT_RETRIES),
                AtomicU8::new(DEFAULT_INVITE_SERVER_RETRIES),
            ],
        }
    }

    pub fn network(&self) -> &str {
        &self.network
    }

    fn slot(&self, id: TimerId) -> &AtomicU32 {
        match id {
            TimerId::Tn => &self.timers[TimerId::ServerTn as usize],
            other => &self.timers[other as usize],
        }
    }

    /// Value of `id` in milliseconds
    pub fn get(&self, id: TimerId) -> u32 {
        self.slot(id).load(Ordering::Relaxed)
    }

    pub fn set(&self, id: TimerId, millis: u32) {
        match id {
            TimerId::Tn => {
                self.slot(TimerId::ClientTn).store(millis, Ordering::Relaxed);
                self.slot(TimerId::ServerTn).store(millis, Ordering::Relaxed);
            }
            TimerId::TU3 => {
                self.slot(id).store(millis, Ordering::Relaxed);
                info!(
                    "Network {}: TU3 set to {}ms, non-INVITE provisional responses {}",
                    self.network,
                    millis,
                    if millis == DEFAULT_TU3 { "disabled" } else { "enabled" }
                );
                return;
            }
            other => self.slot(other).store(millis, Ordering::Relaxed),
        }
        debug!("Network {}: timer {} set to {}ms", self.network, id, millis);
    }

    pub fn duration(&self, id: TimerId) -> Duration {
        Duration::from_millis(u64::from(self.get(id)))
    }

    /// Sets a timer by numeric id; an unknown id changes nothing and returns false
    pub fn set_timer_value(&self, id: u8, millis: u32) -> bool {
        match TimerId::try_from(id) {
            Ok(id) => {
                self.set(id, millis);
                true
            }
            Err(_) => false,
        }
    }

    /// Reads a timer by numeric id; `None` for an unknown id
    pub fn timer_value(&self, id: u8) -> Option<u32> {
        TimerId::try_from(id).ok().map(|id| self.get(id))
    }

    pub fn retries(&self, kind: TransactionType) -> u8 {
        self.retries[kind as usize].load(Ordering::Relaxed)
    }

    pub fn set_retries(&self, kind: TransactionType, count: u8) {
        self.retries[kind as usize].store(count, Ordering::Relaxed);
        debug!("Network {}: {} retries set to {}", self.network, kind, count);
    }

    /// Sets a retry count by numeric transaction type; unknown types return false
    pub fn set_retry_count(&self, kind: u8, count: u8) -> bool {
        match TransactionType::try_from(kind) {
            Ok(kind) => {
                self.set_retries(kind, count);
                true
            }
            Err(_) => false,
        }
    }

    pub fn retry_count(&self, kind: u8) -> Option<u8> {
        TransactionType::try_from(kind).ok().map(|kind| self.retries(kind))
    }

    /// Interval before retransmission number `attempt` (0-based): T1·2^attempt capped at T2
    pub fn retransmit_interval(&self, attempt: u32) -> Duration {
        let t1 = u64::from(self.get(TimerId::T1));
        let t2 = u64::from(self.get(TimerId::T2));
        let scaled = 1u64
            .checked_shl(attempt)
            .and_then(|factor| t1.checked_mul(factor))
            .unwrap_or(u64::MAX);
        Duration::from_millis(scaled.min(t2))
    }

    /// True once TU3 has been moved off its default
    pub fn non_invite_provisional_enabled(&self) -> bool {
        self.get(TimerId::TU3) != DEFAULT_TU3
    }
}

impl Default for TimerProfile {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Display for TimerProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "network={}", self.network)?;
        for id in TimerId::ALL.iter().filter(|id| **id != TimerId::Tn) {
            write!(f, " {}={}", id, self.get(*id))?;
        }
        for kind in TransactionType::ALL {
            write!(f, " {}Retries={}", kind, self.retries(kind))?;
        }
        Ok(())
    }
}
