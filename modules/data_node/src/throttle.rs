//! Bandwidth cap for verifier reads.
//!
//! Every read is charged `bytes / rate` of wall time against a virtual clock.
//! The clock may trail real time by at most [`BURST`], which is the credit a
//! verifier has after sitting idle.

use std::time::{Duration, Instant};

const BURST: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ReadBudget {
    bytes_per_sec: u64,

    /// Reads charged so far are paid for up to this instant
    paid_until: Instant,
}

impl ReadBudget {
    pub fn new(bytes_per_sec: u64, now: Instant) -> Self {
        Self {
            bytes_per_sec,
            paid_until: now.checked_sub(BURST).unwrap_or(now),
        }
    }

    fn cost(&self, bytes: u64) -> Duration {
        let millis = (u128::from(bytes) * 1000).div_ceil(u128::from(self.bytes_per_sec));
        Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
    }

    /// Charge a finished read of `bytes` and return how long to hold off
    /// before the next one
    pub fn charge(&mut self, bytes: u64, now: Instant) -> Duration {
        if self.bytes_per_sec == 0 || bytes == 0 {
            return Duration::ZERO;
        }
        let floor = now.checked_sub(BURST).unwrap_or(now);
        self.paid_until = self.paid_until.max(floor) + self.cost(bytes);
        self.paid_until.saturating_duration_since(now)
    }
}
