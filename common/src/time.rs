//! Wall-clock helpers. Pure logic takes milliseconds since the epoch as a
//! parameter; only the async glue reads the clock.

use chrono::Utc;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
