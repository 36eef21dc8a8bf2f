//! Capped exponential backoff shared by feed reconnects, broker queries and
//! the persistence consumer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff parameters: `base * 2^(attempt-1)`, capped at `max`, plus jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 1000,
            max_ms: 60_000,
        }
    }
}

impl Backoff {
    #[must_use]
    pub fn new(base_ms: u64, max_ms: u64) -> Self {
        Self { base_ms, max_ms }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    ///
    /// attempt=1 -> base, attempt=2 -> 2*base, attempt=3 -> 4*base.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.base_ms.saturating_mul(1u64 << exponent).min(self.max_ms);
        Duration::from_millis(delay)
    }

    /// Delay before retry number `attempt` with up to `min(base, 1s)` of jitter.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter_cap = self.base_ms.min(1000);
        let jitter = if jitter_cap == 0 {
            0
        } else {
            clock_jitter() % jitter_cap
        };
        self.base_delay(attempt) + Duration::from_millis(jitter)
    }
}

/// Cheap jitter source from the clock's sub-second nanos.
fn clock_jitter() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::from(d.subsec_nanos()))
        .unwrap_or(0)
}
