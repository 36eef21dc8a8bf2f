//! NoNewPositions circuit breaker.
//!
//! Each unhealthy dependency owns one named slot. While any slot is set,
//! no new position may be opened. Closing existing positions is unaffected.

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{RiskError, RiskResult};

/// Slot owned by the market data feed.
pub const MARKET_LISTENER: &str = "market_listener";
/// Slot owned by the account / order-update feed.
pub const ACCOUNT_LISTENER: &str = "account_listener";
/// Slot owned by the persistence consumer.
pub const PERSISTENCE: &str = "persistence";

/// Slots registered by [`NoNewPositions::with_default_slots`].
pub const DEFAULT_SLOTS: [&str; 3] = [MARKET_LISTENER, ACCOUNT_LISTENER, PERSISTENCE];

#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, bool>,
    blocked: bool,
}

/// Process-wide gate on opening new positions.
///
/// The aggregate flag and the slot map live under one lock, and the
/// aggregate is recomputed from every slot on each clear.
#[derive(Debug, Default)]
pub struct NoNewPositions {
    inner: RwLock<Inner>,
}

impl NoNewPositions {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the market, account and persistence slots.
    #[must_use]
    pub fn with_default_slots() -> Self {
        let breaker = Self::new();
        for slot in DEFAULT_SLOTS {
            breaker.register(slot);
        }
        breaker
    }

    /// Register a slot in the clear state. Registering twice is a no-op.
    pub fn register(&self, slot: &str) {
        let mut inner = self.inner.write();
        inner.slots.entry(slot.to_string()).or_insert(false);
    }

    /// Block new positions on behalf of `slot`.
    pub fn set(&self, slot: &str) -> RiskResult<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .slots
            .get_mut(slot)
            .ok_or_else(|| RiskError::UnknownSlot(slot.to_string()))?;
        let was_set = std::mem::replace(entry, true);
        let was_blocked = std::mem::replace(&mut inner.blocked, true);
        if !was_set {
            warn!(slot, "NoNewPositions slot set");
        }
        if !was_blocked {
            warn!(slot, "New positions blocked");
        }
        Ok(())
    }

    /// Release `slot`. New positions resume only once every slot is clear.
    pub fn clear(&self, slot: &str) -> RiskResult<()> {
        let mut inner = self.inner.write();
        let entry = inner
            .slots
            .get_mut(slot)
            .ok_or_else(|| RiskError::UnknownSlot(slot.to_string()))?;
        let was_set = std::mem::replace(entry, false);
        let was_blocked = inner.blocked;
        inner.blocked = inner.slots.values().any(|b| *b);
        if was_set {
            debug!(slot, "NoNewPositions slot cleared");
        }
        if was_blocked && !inner.blocked {
            info!(slot, "New positions unblocked");
        }
        Ok(())
    }

    /// Aggregate flag: true if any slot is set.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.inner.read().blocked
    }

    /// Slots currently set, sorted.
    #[must_use]
    pub fn blocked_by(&self) -> Vec<String> {
        let inner = self.inner.read();
        let mut slots: Vec<String> = inner
            .slots
            .iter()
            .filter(|(_, blocked)| **blocked)
            .map(|(slot, _)| slot.clone())
            .collect();
        slots.sort();
        slots
    }
}
