//! Fatal halt latch.
//!
//! Unrecoverable conditions (position/broker desync, exhausted feed retries,
//! startup failure) are reported here as values rather than panics. The
//! latch keeps the first reason and wakes the supervisor, which liquidates
//! and terminates.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

// ============================================================================
// FatalReason
// ============================================================================

/// Reason the engine must liquidate and stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    /// Sum of position quantities no longer matches the asset quantity.
    QuantityMismatch {
        symbol: String,
        asset_qty: Decimal,
        positions_qty: Decimal,
    },
    /// An order update changed quantity for a position the engine does not hold.
    MissingPosition { client_order_id: String },
    /// A quantity field could not be parsed.
    InvalidQuantity { field: String, value: String },
    /// A feed exhausted its reconnect budget.
    RetriesExhausted { feed: String, attempts: u32 },
    /// A feed failed before its first session was established.
    StartupFailed { feed: String, reason: String },
    /// The account feed rejected our credentials at startup.
    Unauthorized { feed: String },
}

impl std::fmt::Display for FatalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::QuantityMismatch {
                symbol,
                asset_qty,
                positions_qty,
            } => write!(
                f,
                "Quantity mismatch on {symbol}: asset={asset_qty} positions={positions_qty}"
            ),
            Self::MissingPosition { client_order_id } => {
                write!(f, "No position for order {client_order_id}")
            }
            Self::InvalidQuantity { field, value } => {
                write!(f, "Invalid quantity in {field}: {value:?}")
            }
            Self::RetriesExhausted { feed, attempts } => {
                write!(f, "{feed} reconnect retries exhausted after {attempts} attempts")
            }
            Self::StartupFailed { feed, reason } => {
                write!(f, "{feed} failed at startup: {reason}")
            }
            Self::Unauthorized { feed } => write!(f, "{feed} authorization rejected"),
        }
    }
}

// ============================================================================
// HaltLatch
// ============================================================================

/// Latch that records the first fatal reason and wakes waiters.
///
/// Thread-safe: share via `Arc<HaltLatch>`.
pub struct HaltLatch {
    triggered: AtomicBool,
    /// Unix milliseconds, 0 if not triggered.
    triggered_at: AtomicI64,
    reason: RwLock<Option<FatalReason>>,
    tripped: CancellationToken,
}

impl Default for HaltLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl HaltLatch {
    #[must_use]
    pub fn new() -> Self {
        Self {
            triggered: AtomicBool::new(false),
            triggered_at: AtomicI64::new(0),
            reason: RwLock::new(None),
            tripped: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Trigger the latch. Later triggers are logged and ignored.
    ///
    /// Returns true if this call tripped the latch.
    pub fn trigger(&self, reason: FatalReason) -> bool {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            self.triggered_at
                .store(Utc::now().timestamp_millis(), Ordering::SeqCst);
            *self.reason.write() = Some(reason.clone());

            error!(reason = %reason, "FATAL HALT TRIGGERED");
            self.tripped.cancel();
            true
        } else {
            warn!(new_reason = %reason, "Halt already triggered, ignoring new reason");
            false
        }
    }

    /// Unix milliseconds of the trigger, `None` if not triggered.
    #[must_use]
    pub fn triggered_at(&self) -> Option<i64> {
        if self.is_triggered() {
            let ts = self.triggered_at.load(Ordering::SeqCst);
            if ts > 0 {
                return Some(ts);
            }
        }
        None
    }

    /// First reason the latch was triggered with.
    #[must_use]
    pub fn reason(&self) -> Option<FatalReason> {
        if self.is_triggered() {
            self.reason.read().clone()
        } else {
            None
        }
    }

    /// Resolves once the latch has been triggered.
    pub async fn tripped(&self) {
        self.tripped.cancelled().await;
    }
}
