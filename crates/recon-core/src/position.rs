//! Position snapshot data.
//!
//! A `Position` is one strategy's outstanding stake in one symbol. The
//! state machine that drives it lives in `recon-position`; this module only
//! holds the data and the guarded flag transitions, so that persistence and
//! the broker layer can share the type.

use crate::order::{AssetClass, OrderSide, OrderType, PositionId, PositionKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Market context captured when a strategy decided to trade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub side: OrderSide,
    pub order_type: OrderType,
    pub trigger_time: DateTime<Utc>,
    pub trigger_price: Decimal,
    /// Bar time of the window the decision was made on.
    pub bar_time: DateTime<Utc>,
    /// Receive time of the price the decision was made on.
    pub price_received_at: DateTime<Utc>,
}

/// One side (open or close) of a position's lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLeg {
    pub pending: bool,
    pub order_id: Option<String>,
    pub trigger: Option<TriggerContext>,
    /// Cumulative quantity already applied from the current order.
    pub filled_qty: Decimal,
    pub filled_at: Option<DateTime<Utc>>,
    pub fill_price: Option<Decimal>,
}

impl OrderLeg {
    fn arm(&mut self, order_id: String, trigger: TriggerContext) {
        self.pending = true;
        self.order_id = Some(order_id);
        self.trigger = Some(trigger);
        self.filled_qty = Decimal::ZERO;
    }

    /// Record observed fill details, keeping earlier values when absent.
    pub fn record_fill(&mut self, at: Option<DateTime<Utc>>, price: Option<Decimal>) {
        if at.is_some() {
            self.filled_at = at;
        }
        if price.is_some() {
            self.fill_price = price;
        }
    }
}

/// Lifecycle state of a live position. `Idle` and `Closed` are represented
/// by absence from the owning asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionState {
    OpenPending,
    Open,
    ClosePending,
}

impl fmt::Display for PositionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenPending => write!(f, "open_pending"),
            Self::Open => write!(f, "open"),
            Self::ClosePending => write!(f, "close_pending"),
        }
    }
}

/// Rejected flag transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingConflict(pub PositionState);

/// A position owned by one asset for one strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub symbol: String,
    pub strategy: String,
    pub asset_class: AssetClass,
    /// Signed quantity.
    pub qty: Decimal,
    /// Quantity or price was estimated by reconciliation, not observed.
    pub bad_for_analysis: bool,
    pub open: OrderLeg,
    pub close: OrderLeg,
    pub close_attempts: u32,
}

impl Position {
    /// Create a position whose open order is about to be sent.
    #[must_use]
    pub fn pending_open(
        id: PositionId,
        symbol: impl Into<String>,
        strategy: impl Into<String>,
        asset_class: AssetClass,
        trigger: TriggerContext,
    ) -> Self {
        let mut open = OrderLeg::default();
        open.arm(id.as_str().to_string(), trigger);
        Self {
            id,
            symbol: symbol.into(),
            strategy: strategy.into(),
            asset_class,
            qty: Decimal::ZERO,
            bad_for_analysis: false,
            open,
            close: OrderLeg::default(),
            close_attempts: 0,
        }
    }

    #[must_use]
    pub fn key(&self) -> PositionKey {
        PositionKey::new(self.asset_class, self.symbol.clone(), self.strategy.clone())
    }

    #[must_use]
    pub fn state(&self) -> PositionState {
        if self.open.pending {
            PositionState::OpenPending
        } else if self.close.pending {
            PositionState::ClosePending
        } else {
            PositionState::Open
        }
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.open.pending || self.close.pending
    }

    /// Arm the close leg. Fails if either leg is already pending.
    ///
    /// Returns the client order id for the new close order.
    pub fn begin_close(&mut self, trigger: TriggerContext) -> Result<String, PendingConflict> {
        if self.is_pending() {
            return Err(PendingConflict(self.state()));
        }
        self.close_attempts += 1;
        let order_id = self.id.close_order_id(self.close_attempts);
        self.close.arm(order_id.clone(), trigger);
        Ok(order_id)
    }

    /// Disarm the close leg after the order could not be sent.
    pub fn abort_close(&mut self) {
        self.close.pending = false;
    }

    /// Resolve the open leg.
    pub fn settle_open(&mut self) {
        self.open.pending = false;
    }

    /// Resolve the close leg.
    pub fn settle_close(&mut self) {
        self.close.pending = false;
    }

    /// Side that flattens the current quantity.
    #[must_use]
    pub fn closing_side(&self) -> OrderSide {
        OrderSide::closing(self.qty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn trigger(side: OrderSide) -> TriggerContext {
        let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        TriggerContext {
            side,
            order_type: OrderType::Ioc,
            trigger_time: t,
            trigger_price: dec!(100),
            bar_time: t,
            price_received_at: t,
        }
    }

    fn position() -> Position {
        let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let id = PositionId::new("AAPL", "s1", t).unwrap();
        Position::pending_open(id, "AAPL", "s1", AssetClass::UsEquity, trigger(OrderSide::Buy))
    }

    #[test]
    fn test_pending_open_state() {
        let p = position();
        assert_eq!(p.state(), PositionState::OpenPending);
        assert_eq!(p.open.order_id.as_deref(), Some(p.id.as_str()));
        assert!(p.qty.is_zero());
    }

    #[test]
    fn test_begin_close_rejected_while_open_pending() {
        let mut p = position();
        assert_eq!(
            p.begin_close(trigger(OrderSide::Sell)),
            Err(PendingConflict(PositionState::OpenPending))
        );
        assert!(!p.close.pending);
        assert_eq!(p.close_attempts, 0);
    }

    #[test]
    fn test_close_cycle() {
        let mut p = position();
        p.qty = dec!(5);
        p.settle_open();
        assert_eq!(p.state(), PositionState::Open);

        let id = p.begin_close(trigger(OrderSide::Sell)).unwrap();
        assert_eq!(id, p.id.close_order_id(1));
        assert_eq!(p.state(), PositionState::ClosePending);
        assert!(p.begin_close(trigger(OrderSide::Sell)).is_err());

        p.abort_close();
        let id = p.begin_close(trigger(OrderSide::Sell)).unwrap();
        assert_eq!(id, p.id.close_order_id(2));
        assert!(!(p.open.pending && p.close.pending));
    }

    #[test]
    fn test_record_fill_keeps_known_values() {
        let mut leg = OrderLeg::default();
        leg.record_fill(None, Some(dec!(10)));
        leg.record_fill(None, None);
        assert_eq!(leg.fill_price, Some(dec!(10)));
        assert!(leg.filled_at.is_none());
    }
}
