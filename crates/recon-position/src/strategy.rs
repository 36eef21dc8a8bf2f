//! Pluggable decision logic.

use recon_core::{AssetClass, OrderSide, OrderType, Position};
use rust_decimal::Decimal;

use crate::window::RollingWindow;

/// Read-only snapshot of one asset handed to strategies.
#[derive(Debug, Clone, Copy)]
pub struct AssetView<'a> {
    pub symbol: &'a str,
    pub asset_class: AssetClass,
    pub window: &'a RollingWindow,
    /// Broker-confirmed quantity.
    pub qty: Decimal,
    pub positions: &'a [Position],
}

impl AssetView<'_> {
    /// Position held by `strategy`, if any.
    #[must_use]
    pub fn position(&self, strategy: &str) -> Option<&Position> {
        self.positions.iter().find(|p| p.strategy == strategy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Open { side: OrderSide },
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub action: Action,
    pub order_type: OrderType,
}

impl Decision {
    #[must_use]
    pub fn open_long() -> Self {
        Self {
            action: Action::Open {
                side: OrderSide::Buy,
            },
            order_type: OrderType::Ioc,
        }
    }

    #[must_use]
    pub fn close() -> Self {
        Self {
            action: Action::Close,
            order_type: OrderType::Ioc,
        }
    }
}

/// Strategy evaluated on every market update of its asset.
///
/// `evaluate` runs with the asset's window locked for reading and must not
/// block.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate(&self, view: &AssetView<'_>) -> Option<Decision>;
}
