//! Market data and order-update event types.

use crate::order::{AssetClass, OrderSide};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One completed one-minute OHLC bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: String,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Start of the bar's minute.
    pub bar_time: DateTime<Utc>,
    /// When the engine received it.
    pub received_at: DateTime<Utc>,
}

/// One executed trade, provisionally updating the open bar's close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    pub symbol: String,
    pub price: Decimal,
    pub trade_time: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
}

/// A market data event routed to one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketEvent {
    Bar(Bar),
    Trade(TradeTick),
}

impl MarketEvent {
    pub fn symbol(&self) -> &str {
        match self {
            Self::Bar(b) => &b.symbol,
            Self::Trade(t) => &t.symbol,
        }
    }
}

/// Order-update event kinds the engine acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderEvent {
    Fill,
    PartialFill,
    Canceled,
}

impl OrderEvent {
    /// Parse an event name; other broker event kinds yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fill" => Some(Self::Fill),
            "partial_fill" => Some(Self::PartialFill),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Fill and cancel end the order; a partial fill leaves it working.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Fill | Self::Canceled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fill => "fill",
            Self::PartialFill => "partial_fill",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for OrderEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed account-feed order update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub event: OrderEvent,
    pub asset_class: AssetClass,
    pub strategy: String,
    pub client_order_id: String,
    pub side: Option<OrderSide>,
    pub symbol: Option<String>,
    /// Cumulative filled quantity of the order.
    pub filled_qty: Option<Decimal>,
    /// Broker's signed asset quantity after this event.
    pub position_qty: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
    pub filled_avg_price: Option<Decimal>,
}

/// Persistence action tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersistAction {
    Open,
    Close,
    DeleteAllPositions,
}

impl fmt::Display for PersistAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Close => write!(f, "close"),
            Self::DeleteAllPositions => write!(f, "delete_all_positions"),
        }
    }
}
