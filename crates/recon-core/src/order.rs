//! Order-related types and identifiers.
//!
//! Provides order side, order type, asset class, and the position /
//! client-order-id scheme that joins local state to broker order updates.

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Order side: buy or sell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side.
    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    /// Returns 1 for buy, -1 for sell as a decimal multiplier.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => Decimal::NEGATIVE_ONE,
        }
    }

    /// Side of the order that flattens a position of the given signed quantity.
    pub fn closing(qty: Decimal) -> Self {
        if qty.is_sign_negative() {
            Self::Buy
        } else {
            Self::Sell
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

impl FromStr for OrderSide {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(CoreError::InvalidIdentifier(format!("order side {other:?}"))),
        }
    }
}

/// Order type requested by a strategy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    /// Market order.
    Market,
    /// Limit order.
    Limit,
    /// Immediate-or-cancel; the only type the broker contract submits today.
    #[default]
    Ioc,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
            Self::Ioc => write!(f, "ioc"),
        }
    }
}

/// Asset class, which fixes the quantity precision the broker accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    UsEquity,
    Crypto,
}

impl AssetClass {
    /// Decimal places allowed in an order quantity.
    pub fn qty_precision(&self) -> u32 {
        match self {
            Self::UsEquity => 0,
            Self::Crypto => 9,
        }
    }
}

impl fmt::Display for AssetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UsEquity => write!(f, "us_equity"),
            Self::Crypto => write!(f, "crypto"),
        }
    }
}

impl FromStr for AssetClass {
    type Err = CoreError;

    fn from_str(s: &str) -> CoreResult<Self> {
        match s {
            "us_equity" => Ok(Self::UsEquity),
            "crypto" => Ok(Self::Crypto),
            other => Err(CoreError::UnknownAssetClass(other.to_string())),
        }
    }
}

const SEPARATOR: char = ':';
const CLOSE_TAG: &str = "c";

/// Unique position identifier, `{symbol}:{strategy}:{opened_at_ms}`.
///
/// Doubles as the client order id of the opening order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PositionId(String);

impl PositionId {
    /// Build a position id. Neither `symbol` nor `strategy` may contain `:`.
    pub fn new(symbol: &str, strategy: &str, opened_at: DateTime<Utc>) -> CoreResult<Self> {
        if symbol.is_empty() || symbol.contains(SEPARATOR) {
            return Err(CoreError::InvalidIdentifier(format!("symbol {symbol:?}")));
        }
        if strategy.is_empty() || strategy.contains(SEPARATOR) {
            return Err(CoreError::InvalidIdentifier(format!("strategy {strategy:?}")));
        }
        Ok(Self(format!(
            "{symbol}{SEPARATOR}{strategy}{SEPARATOR}{}",
            opened_at.timestamp_millis()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Client order id for the `attempt`-th close order of this position.
    pub fn close_order_id(&self, attempt: u32) -> String {
        format!("{}{SEPARATOR}{CLOSE_TAG}{attempt}", self.0)
    }

    /// True if `client_order_id` is this position's open order or one of its closes.
    pub fn owns_order(&self, client_order_id: &str) -> bool {
        match client_order_id.strip_prefix(self.0.as_str()) {
            Some("") => true,
            Some(rest) => rest
                .strip_prefix(SEPARATOR)
                .and_then(|r| r.strip_prefix(CLOSE_TAG))
                .is_some_and(|n| !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit())),
            None => false,
        }
    }
}

impl fmt::Display for PositionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for PositionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Which leg of a position a client order id belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderLegKind {
    Open,
    Close { attempt: u32 },
}

/// A client order id taken apart into its components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOrderId {
    pub position_id: PositionId,
    pub symbol: String,
    pub strategy: String,
    pub opened_at_ms: i64,
    pub leg: OrderLegKind,
}

impl ParsedOrderId {
    /// Parse a client order id; `None` if it was not issued by this engine.
    pub fn parse(client_order_id: &str) -> Option<Self> {
        let parts: Vec<&str> = client_order_id.split(SEPARATOR).collect();
        let (symbol, strategy, opened, leg) = match parts.as_slice() {
            [symbol, strategy, opened] => (*symbol, *strategy, *opened, OrderLegKind::Open),
            [symbol, strategy, opened, tag] => {
                let attempt = tag.strip_prefix(CLOSE_TAG)?.parse::<u32>().ok()?;
                (*symbol, *strategy, *opened, OrderLegKind::Close { attempt })
            }
            _ => return None,
        };
        if symbol.is_empty() || strategy.is_empty() {
            return None;
        }
        let opened_at_ms = opened.parse::<i64>().ok()?;
        Some(Self {
            position_id: PositionId(format!("{symbol}{SEPARATOR}{strategy}{SEPARATOR}{opened}")),
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
            opened_at_ms,
            leg,
        })
    }
}

/// Lookup key for one position: asset class, symbol and strategy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub asset_class: AssetClass,
    pub symbol: String,
    pub strategy: String,
}

impl PositionKey {
    pub fn new(asset_class: AssetClass, symbol: impl Into<String>, strategy: impl Into<String>) -> Self {
        Self {
            asset_class,
            symbol: symbol.into(),
            strategy: strategy.into(),
        }
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.asset_class, self.symbol, self.strategy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn opened() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_123).unwrap()
    }

    #[test]
    fn test_order_side_opposite() {
        assert_eq!(OrderSide::Buy.opposite(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite(), OrderSide::Buy);
    }

    #[test]
    fn test_order_side_closing() {
        assert_eq!(OrderSide::closing(dec!(2)), OrderSide::Sell);
        assert_eq!(OrderSide::closing(dec!(-2)), OrderSide::Buy);
    }

    #[test]
    fn test_asset_class_precision() {
        assert_eq!(AssetClass::UsEquity.qty_precision(), 0);
        assert_eq!(AssetClass::Crypto.qty_precision(), 9);
        assert_eq!("crypto".parse::<AssetClass>().unwrap(), AssetClass::Crypto);
        assert!("forex".parse::<AssetClass>().is_err());
    }

    #[test]
    fn test_position_id_format() {
        let id = PositionId::new("BTC/USD", "s1", opened()).unwrap();
        assert_eq!(id.as_str(), "BTC/USD:s1:1700000000123");
        assert_eq!(id.close_order_id(2), "BTC/USD:s1:1700000000123:c2");
    }

    #[test]
    fn test_position_id_rejects_separator() {
        assert!(PositionId::new("AAPL", "bad:name", opened()).is_err());
        assert!(PositionId::new("", "s1", opened()).is_err());
    }

    #[test]
    fn test_parse_open_and_close_ids() {
        let id = PositionId::new("AAPL", "momentum", opened()).unwrap();

        let open = ParsedOrderId::parse(id.as_str()).unwrap();
        assert_eq!(open.strategy, "momentum");
        assert_eq!(open.symbol, "AAPL");
        assert_eq!(open.leg, OrderLegKind::Open);
        assert_eq!(open.position_id, id);

        let close = ParsedOrderId::parse(&id.close_order_id(3)).unwrap();
        assert_eq!(close.leg, OrderLegKind::Close { attempt: 3 });
        assert_eq!(close.position_id, id);
        assert_eq!(close.opened_at_ms, 1_700_000_000_123);
    }

    #[test]
    fn test_parse_rejects_foreign_ids() {
        assert!(ParsedOrderId::parse("a1b2c3d4-manual-order").is_none());
        assert!(ParsedOrderId::parse("AAPL:s1:notatime").is_none());
        assert!(ParsedOrderId::parse("AAPL:s1:1:x1").is_none());
        assert!(ParsedOrderId::parse(":s1:1").is_none());
    }

    #[test]
    fn test_owns_order() {
        let id = PositionId::new("AAPL", "s1", opened()).unwrap();
        assert!(id.owns_order(id.as_str()));
        assert!(id.owns_order(&id.close_order_id(1)));
        assert!(!id.owns_order("AAPL:s1:17000000001234"));
        assert!(!id.owns_order("AAPL:s2:1700000000123"));
    }
}
