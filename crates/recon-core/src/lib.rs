//! Core domain types for the position reconciliation engine.
//!
//! This crate provides fundamental types used throughout the system:
//! - `Backoff`: capped exponential retry delays
//! - `split`: exact division of a quantity into shares
//! - `PositionId`, `ParsedOrderId`: the client-order-id join key
//! - `Position`, `OrderLeg`: position snapshot data
//! - `OrderUpdate`, `Bar`, `TradeTick`: feed events

pub mod backoff;
pub mod decimal;
pub mod error;
pub mod order;
pub mod position;
pub mod types;

pub use backoff::Backoff;
pub use decimal::{decimal_from_json, floor_to, parse_decimal, split};
pub use error::{CoreError, CoreResult};
pub use order::{
    AssetClass, OrderLegKind, OrderSide, OrderType, ParsedOrderId, PositionId, PositionKey,
};
pub use position::{OrderLeg, PendingConflict, Position, PositionState, TriggerContext};
pub use types::{Bar, MarketEvent, OrderEvent, OrderUpdate, PersistAction, TradeTick};
