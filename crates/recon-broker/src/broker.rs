//! Broker trait for order submission and account queries.
//!
//! Trait-based so the engine can be driven by the REST client in production
//! and by [`crate::MockBroker`] in tests.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{AssetClass, OrderSide};
use rust_decimal::Decimal;

use crate::error::BrokerResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// A terminal order from the broker's order history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedOrder {
    pub client_order_id: String,
    pub symbol: String,
    pub side: Option<OrderSide>,
    pub filled_qty: Decimal,
    pub filled_avg_price: Option<Decimal>,
    pub filled_at: Option<DateTime<Utc>>,
}

/// Broker operations the engine depends on.
///
/// Order submission is single-shot; queries may retry internally before
/// surfacing an error.
pub trait Broker: Send + Sync {
    /// Submit an immediate-or-cancel buy sized from `reference_price`.
    fn open_long_ioc<'a>(
        &'a self,
        symbol: &'a str,
        asset_class: AssetClass,
        order_id: &'a str,
        reference_price: Decimal,
    ) -> BoxFuture<'a, BrokerResult<()>>;

    /// Submit an immediate-or-cancel order for `qty` (unsigned) on `side`.
    fn close_ioc<'a>(
        &'a self,
        side: OrderSide,
        symbol: &'a str,
        order_id: &'a str,
        qty: Decimal,
    ) -> BoxFuture<'a, BrokerResult<()>>;

    /// Signed quantity held per symbol. Symbols with no holding are absent.
    fn asset_quantities(&self) -> BoxFuture<'_, BrokerResult<HashMap<String, Decimal>>>;

    /// Terminal orders for `symbols`, newest first.
    fn closed_orders<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, BrokerResult<Vec<ClosedOrder>>>;

    /// Close every position at market and cancel open orders.
    fn liquidate_all(&self) -> BoxFuture<'_, BrokerResult<()>>;
}

/// Arc wrapper for Broker trait objects.
pub type DynBroker = Arc<dyn Broker>;
