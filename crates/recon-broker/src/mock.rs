//! In-memory broker for tests.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use recon_core::{AssetClass, OrderSide};
use rust_decimal::Decimal;

use crate::broker::{BoxFuture, Broker, ClosedOrder};
use crate::error::{BrokerError, BrokerResult};

/// A call recorded by [`MockBroker`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Open {
        symbol: String,
        asset_class: AssetClass,
        order_id: String,
        reference_price: Decimal,
    },
    Close {
        side: OrderSide,
        symbol: String,
        order_id: String,
        qty: Decimal,
    },
    AssetQuantities,
    ClosedOrders { symbols: Vec<String> },
    LiquidateAll,
}

/// Mock broker recording every call.
///
/// Failures are queued per operation and consumed one per call; with an
/// empty queue the call succeeds.
#[derive(Default)]
pub struct MockBroker {
    calls: Mutex<Vec<BrokerCall>>,
    quantities: Mutex<HashMap<String, Decimal>>,
    closed_orders: Mutex<Vec<ClosedOrder>>,
    open_failures: Mutex<VecDeque<String>>,
    close_failures: Mutex<VecDeque<String>>,
    query_failures: Mutex<VecDeque<String>>,
    liquidate_failures: Mutex<VecDeque<String>>,
}

fn next_failure(queue: &Mutex<VecDeque<String>>) -> BrokerResult<()> {
    match queue.lock().pop_front() {
        Some(msg) => Err(BrokerError::HttpClient(msg)),
        None => Ok(()),
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the quantity reported for `symbol`. Zero removes it.
    pub fn set_quantity(&self, symbol: &str, qty: Decimal) {
        let mut quantities = self.quantities.lock();
        if qty.is_zero() {
            quantities.remove(symbol);
        } else {
            quantities.insert(symbol.to_string(), qty);
        }
    }

    pub fn set_closed_orders(&self, orders: Vec<ClosedOrder>) {
        *self.closed_orders.lock() = orders;
    }

    pub fn fail_next_open(&self, msg: &str) {
        self.open_failures.lock().push_back(msg.to_string());
    }

    pub fn fail_next_close(&self, msg: &str) {
        self.close_failures.lock().push_back(msg.to_string());
    }

    pub fn fail_next_query(&self, msg: &str) {
        self.query_failures.lock().push_back(msg.to_string());
    }

    pub fn fail_next_liquidate(&self, msg: &str) {
        self.liquidate_failures.lock().push_back(msg.to_string());
    }

    /// Get recorded calls.
    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls.lock().clone()
    }

    /// Recorded close calls only.
    pub fn close_calls(&self) -> Vec<BrokerCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BrokerCall::Close { .. }))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().push(call);
    }
}

impl Broker for MockBroker {
    fn open_long_ioc<'a>(
        &'a self,
        symbol: &'a str,
        asset_class: AssetClass,
        order_id: &'a str,
        reference_price: Decimal,
    ) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            self.record(BrokerCall::Open {
                symbol: symbol.to_string(),
                asset_class,
                order_id: order_id.to_string(),
                reference_price,
            });
            next_failure(&self.open_failures)
        })
    }

    fn close_ioc<'a>(
        &'a self,
        side: OrderSide,
        symbol: &'a str,
        order_id: &'a str,
        qty: Decimal,
    ) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            self.record(BrokerCall::Close {
                side,
                symbol: symbol.to_string(),
                order_id: order_id.to_string(),
                qty,
            });
            next_failure(&self.close_failures)
        })
    }

    fn asset_quantities(&self) -> BoxFuture<'_, BrokerResult<HashMap<String, Decimal>>> {
        Box::pin(async move {
            self.record(BrokerCall::AssetQuantities);
            next_failure(&self.query_failures)?;
            Ok(self.quantities.lock().clone())
        })
    }

    fn closed_orders<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, BrokerResult<Vec<ClosedOrder>>> {
        Box::pin(async move {
            self.record(BrokerCall::ClosedOrders {
                symbols: symbols.to_vec(),
            });
            next_failure(&self.query_failures)?;
            Ok(self
                .closed_orders
                .lock()
                .iter()
                .filter(|o| symbols.contains(&o.symbol))
                .cloned()
                .collect())
        })
    }

    fn liquidate_all(&self) -> BoxFuture<'_, BrokerResult<()>> {
        Box::pin(async move {
            self.record(BrokerCall::LiquidateAll);
            next_failure(&self.liquidate_failures)?;
            self.quantities.lock().clear();
            Ok(())
        })
    }
}
