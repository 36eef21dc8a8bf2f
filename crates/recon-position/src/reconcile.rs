//! Post-outage repair of pending positions.
//!
//! Run once per account-feed reconnect. For every symbol with a pending
//! order, the broker's quantity is compared with the cached one and the
//! difference apportioned to the pending legs:
//!
//! - zero: nothing filled while we were away; pending positions are dropped
//! - positive: split across pending opens, remainder to the first
//! - negative: split across pending closes when only closes are pending and
//!   every share fits the position; otherwise left unresolved
//!
//! Repaired positions are marked bad for analysis. The whole pass runs under
//! the engine state lock held for writing.

use std::collections::HashMap;

use recon_core::{OrderType, Position, PositionId};
use recon_telemetry::Metrics;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::book::AssetBook;
use crate::error::PositionResult;

/// Per-symbol difference between broker and local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationDiff {
    pub symbol: String,
    pub broker_qty: Decimal,
    pub local_qty: Decimal,
    /// `broker_qty - local_qty`.
    pub diff: Decimal,
    /// Positions with an order still pending.
    pub pending: Vec<PositionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    InSync,
    Opened,
    Closed,
    Unresolved,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::Opened => "opened",
            Self::Closed => "closed",
            Self::Unresolved => "unresolved",
        }
    }
}

/// What reconciliation did to one symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolReport {
    pub diff: ReconciliationDiff,
    pub outcome: ReconcileOutcome,
    /// Snapshots of every repaired position, taken after repair.
    pub repaired: Vec<Position>,
    /// Strategies whose position was removed.
    pub removed: Vec<String>,
    /// Strategies whose close must be sent again.
    pub reissue: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub symbols: Vec<SymbolReport>,
}

impl ReconcileReport {
    pub fn symbol(&self, symbol: &str) -> Option<&SymbolReport> {
        self.symbols.iter().find(|r| r.diff.symbol == symbol)
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

impl AssetBook {
    /// Reconcile every asset with a pending position against the broker.
    ///
    /// A broker quantity query failure aborts the pass. Closed-order history
    /// only enriches fill details, so its failure is logged and ignored.
    pub async fn reconcile(&self) -> PositionResult<ReconcileReport> {
        let ctx = self.context().clone();
        let mut report = ReconcileReport::default();
        {
            let _state = ctx.write_state().await;

            let pending: Vec<_> = self
                .assets()
                .into_iter()
                .filter(|asset| asset.has_pending())
                .collect();
            if pending.is_empty() {
                info!("Reconciliation: no pending positions");
                return Ok(report);
            }

            let symbols: Vec<String> = pending.iter().map(|a| a.symbol().to_string()).collect();
            let quantities = ctx.broker.asset_quantities().await?;
            let history: HashMap<_, _> = match ctx.broker.closed_orders(&symbols).await {
                Ok(orders) => {
                    let mut index = HashMap::with_capacity(orders.len());
                    for order in orders {
                        index.entry(order.client_order_id.clone()).or_insert(order);
                    }
                    index
                }
                Err(e) => {
                    warn!(error = %e, "Closed-order history unavailable, fill details not enriched");
                    HashMap::new()
                }
            };

            for asset in pending {
                let broker_qty = quantities
                    .get(asset.symbol())
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                let symbol_report = asset.reconcile(broker_qty, &history)?;
                Metrics::reconcile_outcome(symbol_report.outcome.as_str());
                report.symbols.push(symbol_report);
            }
        }

        for symbol_report in &report.symbols {
            let Some(asset) = self.get(&symbol_report.diff.symbol) else {
                continue;
            };
            for strategy in &symbol_report.reissue {
                if let Err(e) = asset.close(strategy, OrderType::Ioc).await {
                    warn!(
                        symbol = %symbol_report.diff.symbol,
                        strategy,
                        error = %e,
                        "Close re-issue after reconciliation failed"
                    );
                }
            }
        }
        Ok(report)
    }
}
