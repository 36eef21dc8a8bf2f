//! Per-symbol asset: rolling window, cached broker quantity, and the
//! positions its strategies hold.
//!
//! # Locking
//!
//! - `market`: window and cached quantity
//! - `positions`: strategy -> position map
//! - `decision`: async mutex serializing open/close round trips
//!
//! Acquisition order is `market`, then `positions`, then a single position.
//! A position lock is never held while acquiring either asset lock.
//!
//! Invariant: at most one position per strategy, and after every applied
//! order update the position quantities sum to the cached quantity.

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use recon_broker::ClosedOrder;
use recon_core::{
    split, AssetClass, MarketEvent, OrderLeg, OrderLegKind, OrderSide, OrderType, OrderUpdate,
    ParsedOrderId, PendingConflict, PersistAction, Position, PositionId, PositionState,
    TriggerContext,
};
use recon_risk::FatalReason;
use recon_telemetry::Metrics;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::book::EngineContext;
use crate::error::{PositionError, PositionResult};
use crate::reconcile::{ReconcileOutcome, ReconciliationDiff, SymbolReport};
use crate::strategy::{Action, AssetView, Strategy};
use crate::window::RollingWindow;

/// Clears the evaluation flag when an evaluation ends, including by panic.
struct EvaluatingGuard<'a>(&'a AtomicBool);

impl Drop for EvaluatingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub type SharedPosition = Arc<RwLock<Position>>;

struct MarketState {
    window: RollingWindow,
    /// Broker-confirmed quantity.
    qty: Decimal,
}

/// Result of an open request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// Order sent; the position is pending its fill.
    Submitted(PositionId),
    /// The strategy already holds a position on this asset.
    AlreadyHeld,
    /// New positions are blocked by the circuit breaker.
    Blocked,
    /// No price, or the last price is too old.
    StalePrice,
    /// The decision waited too long for the decision lock.
    StaleDecision,
}

/// Result of a close request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Close order sent under this client order id.
    Submitted(String),
    NoPosition,
    /// An open or close is still in flight.
    Pending(PositionState),
}

/// What an order update did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Nothing matched; state unchanged.
    Ignored,
    /// Quantity applied; the leg is still working.
    Partial,
    /// Update for an order that is no longer the pending leg. Any quantity
    /// change is still applied.
    Stale,
    /// Open resolved with quantity; the position is live.
    Opened,
    /// Open resolved with nothing filled; the position is gone.
    OpenVoided,
    /// Close resolved flat; the position is gone.
    Closed,
    /// Close resolved with quantity left; `strategy` must close again.
    ReissueClose(String),
}

fn age_ms(since: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - since).num_milliseconds()
}

fn fill_from_history(leg: &mut OrderLeg, history: &HashMap<String, ClosedOrder>) {
    if let Some(order) = leg.order_id.as_ref().and_then(|id| history.get(id)) {
        leg.record_fill(order.filled_at, order.filled_avg_price);
    }
}

pub struct Asset {
    symbol: String,
    asset_class: AssetClass,
    market: RwLock<MarketState>,
    positions: RwLock<HashMap<String, SharedPosition>>,
    decision: tokio::sync::Mutex<()>,
    evaluating: AtomicBool,
    strategies: Vec<Arc<dyn Strategy>>,
    ctx: Arc<EngineContext>,
}

impl Asset {
    pub fn new(
        symbol: &str,
        asset_class: AssetClass,
        strategies: Vec<Arc<dyn Strategy>>,
        ctx: Arc<EngineContext>,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            asset_class,
            market: RwLock::new(MarketState {
                window: RollingWindow::new(ctx.config.window_size),
                qty: Decimal::ZERO,
            }),
            positions: RwLock::new(HashMap::new()),
            decision: tokio::sync::Mutex::new(()),
            evaluating: AtomicBool::new(false),
            strategies,
            ctx,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn asset_class(&self) -> AssetClass {
        self.asset_class
    }

    /// Cached broker quantity.
    pub fn qty(&self) -> Decimal {
        self.market.read().qty
    }

    pub fn window(&self) -> RollingWindow {
        self.market.read().window.clone()
    }

    pub fn position(&self, strategy: &str) -> Option<Position> {
        self.shared(strategy).map(|p| p.read().clone())
    }

    /// Snapshots of every position, ordered by strategy.
    pub fn positions(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .positions
            .read()
            .values()
            .map(|p| p.read().clone())
            .collect();
        positions.sort_by(|a, b| a.strategy.cmp(&b.strategy));
        positions
    }

    pub fn position_count(&self) -> usize {
        self.positions.read().len()
    }

    pub fn has_pending(&self) -> bool {
        self.positions.read().values().any(|p| p.read().is_pending())
    }

    /// Sum of position quantities.
    pub fn positions_qty(&self) -> Decimal {
        self.positions.read().values().map(|p| p.read().qty).sum()
    }

    fn shared(&self, strategy: &str) -> Option<SharedPosition> {
        self.positions.read().get(strategy).cloned()
    }

    fn insert(&self, position: Position) {
        let count = {
            let mut map = self.positions.write();
            map.insert(position.strategy.clone(), Arc::new(RwLock::new(position)));
            map.len()
        };
        Metrics::open_positions_set(&self.symbol, count);
    }

    fn remove(&self, strategies: &[String]) {
        if strategies.is_empty() {
            return;
        }
        let count = {
            let mut map = self.positions.write();
            for strategy in strategies {
                map.remove(strategy);
            }
            map.len()
        };
        Metrics::open_positions_set(&self.symbol, count);
    }

    fn check_invariant(&self, asset_qty: Decimal) -> PositionResult<()> {
        let positions_qty = self.positions_qty();
        if positions_qty == asset_qty {
            return Ok(());
        }
        error!(
            symbol = %self.symbol,
            asset_qty = %asset_qty,
            positions_qty = %positions_qty,
            "Position quantities diverged from asset quantity"
        );
        Err(PositionError::Fatal(FatalReason::QuantityMismatch {
            symbol: self.symbol.clone(),
            asset_qty,
            positions_qty,
        }))
    }

    // ------------------------------------------------------------------
    // Market data and evaluation
    // ------------------------------------------------------------------

    /// Fold a bar or trade into the window.
    pub fn apply_market_event(&self, event: &MarketEvent) {
        let mut market = self.market.write();
        match event {
            MarketEvent::Bar(bar) => market.window.update_on_bar(bar),
            MarketEvent::Trade(tick) => market.window.update_on_trade(tick),
        }
    }

    /// Start an evaluation unless one is already running for this asset.
    pub fn signal(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self
            .evaluating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(symbol = %self.symbol, "Evaluation already running, signal coalesced");
            return None;
        }
        let asset = Arc::clone(self);
        Some(tokio::spawn(async move {
            let _running = EvaluatingGuard(&asset.evaluating);
            asset.evaluate().await;
        }))
    }

    /// Run every strategy against the current window and act on decisions.
    pub async fn evaluate(&self) {
        if self.strategies.is_empty() {
            return;
        }
        let decided_at = Utc::now();
        let decisions: Vec<(String, crate::strategy::Decision)> = {
            let market = self.market.read();
            let positions = self.positions();
            let view = AssetView {
                symbol: &self.symbol,
                asset_class: self.asset_class,
                window: &market.window,
                qty: market.qty,
                positions: &positions,
            };
            self.strategies
                .iter()
                .filter_map(|s| s.evaluate(&view).map(|d| (s.name().to_string(), d)))
                .collect()
        };

        for (strategy, decision) in decisions {
            let result = match decision.action {
                Action::Open { side } => self
                    .open(&strategy, side, decision.order_type, decided_at)
                    .await
                    .map(|outcome| debug!(symbol = %self.symbol, strategy, ?outcome, "Open decision")),
                Action::Close => self
                    .close(&strategy, decision.order_type)
                    .await
                    .map(|outcome| debug!(symbol = %self.symbol, strategy, ?outcome, "Close decision")),
            };
            if let Err(e) = result {
                match e.fatal_reason() {
                    Some(reason) => {
                        self.ctx.halt.trigger(reason.clone());
                    }
                    None => warn!(symbol = %self.symbol, strategy, error = %e, "Decision failed"),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Open / Close
    // ------------------------------------------------------------------

    /// Open a position for `strategy`.
    ///
    /// No-op if the strategy already holds one. Refused when the price or
    /// the decision is stale, or while new positions are blocked. If the
    /// order cannot be sent the pending position is discarded.
    pub async fn open(
        &self,
        strategy: &str,
        side: OrderSide,
        order_type: OrderType,
        decided_at: DateTime<Utc>,
    ) -> PositionResult<OpenOutcome> {
        let _state = self.ctx.read_state().await;
        let _decision = self.decision.lock().await;

        if self.positions.read().contains_key(strategy) {
            return Ok(OpenOutcome::AlreadyHeld);
        }
        if side != OrderSide::Buy {
            Metrics::open_rejected("unsupported_side");
            return Err(PositionError::UnsupportedSide {
                symbol: self.symbol.clone(),
                side,
            });
        }

        let now = Utc::now();
        let (price, bar_time, received_at) = {
            let market = self.market.read();
            (
                market.window.last_close(),
                market.window.bar_time(),
                market.window.received_at(),
            )
        };
        let limits = &self.ctx.config;
        let received_at = match received_at {
            Some(at) if price > Decimal::ZERO && age_ms(at, now) < limits.max_price_age_ms as i64 => {
                at
            }
            _ => {
                Metrics::open_rejected("stale_price");
                debug!(symbol = %self.symbol, strategy, "Open refused, price stale");
                return Ok(OpenOutcome::StalePrice);
            }
        };
        if age_ms(decided_at, now) >= limits.max_decision_age_ms as i64 {
            Metrics::open_rejected("stale_decision");
            debug!(symbol = %self.symbol, strategy, "Open refused, decision stale");
            return Ok(OpenOutcome::StaleDecision);
        }
        if self.ctx.breaker.is_blocked() {
            Metrics::open_rejected("blocked");
            debug!(
                symbol = %self.symbol,
                strategy,
                blocked_by = ?self.ctx.breaker.blocked_by(),
                "Open refused, new positions blocked"
            );
            return Ok(OpenOutcome::Blocked);
        }

        let id = PositionId::new(&self.symbol, strategy, now)?;
        let trigger = TriggerContext {
            side,
            order_type,
            trigger_time: now,
            trigger_price: price,
            bar_time: bar_time.unwrap_or(received_at),
            price_received_at: received_at,
        };
        self.insert(Position::pending_open(
            id.clone(),
            &self.symbol,
            strategy,
            self.asset_class,
            trigger,
        ));

        match self
            .ctx
            .broker
            .open_long_ioc(&self.symbol, self.asset_class, id.as_str(), price)
            .await
        {
            Ok(()) => {
                Metrics::order_submitted("open", "ok");
                info!(symbol = %self.symbol, strategy, position_id = %id, price = %price, "Open order sent");
                Ok(OpenOutcome::Submitted(id))
            }
            Err(e) => {
                Metrics::order_submitted("open", "error");
                warn!(symbol = %self.symbol, strategy, error = %e, "Open order failed, discarding position");
                self.discard_unfilled_open(strategy, &id);
                Err(e.into())
            }
        }
    }

    /// Drop a position whose open never reached the broker, unless an update
    /// already raced in and gave it quantity.
    fn discard_unfilled_open(&self, strategy: &str, id: &PositionId) {
        let discard = self.shared(strategy).is_some_and(|p| {
            let p = p.read();
            p.id == *id && p.open.pending && p.qty.is_zero()
        });
        if discard {
            self.remove(&[strategy.to_string()]);
        }
    }

    /// Close the position held by `strategy`.
    ///
    /// No-op without a position or while either leg is pending. If the order
    /// cannot be sent the close is disarmed so a later signal can retry.
    pub async fn close(&self, strategy: &str, order_type: OrderType) -> PositionResult<CloseOutcome> {
        let _state = self.ctx.read_state().await;
        let _decision = self.decision.lock().await;

        let Some(shared) = self.shared(strategy) else {
            return Ok(CloseOutcome::NoPosition);
        };

        let now = Utc::now();
        let (price, bar_time, received_at) = {
            let market = self.market.read();
            (
                market.window.last_close(),
                market.window.bar_time(),
                market.window.received_at(),
            )
        };

        let (order_id, side, qty) = {
            let mut p = shared.write();
            let side = p.closing_side();
            let trigger = TriggerContext {
                side,
                order_type,
                trigger_time: now,
                trigger_price: price,
                bar_time: bar_time.unwrap_or(now),
                price_received_at: received_at.unwrap_or(now),
            };
            match p.begin_close(trigger) {
                Ok(order_id) => (order_id, side, p.qty.abs()),
                Err(PendingConflict(state)) => return Ok(CloseOutcome::Pending(state)),
            }
        };

        match self
            .ctx
            .broker
            .close_ioc(side, &self.symbol, &order_id, qty)
            .await
        {
            Ok(()) => {
                Metrics::order_submitted("close", "ok");
                info!(symbol = %self.symbol, strategy, order_id, qty = %qty, "Close order sent");
                Ok(CloseOutcome::Submitted(order_id))
            }
            Err(e) => {
                Metrics::order_submitted("close", "error");
                warn!(symbol = %self.symbol, strategy, order_id, error = %e, "Close order failed");
                let mut p = shared.write();
                if p.close.pending && p.close.order_id.as_deref() == Some(order_id.as_str()) {
                    p.abort_close();
                }
                Err(e.into())
            }
        }
    }

    // ------------------------------------------------------------------
    // Order updates
    // ------------------------------------------------------------------

    /// Apply one order update.
    ///
    /// The caller holds the engine state lock for reading.
    pub fn apply_order_update(&self, update: &OrderUpdate) -> PositionResult<UpdateOutcome> {
        let Some(parsed) = ParsedOrderId::parse(&update.client_order_id) else {
            return Ok(UpdateOutcome::Ignored);
        };
        let mut market = self.market.write();

        let Some(shared) = self.shared(&update.strategy) else {
            return self.unmatched_update(update, market.qty);
        };

        let mut removed = Vec::new();
        let outcome = {
            let mut guard = shared.write();
            if !guard.id.owns_order(&update.client_order_id) {
                drop(guard);
                return self.unmatched_update(update, market.qty);
            }
            let p = &mut *guard;
            let is_open = parsed.leg == OrderLegKind::Open;
            let leg = if is_open { &mut p.open } else { &mut p.close };
            let current =
                leg.pending && leg.order_id.as_deref() == Some(update.client_order_id.as_str());

            let delta = match update.position_qty {
                Some(broker_qty) => broker_qty - market.qty,
                None if current => {
                    let side = update
                        .side
                        .or_else(|| leg.trigger.as_ref().map(|t| t.side));
                    match (side, update.filled_qty) {
                        (Some(side), Some(cumulative)) => {
                            side.sign() * (cumulative - leg.filled_qty).max(Decimal::ZERO)
                        }
                        _ => Decimal::ZERO,
                    }
                }
                None => Decimal::ZERO,
            };

            if current {
                if let Some(cumulative) = update.filled_qty {
                    leg.filled_qty = leg.filled_qty.max(cumulative);
                }
                leg.record_fill(update.filled_at, update.filled_avg_price);
            }
            p.qty += delta;
            market.qty += delta;

            if !current {
                debug!(
                    symbol = %self.symbol,
                    client_order_id = %update.client_order_id,
                    delta = %delta,
                    "Update for a leg that is no longer pending"
                );
                UpdateOutcome::Stale
            } else if !update.event.is_terminal() {
                UpdateOutcome::Partial
            } else if is_open {
                p.settle_open();
                if p.qty.is_zero() {
                    info!(symbol = %self.symbol, position_id = %p.id, "Open resolved unfilled");
                    removed.push(p.strategy.clone());
                    UpdateOutcome::OpenVoided
                } else {
                    info!(symbol = %self.symbol, position_id = %p.id, qty = %p.qty, "Position opened");
                    self.ctx.persistence.enqueue(PersistAction::Open, p);
                    UpdateOutcome::Opened
                }
            } else {
                p.settle_close();
                self.ctx.persistence.enqueue(PersistAction::Close, p);
                if p.qty.is_zero() {
                    info!(symbol = %self.symbol, position_id = %p.id, "Position closed");
                    removed.push(p.strategy.clone());
                    UpdateOutcome::Closed
                } else {
                    info!(
                        symbol = %self.symbol,
                        position_id = %p.id,
                        remaining = %p.qty,
                        "Close resolved with quantity left"
                    );
                    UpdateOutcome::ReissueClose(p.strategy.clone())
                }
            }
        };

        self.remove(&removed);
        self.check_invariant(market.qty)?;
        Ok(outcome)
    }

    /// An update that matches no live position. Harmless unless it moves
    /// quantity, which would leave the broker holding something untracked.
    fn unmatched_update(
        &self,
        update: &OrderUpdate,
        asset_qty: Decimal,
    ) -> PositionResult<UpdateOutcome> {
        let moves_qty = match update.position_qty {
            Some(broker_qty) => broker_qty != asset_qty,
            None => update.filled_qty.is_some_and(|q| !q.is_zero()),
        };
        if moves_qty {
            error!(
                symbol = %self.symbol,
                client_order_id = %update.client_order_id,
                event = %update.event,
                "Fill for an order with no live position"
            );
            return Err(PositionError::Fatal(FatalReason::MissingPosition {
                client_order_id: update.client_order_id.clone(),
            }));
        }
        warn!(
            symbol = %self.symbol,
            client_order_id = %update.client_order_id,
            event = %update.event,
            "Order update for unknown position ignored"
        );
        Metrics::order_update_dropped("unknown_position");
        Ok(UpdateOutcome::Ignored)
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Repair pending positions against the broker's quantity.
    ///
    /// The caller holds the engine state lock for writing.
    pub fn reconcile(
        &self,
        broker_qty: Decimal,
        history: &HashMap<String, ClosedOrder>,
    ) -> PositionResult<SymbolReport> {
        let mut market = self.market.write();
        let pending: Vec<SharedPosition> = self
            .positions
            .read()
            .values()
            .filter(|p| p.read().is_pending())
            .cloned()
            .collect();

        let diff = ReconciliationDiff {
            symbol: self.symbol.clone(),
            broker_qty,
            local_qty: market.qty,
            diff: broker_qty - market.qty,
            pending: pending.iter().map(|p| p.read().id.clone()).collect(),
        };
        let precision = self.asset_class.qty_precision();
        let mut removed = Vec::new();
        let mut reissue = Vec::new();
        let mut repaired = Vec::new();

        let outcome = match diff.diff.cmp(&Decimal::ZERO) {
            CmpOrdering::Equal => {
                for shared in &pending {
                    let mut p = shared.write();
                    p.bad_for_analysis = true;
                    p.qty = Decimal::ZERO;
                    p.settle_open();
                    p.settle_close();
                    removed.push(p.strategy.clone());
                    repaired.push(p.clone());
                }
                ReconcileOutcome::InSync
            }
            CmpOrdering::Greater => {
                let (opens, closes): (Vec<&SharedPosition>, Vec<&SharedPosition>) =
                    pending.iter().partition(|p| p.read().open.pending);
                // Closes count as completed, so their quantity is part of
                // what the opens filled.
                let mut released = Decimal::ZERO;
                for shared in closes {
                    let mut guard = shared.write();
                    let p = &mut *guard;
                    released += p.qty;
                    p.bad_for_analysis = true;
                    p.qty = Decimal::ZERO;
                    fill_from_history(&mut p.close, history);
                    p.settle_close();
                    self.ctx.persistence.enqueue(PersistAction::Close, p);
                    removed.push(p.strategy.clone());
                    repaired.push(p.clone());
                }
                let shares = split(opens.len(), diff.diff + released, precision);
                for (shared, share) in opens.into_iter().zip(shares) {
                    let mut guard = shared.write();
                    let p = &mut *guard;
                    p.qty += share;
                    p.bad_for_analysis = true;
                    fill_from_history(&mut p.open, history);
                    p.settle_open();
                    if p.qty.is_zero() {
                        removed.push(p.strategy.clone());
                    } else {
                        self.ctx.persistence.enqueue(PersistAction::Open, p);
                    }
                    repaired.push(p.clone());
                }
                ReconcileOutcome::Opened
            }
            CmpOrdering::Less => {
                let shares = split(pending.len(), -diff.diff, precision);
                let attributable = pending.iter().zip(&shares).all(|(p, share)| {
                    let p = p.read();
                    p.close.pending && *share <= p.qty
                });
                if attributable {
                    for (shared, share) in pending.iter().zip(shares) {
                        let mut guard = shared.write();
                        let p = &mut *guard;
                        p.qty -= share;
                        p.bad_for_analysis = true;
                        fill_from_history(&mut p.close, history);
                        p.settle_close();
                        self.ctx.persistence.enqueue(PersistAction::Close, p);
                        if p.qty.is_zero() {
                            removed.push(p.strategy.clone());
                        } else {
                            reissue.push(p.strategy.clone());
                        }
                        repaired.push(p.clone());
                    }
                    ReconcileOutcome::Closed
                } else {
                    error!(
                        symbol = %self.symbol,
                        diff = %diff.diff,
                        pending = diff.pending.len(),
                        "Negative quantity difference cannot be attributed to pending closes"
                    );
                    ReconcileOutcome::Unresolved
                }
            }
        };

        self.remove(&removed);
        market.qty = broker_qty;
        if outcome != ReconcileOutcome::Unresolved {
            self.check_invariant(market.qty)?;
        }

        info!(
            symbol = %self.symbol,
            broker_qty = %broker_qty,
            local_qty = %diff.local_qty,
            outcome = outcome.as_str(),
            removed = removed.len(),
            reissue = reissue.len(),
            "Reconciled"
        );
        Ok(SymbolReport {
            diff,
            outcome,
            repaired,
            removed,
            reissue,
        })
    }
}
