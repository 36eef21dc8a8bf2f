//! Prometheus metrics for the reconciliation engine.
//!
//! Covers:
//! - Feed connection state and reconnects
//! - Order submissions and order-update handling
//! - Reconciliation outcomes
//! - Persistence health
//!
//! # Panics
//!
//! Metric registration uses `unwrap()`. A registration failure means a
//! duplicate metric name, which must crash at startup rather than be
//! silently ignored. These panics only occur during static initialization.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_counter, register_int_gauge,
    register_int_gauge_vec, CounterVec, Encoder, GaugeVec, IntCounter, IntGauge, IntGaugeVec,
    TextEncoder,
};

use crate::error::TelemetryResult;

/// Feed connection state (1 = listening, 0 = not).
pub static FEED_CONNECTED: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "recon_feed_connected",
        "Feed connection state (1=listening)",
        &["feed"]
    )
    .unwrap()
});

/// Feed lifecycle state, one-hot.
pub static FEED_STATE: Lazy<GaugeVec> = Lazy::new(|| {
    register_gauge_vec!(
        "recon_feed_state",
        "Feed lifecycle current state (1=active, 0=inactive)",
        &["feed", "state"]
    )
    .unwrap()
});

/// Total reconnect attempts.
pub static FEED_RECONNECT_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_feed_reconnect_total",
        "Total feed reconnection attempts",
        &["feed", "reason"]
    )
    .unwrap()
});

/// Market data events routed to assets.
pub static MARKET_EVENTS_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_market_events_total",
        "Market data events routed to assets",
        &["kind"]
    )
    .unwrap()
});

/// Order-update events applied.
pub static ORDER_UPDATES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_order_updates_total",
        "Order updates applied to positions",
        &["event"]
    )
    .unwrap()
});

/// Order-update events dropped without effect.
pub static ORDER_UPDATES_DROPPED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_order_updates_dropped_total",
        "Order updates dropped",
        &["reason"]
    )
    .unwrap()
});

/// Orders submitted to the broker.
pub static ORDERS_SUBMITTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_orders_submitted_total",
        "Orders submitted to the broker",
        &["leg", "result"]
    )
    .unwrap()
});

/// Open requests refused before reaching the broker.
pub static OPEN_REJECTED_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_open_rejected_total",
        "Open requests refused by guards",
        &["reason"]
    )
    .unwrap()
});

/// Reconciliation outcomes per symbol.
pub static RECONCILE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "recon_reconcile_total",
        "Reconciliation outcomes per symbol",
        &["outcome"]
    )
    .unwrap()
});

/// Live positions per symbol.
pub static OPEN_POSITIONS: Lazy<IntGaugeVec> = Lazy::new(|| {
    register_int_gauge_vec!("recon_open_positions", "Live positions", &["symbol"]).unwrap()
});

/// Circuit breaker aggregate (1 = new positions blocked).
pub static NO_NEW_POSITIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "recon_no_new_positions",
        "NoNewPositions aggregate (1=blocked)"
    )
    .unwrap()
});

/// Persistence write failures.
pub static PERSISTENCE_FAILURES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "recon_persistence_failures_total",
        "Persistence write failures"
    )
    .unwrap()
});

/// Records waiting in the persistence queue.
pub static PERSISTENCE_QUEUE_DEPTH: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "recon_persistence_queue_depth",
        "Records waiting to be persisted"
    )
    .unwrap()
});

const FEED_STATES: [&str; 5] = [
    "disconnected",
    "connecting",
    "authenticating",
    "subscribing",
    "listening",
];

/// Metrics facade for easy access.
pub struct Metrics;

impl Metrics {
    /// Set the feed lifecycle state. Only the active state is 1.
    pub fn feed_state_set(feed: &str, state: &str) {
        for s in FEED_STATES {
            FEED_STATE.with_label_values(&[feed, s]).set(0.0);
        }
        FEED_STATE.with_label_values(&[feed, state]).set(1.0);
        let connected = if state == "listening" { 1.0 } else { 0.0 };
        FEED_CONNECTED.with_label_values(&[feed]).set(connected);
    }

    pub fn feed_reconnect(feed: &str, reason: &str) {
        FEED_RECONNECT_TOTAL.with_label_values(&[feed, reason]).inc();
    }

    pub fn market_event(kind: &str) {
        MARKET_EVENTS_TOTAL.with_label_values(&[kind]).inc();
    }

    pub fn order_update(event: &str) {
        ORDER_UPDATES_TOTAL.with_label_values(&[event]).inc();
    }

    pub fn order_update_dropped(reason: &str) {
        ORDER_UPDATES_DROPPED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// `leg` is "open" or "close"; `result` is "ok" or "error".
    pub fn order_submitted(leg: &str, result: &str) {
        ORDERS_SUBMITTED_TOTAL.with_label_values(&[leg, result]).inc();
    }

    pub fn open_rejected(reason: &str) {
        OPEN_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    pub fn reconcile_outcome(outcome: &str) {
        RECONCILE_TOTAL.with_label_values(&[outcome]).inc();
    }

    pub fn open_positions_set(symbol: &str, count: usize) {
        OPEN_POSITIONS
            .with_label_values(&[symbol])
            .set(count as i64);
    }

    pub fn no_new_positions_set(blocked: bool) {
        NO_NEW_POSITIONS.set(i64::from(blocked));
    }

    pub fn persistence_failure() {
        PERSISTENCE_FAILURES_TOTAL.inc();
    }

    pub fn persistence_queue_inc() {
        PERSISTENCE_QUEUE_DEPTH.inc();
    }

    pub fn persistence_queue_dec() {
        PERSISTENCE_QUEUE_DEPTH.dec();
    }

    /// Render every registered metric in the prometheus text format.
    pub fn render() -> TelemetryResult<String> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&prometheus::gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
