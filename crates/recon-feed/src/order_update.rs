//! `trade_updates` payload parsing.
//!
//! ```json
//! {"event":"fill","timestamp":"...","position_qty":"10","price":"187.2","qty":"10",
//!  "order":{"client_order_id":"AAPL:momentum:1704209400000","symbol":"AAPL",
//!           "asset_class":"us_equity","side":"buy","filled_qty":"10",
//!           "filled_avg_price":"187.2","filled_at":"2024-01-02T15:30:01Z"}}
//! ```
//!
//! The event kind and the strategy in the client order id must parse or the
//! update is dropped. Quantities must parse or the process stops. Prices and
//! times that fail to parse are dropped from the update with a warning.

use chrono::{DateTime, Utc};
use recon_core::{decimal_from_json, AssetClass, OrderEvent, OrderSide, OrderUpdate, ParsedOrderId};
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FeedError, FeedResult};

/// Parse one `trade_updates` payload.
///
/// Returns `Ok(None)` for event kinds the engine does not act on.
pub fn parse_order_update(data: &Value) -> FeedResult<Option<OrderUpdate>> {
    let raw_event = data
        .get("event")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::ParseError("trade update without event".to_string()))?;
    let Some(event) = OrderEvent::parse(raw_event) else {
        debug!(event = raw_event, "Ignoring order event");
        return Ok(None);
    };

    let order = data
        .get("order")
        .filter(|o| o.is_object())
        .ok_or_else(|| FeedError::ParseError("trade update without order".to_string()))?;

    let client_order_id = order
        .get("client_order_id")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::ParseError("order without client_order_id".to_string()))?;
    let parsed = ParsedOrderId::parse(client_order_id).ok_or_else(|| {
        FeedError::ParseError(format!("no strategy in client_order_id {client_order_id:?}"))
    })?;

    let asset_class = order
        .get("asset_class")
        .and_then(Value::as_str)
        .ok_or_else(|| FeedError::ParseError("order without asset_class".to_string()))?
        .parse::<AssetClass>()
        .map_err(|e| FeedError::ParseError(e.to_string()))?;

    let side = optional_str(order, "side").and_then(|raw| match raw.parse::<OrderSide>() {
        Ok(side) => Some(side),
        Err(e) => {
            warn!(client_order_id, error = %e, "Dropping malformed side");
            None
        }
    });

    Ok(Some(OrderUpdate {
        event,
        asset_class,
        strategy: parsed.strategy,
        client_order_id: client_order_id.to_string(),
        side,
        symbol: optional_str(order, "symbol").map(str::to_string),
        filled_qty: quantity(order, "filled_qty")?,
        position_qty: quantity(data, "position_qty")?,
        filled_at: time(order, "filled_at", client_order_id),
        filled_avg_price: price(order, "filled_avg_price", client_order_id),
    }))
}

fn present<'a>(object: &'a Value, field: &str) -> Option<&'a Value> {
    object.get(field).filter(|v| !v.is_null())
}

fn optional_str<'a>(object: &'a Value, field: &str) -> Option<&'a str> {
    present(object, field).and_then(Value::as_str)
}

fn quantity(object: &Value, field: &str) -> FeedResult<Option<Decimal>> {
    let Some(value) = present(object, field) else {
        return Ok(None);
    };
    decimal_from_json(field, value)
        .map(Some)
        .map_err(|_| FeedError::InvalidQuantity {
            field: field.to_string(),
            value: value.to_string(),
        })
}

fn price(object: &Value, field: &str, client_order_id: &str) -> Option<Decimal> {
    let value = present(object, field)?;
    match decimal_from_json(field, value) {
        Ok(price) => Some(price),
        Err(e) => {
            warn!(client_order_id, error = %e, "Dropping malformed price");
            None
        }
    }
}

fn time(object: &Value, field: &str, client_order_id: &str) -> Option<DateTime<Utc>> {
    let raw = present(object, field)?;
    match raw.as_str().map(DateTime::parse_from_rfc3339) {
        Some(Ok(t)) => Some(t.with_timezone(&Utc)),
        _ => {
            warn!(client_order_id, field, value = %raw, "Dropping malformed time");
            None
        }
    }
}
