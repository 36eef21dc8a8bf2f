//! REST client for an Alpaca-style trading API.
//!
//! Order submission is single-shot. Position and order-history queries are
//! retried with capped backoff on transport errors, throttling and 5xx.

use crate::broker::{BoxFuture, Broker, ClosedOrder};
use crate::error::{BrokerError, BrokerResult};
use chrono::{DateTime, Utc};
use recon_core::{floor_to, parse_decimal, AssetClass, Backoff, OrderSide};
use reqwest::{Client, RequestBuilder};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const KEY_HEADER: &str = "APCA-API-KEY-ID";
const SECRET_HEADER: &str = "APCA-API-SECRET-KEY";

/// Connection and sizing settings for [`RestBroker`].
#[derive(Debug, Clone)]
pub struct RestBrokerConfig {
    /// API root, e.g. `https://paper-api.alpaca.markets`.
    pub base_url: String,
    pub key_id: String,
    pub secret_key: String,
    /// Notional value of each opening order.
    pub order_notional: Decimal,
    /// Retries for queries after the first attempt.
    pub max_retries: u32,
    pub retry_backoff: Backoff,
}

#[derive(Debug, Serialize)]
struct OrderRequest<'a> {
    symbol: &'a str,
    qty: String,
    side: OrderSide,
    #[serde(rename = "type")]
    order_type: &'static str,
    time_in_force: &'static str,
    client_order_id: &'a str,
}

#[derive(Debug, Deserialize)]
struct RawPosition {
    symbol: String,
    qty: String,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    #[serde(default)]
    client_order_id: Option<String>,
    symbol: String,
    #[serde(default)]
    side: Option<String>,
    #[serde(default)]
    filled_qty: Option<String>,
    #[serde(default)]
    filled_avg_price: Option<String>,
    #[serde(default)]
    filled_at: Option<DateTime<Utc>>,
}

/// Quantity for an opening order worth `notional` at `price`, rounded down
/// to what the asset class allows.
pub fn order_qty(
    notional: Decimal,
    price: Decimal,
    asset_class: AssetClass,
) -> BrokerResult<Decimal> {
    if price <= Decimal::ZERO {
        return Err(BrokerError::InvalidOrder(format!(
            "reference price must be positive, got {price}"
        )));
    }
    let qty = floor_to(notional / price, asset_class.qty_precision());
    if qty <= Decimal::ZERO {
        return Err(BrokerError::InvalidOrder(format!(
            "notional {notional} buys nothing at {price}"
        )));
    }
    Ok(qty)
}

fn parse_positions(raw: Vec<RawPosition>) -> BrokerResult<HashMap<String, Decimal>> {
    raw.into_iter()
        .map(|p| {
            let qty = parse_decimal("qty", &p.qty).map_err(|_| BrokerError::InvalidQuantity {
                symbol: p.symbol.clone(),
                value: p.qty.clone(),
            })?;
            Ok((p.symbol, qty))
        })
        .collect()
}

fn parse_orders(raw: Vec<RawOrder>) -> BrokerResult<Vec<ClosedOrder>> {
    let mut orders = Vec::with_capacity(raw.len());
    for o in raw {
        let Some(client_order_id) = o.client_order_id.filter(|id| !id.is_empty()) else {
            continue;
        };
        let filled_qty = match o.filled_qty.as_deref() {
            None => Decimal::ZERO,
            Some(raw) => parse_decimal("filled_qty", raw).map_err(|_| {
                BrokerError::InvalidQuantity {
                    symbol: o.symbol.clone(),
                    value: raw.to_string(),
                }
            })?,
        };
        let filled_avg_price = match o.filled_avg_price.as_deref() {
            None => None,
            Some(raw) => match parse_decimal("filled_avg_price", raw) {
                Ok(p) => Some(p),
                Err(e) => {
                    warn!(error = %e, client_order_id = %client_order_id, "Dropping bad fill price");
                    None
                }
            },
        };
        orders.push(ClosedOrder {
            client_order_id,
            symbol: o.symbol,
            side: o.side.as_deref().and_then(|s| s.parse().ok()),
            filled_qty,
            filled_avg_price,
            filled_at: o.filled_at,
        });
    }
    Ok(orders)
}

/// Broker implementation over HTTP.
pub struct RestBroker {
    client: Client,
    config: RestBrokerConfig,
}

impl RestBroker {
    pub fn new(config: RestBrokerConfig) -> BrokerResult<Self> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::HttpClient(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        req.header(KEY_HEADER, &self.config.key_id)
            .header(SECRET_HEADER, &self.config.secret_key)
    }

    async fn send(&self, req: RequestBuilder) -> BrokerResult<reqwest::Response> {
        let response = self
            .authed(req)
            .send()
            .await
            .map_err(|e| BrokerError::HttpClient(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> BrokerResult<T> {
        let response = self.send(self.client.get(self.url(path)).query(query)).await?;
        response
            .json()
            .await
            .map_err(|e| BrokerError::Decode(format!("{path}: {e}")))
    }

    /// GET with retries on retryable errors.
    async fn get_json_with_retry<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> BrokerResult<T> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_json(path, query).await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.retry_backoff.delay(attempt);
                    warn!(
                        path,
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Broker query failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn submit(&self, order: OrderRequest<'_>) -> BrokerResult<()> {
        debug!(
            symbol = order.symbol,
            side = %order.side,
            qty = %order.qty,
            client_order_id = order.client_order_id,
            "Submitting order"
        );
        self.send(self.client.post(self.url("/v2/orders")).json(&order))
            .await?;
        Ok(())
    }
}

impl Broker for RestBroker {
    fn open_long_ioc<'a>(
        &'a self,
        symbol: &'a str,
        asset_class: AssetClass,
        order_id: &'a str,
        reference_price: Decimal,
    ) -> BoxFuture<'a, BrokerResult<()>> {
        Box::pin(async move {
            let qty = order_qty(self.config.order_notional, reference_price, asset_class)?;
            self.submit(OrderRequest {
                symbol,
                qty: qty.to_string(),
                side: OrderSide::Buy,
                order_type: "market",
                time_in_force: "ioc",
                client_order_id: order_id,
            })
            .await
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
            let qty = qty.abs();
            if qty.is_zero() {
                return Err(BrokerError::InvalidOrder(format!(
                    "close of {symbol} with zero quantity"
                )));
            }
            self.submit(OrderRequest {
                symbol,
                qty: qty.normalize().to_string(),
                side,
                order_type: "market",
                time_in_force: "ioc",
                client_order_id: order_id,
            })
            .await
        })
    }

    fn asset_quantities(&self) -> BoxFuture<'_, BrokerResult<HashMap<String, Decimal>>> {
        Box::pin(async move {
            let raw: Vec<RawPosition> = self.get_json_with_retry("/v2/positions", &[]).await?;
            let quantities = parse_positions(raw)?;
            debug!(symbols = quantities.len(), "Fetched broker positions");
            Ok(quantities)
        })
    }

    fn closed_orders<'a>(
        &'a self,
        symbols: &'a [String],
    ) -> BoxFuture<'a, BrokerResult<Vec<ClosedOrder>>> {
        Box::pin(async move {
            if symbols.is_empty() {
                return Ok(Vec::new());
            }
            let query = [
                ("status", "closed".to_string()),
                ("symbols", symbols.join(",")),
                ("direction", "desc".to_string()),
                ("limit", "500".to_string()),
            ];
            let raw: Vec<RawOrder> = self.get_json_with_retry("/v2/orders", &query).await?;
            parse_orders(raw)
        })
    }

    fn liquidate_all(&self) -> BoxFuture<'_, BrokerResult<()>> {
        Box::pin(async move {
            info!("Liquidating all broker positions");
            self.send(
                self.client
                    .delete(self.url("/v2/positions"))
                    .query(&[("cancel_orders", "true")]),
            )
            .await?;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_order_qty_rounds_down_per_class() {
        assert_eq!(
            order_qty(dec!(1000), dec!(187.3), AssetClass::UsEquity).unwrap(),
            dec!(5)
        );
        assert_eq!(
            order_qty(dec!(100), dec!(30000), AssetClass::Crypto).unwrap(),
            dec!(0.003333333)
        );
    }

    #[test]
    fn test_order_qty_rejects_empty_orders() {
        assert!(order_qty(dec!(100), dec!(500), AssetClass::UsEquity).is_err());
        assert!(order_qty(dec!(100), dec!(0), AssetClass::Crypto).is_err());
    }

    #[test]
    fn test_parse_positions() {
        let raw: Vec<RawPosition> = serde_json::from_str(
            r#"[{"symbol":"AAPL","qty":"12","side":"long"},
                {"symbol":"BTCUSD","qty":"0.015","side":"long"}]"#,
        )
        .unwrap();
        let positions = parse_positions(raw).unwrap();
        assert_eq!(positions["AAPL"], dec!(12));
        assert_eq!(positions["BTCUSD"], dec!(0.015));
    }

    #[test]
    fn test_parse_positions_bad_qty_is_error() {
        let raw: Vec<RawPosition> =
            serde_json::from_str(r#"[{"symbol":"AAPL","qty":"twelve"}]"#).unwrap();
        assert!(matches!(
            parse_positions(raw),
            Err(BrokerError::InvalidQuantity { .. })
        ));
    }

    #[test]
    fn test_parse_orders_skips_anonymous_and_tolerates_bad_price() {
        let raw: Vec<RawOrder> = serde_json::from_str(
            r#"[
                {"client_order_id":"AAPL:s1:1700000000000","symbol":"AAPL","side":"buy",
                 "filled_qty":"3","filled_avg_price":"n/a","filled_at":"2023-11-14T22:13:21Z"},
                {"client_order_id":"","symbol":"AAPL","side":"sell","filled_qty":"1"},
                {"symbol":"MSFT","side":"buy"}
            ]"#,
        )
        .unwrap();
        let orders = parse_orders(raw).unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Some(OrderSide::Buy));
        assert_eq!(orders[0].filled_qty, dec!(3));
        assert!(orders[0].filled_avg_price.is_none());
        assert!(orders[0].filled_at.is_some());
    }
}
