//! Market data feed: bars and trades for the subscribed symbols.
//!
//! Frames are JSON arrays of tagged messages:
//! - `{"T":"success","msg":"connected"|"authenticated"}`
//! - `{"T":"error","code":402,"msg":"auth failed"}`
//! - `{"T":"subscription","bars":[..],"trades":[..]}`
//! - `{"T":"b","S":"AAPL","o":..,"h":..,"l":..,"c":..,"t":"2024-01-02T15:30:00Z"}`
//! - `{"T":"t","S":"AAPL","p":..,"t":"2024-01-02T15:30:12.5Z"}`

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{decimal_from_json, Bar, MarketEvent, TradeTick};
use recon_risk::MARKET_LISTENER;
use recon_ws::{BoxFuture, FeedHandler, HandshakeStep, WsError, WsResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{FeedError, FeedResult};
use crate::pool::WorkerPool;

/// Credentials and subscription for the market feed.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MarketFeedConfig {
    pub key_id: String,
    pub secret_key: String,
    pub symbols: Vec<String>,
    /// Also subscribe to individual trades.
    pub trades: bool,
}

/// One decoded market data frame.
#[derive(Debug, Default)]
pub struct MarketFrame {
    pub events: Vec<MarketEvent>,
    /// Messages that were not bars or trades.
    pub control: Vec<ControlMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Success(String),
    Error { code: i64, msg: String },
    Subscription,
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(rename = "T")]
    kind: String,
    #[serde(rename = "S", default)]
    symbol: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    o: Option<Value>,
    #[serde(default)]
    h: Option<Value>,
    #[serde(default)]
    l: Option<Value>,
    #[serde(default)]
    c: Option<Value>,
    #[serde(default)]
    p: Option<Value>,
    #[serde(default)]
    t: Option<String>,
}

/// Decode one frame. Malformed bars or trades are skipped with a warning;
/// a frame that is not an array of tagged messages is an error.
pub fn parse_market_frame(text: &str, received_at: DateTime<Utc>) -> FeedResult<MarketFrame> {
    let raw: Vec<RawMessage> = serde_json::from_str(text)?;
    let mut frame = MarketFrame::default();

    for message in raw {
        match message.kind.as_str() {
            "b" => match parse_bar(&message, received_at) {
                Ok(bar) => frame.events.push(MarketEvent::Bar(bar)),
                Err(e) => warn!(error = %e, "Dropping malformed bar"),
            },
            "t" => match parse_trade(&message, received_at) {
                Ok(tick) => frame.events.push(MarketEvent::Trade(tick)),
                Err(e) => warn!(error = %e, "Dropping malformed trade"),
            },
            "success" => frame
                .control
                .push(ControlMessage::Success(message.msg.unwrap_or_default())),
            "error" => frame.control.push(ControlMessage::Error {
                code: message.code.unwrap_or_default(),
                msg: message.msg.unwrap_or_default(),
            }),
            "subscription" => frame.control.push(ControlMessage::Subscription),
            other => debug!(kind = other, "Ignoring market message"),
        }
    }
    Ok(frame)
}

fn parse_bar(message: &RawMessage, received_at: DateTime<Utc>) -> FeedResult<Bar> {
    Ok(Bar {
        symbol: symbol(message)?,
        open: price(message.o.as_ref(), "o")?,
        high: price(message.h.as_ref(), "h")?,
        low: price(message.l.as_ref(), "l")?,
        close: price(message.c.as_ref(), "c")?,
        bar_time: timestamp(message.t.as_deref())?,
        received_at,
    })
}

fn parse_trade(message: &RawMessage, received_at: DateTime<Utc>) -> FeedResult<TradeTick> {
    Ok(TradeTick {
        symbol: symbol(message)?,
        price: price(message.p.as_ref(), "p")?,
        trade_time: timestamp(message.t.as_deref())?,
        received_at,
    })
}

fn symbol(message: &RawMessage) -> FeedResult<String> {
    message
        .symbol
        .clone()
        .ok_or_else(|| FeedError::InvalidData(format!("{} message without symbol", message.kind)))
}

fn price(value: Option<&Value>, field: &str) -> FeedResult<rust_decimal::Decimal> {
    let value = value.ok_or_else(|| FeedError::InvalidData(format!("missing {field}")))?;
    decimal_from_json(field, value).map_err(|e| FeedError::InvalidData(e.to_string()))
}

fn timestamp(raw: Option<&str>) -> FeedResult<DateTime<Utc>> {
    let raw = raw.ok_or_else(|| FeedError::InvalidData("missing t".to_string()))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| FeedError::InvalidData(format!("t={raw:?}: {e}")))
}

/// [`FeedHandler`] for the market data stream.
pub struct MarketFeed {
    config: MarketFeedConfig,
    pool: Arc<WorkerPool>,
}

impl MarketFeed {
    pub fn new(config: MarketFeedConfig, pool: Arc<WorkerPool>) -> Self {
        Self { config, pool }
    }

    pub fn symbols(&self) -> &[String] {
        &self.config.symbols
    }
}

impl FeedHandler for MarketFeed {
    fn name(&self) -> &str {
        "market"
    }

    fn breaker_slot(&self) -> &str {
        MARKET_LISTENER
    }

    fn auth_request(&self) -> WsResult<Option<String>> {
        Ok(Some(
            json!({
                "action": "auth",
                "key": self.config.key_id,
                "secret": self.config.secret_key,
            })
            .to_string(),
        ))
    }

    fn on_auth_message(&self, text: &str) -> WsResult<HandshakeStep> {
        let frame = parse_market_frame(text, Utc::now())?;
        for control in frame.control {
            match control {
                ControlMessage::Success(msg) if msg == "authenticated" => {
                    return Ok(HandshakeStep::Done)
                }
                ControlMessage::Success(msg) => debug!(msg = %msg, "Market feed handshake message"),
                ControlMessage::Error { code, msg } => {
                    return Err(WsError::Unauthorized(format!("{code}: {msg}")))
                }
                ControlMessage::Subscription => {}
            }
        }
        Ok(HandshakeStep::Pending)
    }

    fn subscribe_request(&self) -> WsResult<Option<String>> {
        let trades: &[String] = if self.config.trades {
            &self.config.symbols
        } else {
            &[]
        };
        Ok(Some(
            json!({
                "action": "subscribe",
                "bars": self.config.symbols,
                "trades": trades,
            })
            .to_string(),
        ))
    }

    fn on_subscribe_message(&self, text: &str) -> WsResult<HandshakeStep> {
        let frame = parse_market_frame(text, Utc::now())?;
        for control in frame.control {
            match control {
                ControlMessage::Subscription => return Ok(HandshakeStep::Done),
                ControlMessage::Error { code, msg } => {
                    return Err(WsError::HandshakeFailed(format!(
                        "subscription rejected: {code}: {msg}"
                    )))
                }
                ControlMessage::Success(_) => {}
            }
        }
        Ok(HandshakeStep::Pending)
    }

    fn on_ready(&self, reconnect: bool) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move {
            info!(
                symbols = self.config.symbols.len(),
                reconnect, "Market feed subscribed"
            );
            Ok(())
        })
    }

    fn on_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            let frame = parse_market_frame(text, Utc::now())?;
            for control in frame.control {
                if let ControlMessage::Error { code, msg } = control {
                    warn!(code, msg = %msg, "Market feed error message");
                }
            }
            for event in frame.events {
                self.pool.dispatch(event).await?;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn received() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 15, 31, 1).unwrap()
    }

    #[test]
    fn test_parse_bar_and_trade() {
        let text = r#"[
            {"T":"b","S":"AAPL","o":187.1,"h":187.5,"l":186.9,"c":187.25,"v":1200,"t":"2024-01-02T15:30:00Z"},
            {"T":"t","S":"BTC/USD","p":"42000.5","s":0.01,"t":"2024-01-02T15:31:00.250Z"}
        ]"#;
        let frame = parse_market_frame(text, received()).unwrap();
        assert_eq!(frame.events.len(), 2);

        match &frame.events[0] {
            MarketEvent::Bar(bar) => {
                assert_eq!(bar.symbol, "AAPL");
                assert_eq!(bar.open, dec!(187.1));
                assert_eq!(bar.close, dec!(187.25));
                assert_eq!(
                    bar.bar_time,
                    Utc.with_ymd_and_hms(2024, 1, 2, 15, 30, 0).unwrap()
                );
                assert_eq!(bar.received_at, received());
            }
            other => panic!("expected bar, got {other:?}"),
        }
        match &frame.events[1] {
            MarketEvent::Trade(tick) => {
                assert_eq!(tick.symbol, "BTC/USD");
                assert_eq!(tick.price, dec!(42000.5));
            }
            other => panic!("expected trade, got {other:?}"),
        }
    }

    #[test]
    fn test_malformed_bar_is_skipped() {
        let text = r#"[
            {"T":"b","S":"AAPL","o":"x","h":1,"l":1,"c":1,"t":"2024-01-02T15:30:00Z"},
            {"T":"b","S":"MSFT","o":1,"h":1,"l":1,"c":1,"t":"not a time"},
            {"T":"t","S":"AAPL","p":10,"t":"2024-01-02T15:30:00Z"}
        ]"#;
        let frame = parse_market_frame(text, received()).unwrap();
        assert_eq!(frame.events.len(), 1);
        assert!(matches!(frame.events[0], MarketEvent::Trade(_)));
    }

    #[test]
    fn test_control_messages() {
        let frame = parse_market_frame(
            r#"[{"T":"success","msg":"connected"},{"T":"error","code":402,"msg":"auth failed"}]"#,
            received(),
        )
        .unwrap();
        assert_eq!(
            frame.control,
            vec![
                ControlMessage::Success("connected".into()),
                ControlMessage::Error {
                    code: 402,
                    msg: "auth failed".into()
                }
            ]
        );
        assert!(parse_market_frame(r#"{"T":"b"}"#, received()).is_err());
    }
}
