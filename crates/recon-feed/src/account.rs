//! Account feed: order updates for positions opened by this engine.
//!
//! Frames are objects dispatched on their `stream` field:
//! `authorization`, `listening` and `trade_updates`. Every reconnect after
//! the first session runs reconciliation before any update is applied.

use std::sync::Arc;

use recon_position::{AssetBook, PositionError};
use recon_risk::ACCOUNT_LISTENER;
use recon_telemetry::Metrics;
use recon_ws::{BoxFuture, FeedHandler, HandshakeStep, WsError, WsResult};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use crate::order_update::parse_order_update;

const TRADE_UPDATES: &str = "trade_updates";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AccountFeedConfig {
    pub key_id: String,
    pub secret_key: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    stream: String,
    #[serde(default)]
    data: Value,
}

fn authorization_status(data: &Value) -> &str {
    data.get("status").and_then(Value::as_str).unwrap_or("")
}

fn engine_error(e: PositionError) -> WsError {
    match e {
        PositionError::Fatal(reason) => WsError::Fatal(reason),
        other => WsError::Protocol(other.to_string()),
    }
}

/// [`FeedHandler`] for the account stream.
pub struct AccountFeed {
    config: AccountFeedConfig,
    book: Arc<AssetBook>,
}

impl AccountFeed {
    pub fn new(config: AccountFeedConfig, book: Arc<AssetBook>) -> Self {
        Self { config, book }
    }

    async fn handle_trade_update(&self, data: &Value) -> WsResult<()> {
        let update = match parse_order_update(data) {
            Ok(Some(update)) => update,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Unreadable quantity in order update");
                return Err(e.into());
            }
            Err(e) => {
                Metrics::order_update_dropped("parse");
                return Err(e.into());
            }
        };

        Metrics::order_update(update.event.as_str());
        let outcome = self
            .book
            .apply_order_update(&update)
            .await
            .map_err(engine_error)?;
        debug!(
            client_order_id = %update.client_order_id,
            outcome = ?outcome,
            "Order update handled"
        );
        Ok(())
    }
}

impl FeedHandler for AccountFeed {
    fn name(&self) -> &str {
        "account"
    }

    fn breaker_slot(&self) -> &str {
        ACCOUNT_LISTENER
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
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.stream != "authorization" {
            debug!(stream = %envelope.stream, "Message before authorization");
            return Ok(HandshakeStep::Pending);
        }
        match authorization_status(&envelope.data) {
            "authorized" => Ok(HandshakeStep::Done),
            status => Err(WsError::Unauthorized(format!("status={status:?}"))),
        }
    }

    fn subscribe_request(&self) -> WsResult<Option<String>> {
        Ok(Some(
            json!({
                "action": "listen",
                "data": { "streams": [TRADE_UPDATES] },
            })
            .to_string(),
        ))
    }

    fn on_subscribe_message(&self, text: &str) -> WsResult<HandshakeStep> {
        let envelope: Envelope = serde_json::from_str(text)?;
        if envelope.stream != "listening" {
            return Ok(HandshakeStep::Pending);
        }
        let streams = envelope.data.get("streams").and_then(Value::as_array);
        let listening = streams
            .map(|s| s.iter().any(|v| v.as_str() == Some(TRADE_UPDATES)))
            .unwrap_or(false);
        if listening {
            Ok(HandshakeStep::Done)
        } else {
            Err(WsError::HandshakeFailed(format!(
                "{TRADE_UPDATES} not in listening streams: {}",
                envelope.data
            )))
        }
    }

    fn on_ready(&self, reconnect: bool) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move {
            if !reconnect {
                return Ok(());
            }
            info!("Account feed reconnected, reconciling pending positions");
            let report = self.book.reconcile().await.map_err(|e| match e {
                PositionError::Fatal(reason) => WsError::Fatal(reason),
                other => WsError::HandshakeFailed(format!("reconciliation failed: {other}")),
            })?;
            info!(symbols = report.symbols.len(), "Reconciliation finished");
            Ok(())
        })
    }

    fn on_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            let envelope: Envelope = serde_json::from_str(text)?;
            match envelope.stream.as_str() {
                TRADE_UPDATES => self.handle_trade_update(&envelope.data).await,
                "authorization" => {
                    let status = authorization_status(&envelope.data);
                    if status != "authorized" {
                        warn!(status, "Account feed authorization revoked");
                    }
                    Ok(())
                }
                "listening" => {
                    info!(data = %envelope.data, "Account feed listening");
                    Ok(())
                }
                other => {
                    debug!(stream = other, "Ignoring account stream message");
                    Ok(())
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_broker::MockBroker;
    use recon_persistence::PersistenceHandle;
    use recon_position::{EngineConfig, EngineContext};
    use recon_risk::{FatalReason, HaltLatch, NoNewPositions};

    fn feed() -> AccountFeed {
        let (persistence, _rx) = PersistenceHandle::channel();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(MockBroker::new()),
            Arc::new(NoNewPositions::with_default_slots()),
            persistence,
            Arc::new(HaltLatch::new()),
            EngineConfig::default(),
        ));
        let book = Arc::new(AssetBook::new(ctx));
        AccountFeed::new(AccountFeedConfig::default(), book)
    }

    #[test]
    fn test_authorization_handshake() {
        let feed = feed();
        let ok = r#"{"stream":"authorization","data":{"action":"authenticate","status":"authorized"}}"#;
        assert_eq!(feed.on_auth_message(ok).unwrap(), HandshakeStep::Done);

        let denied = r#"{"stream":"authorization","data":{"action":"authenticate","status":"unauthorized"}}"#;
        assert!(matches!(
            feed.on_auth_message(denied),
            Err(WsError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_listening_handshake() {
        let feed = feed();
        let ok = r#"{"stream":"listening","data":{"streams":["trade_updates"]}}"#;
        assert_eq!(feed.on_subscribe_message(ok).unwrap(), HandshakeStep::Done);
        let empty = r#"{"stream":"listening","data":{"streams":[]}}"#;
        assert!(feed.on_subscribe_message(empty).is_err());
    }

    #[tokio::test]
    async fn test_unparseable_update_is_recoverable() {
        let feed = feed();
        let msg = r#"{"stream":"trade_updates","data":{"event":"fill","order":{"client_order_id":"manual"}}}"#;
        let err = feed.on_message(msg).await.unwrap_err();
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_bad_quantity_is_fatal() {
        let feed = feed();
        let msg = r#"{"stream":"trade_updates","data":{"event":"fill","position_qty":"1O",
            "order":{"client_order_id":"AAPL:s:1704209400000","asset_class":"us_equity"}}}"#;
        let err = feed.on_message(msg).await.unwrap_err();
        assert!(matches!(
            err,
            WsError::Fatal(FatalReason::InvalidQuantity { ref field, .. }) if field == "position_qty"
        ));
    }

    #[tokio::test]
    async fn test_first_session_skips_reconciliation() {
        let feed = feed();
        assert!(feed.on_ready(false).await.is_ok());
        assert!(feed.on_ready(true).await.is_ok());
    }
}
