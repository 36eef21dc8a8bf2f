//! Connection lifecycle against a local WebSocket server.
//!
//! Each accepted connection runs the same two-step handshake
//! (`auth` -> `authed`, `subscribe` -> `subscribed`) and then one scripted
//! behavior. The listener closes once the script is used up, so later
//! reconnects are refused.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use recon_risk::{NoNewPositions, MARKET_LISTENER};
use recon_ws::{
    BoxFuture, ConnectionConfig, ConnectionManager, FeedHandler, HandshakeStep, WsError, WsResult,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Send one data message, then keep reading until the client closes.
    Hold,
    /// Drop the socket without a close frame.
    Drop,
    /// Send a normal close frame.
    CloseNormal,
    /// Stop reading, so pings go unanswered.
    Silent,
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Ready(bool),
    Message(String),
}

struct TestHandler {
    events: mpsc::UnboundedSender<Event>,
}

impl FeedHandler for TestHandler {
    fn name(&self) -> &str {
        "test"
    }

    fn breaker_slot(&self) -> &str {
        MARKET_LISTENER
    }

    fn auth_request(&self) -> WsResult<Option<String>> {
        Ok(Some("auth".to_string()))
    }

    fn on_auth_message(&self, text: &str) -> WsResult<HandshakeStep> {
        match text {
            "authed" => Ok(HandshakeStep::Done),
            "denied" => Err(WsError::Unauthorized("denied".to_string())),
            _ => Ok(HandshakeStep::Pending),
        }
    }

    fn subscribe_request(&self) -> WsResult<Option<String>> {
        Ok(Some("subscribe".to_string()))
    }

    fn on_subscribe_message(&self, text: &str) -> WsResult<HandshakeStep> {
        Ok(if text == "subscribed" {
            HandshakeStep::Done
        } else {
            HandshakeStep::Pending
        })
    }

    fn on_ready(&self, reconnect: bool) -> BoxFuture<'_, WsResult<()>> {
        Box::pin(async move {
            let _ = self.events.send(Event::Ready(reconnect));
            Ok(())
        })
    }

    fn on_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, WsResult<()>> {
        Box::pin(async move {
            if text == "garbage" {
                return Err(WsError::ParseError("garbage".to_string()));
            }
            let _ = self.events.send(Event::Message(text.to_string()));
            Ok(())
        })
    }
}

async fn serve(stream: TcpStream, behavior: Behavior) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    for (expect, reply) in [("auth", "authed"), ("subscribe", "subscribed")] {
        match ws.next().await {
            Some(Ok(Message::Text(text))) if text == expect => {
                ws.send(Message::Text(reply.into())).await.unwrap();
            }
            _ => return,
        }
    }

    match behavior {
        Behavior::Hold => {
            ws.send(Message::Text("garbage".into())).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        }
        Behavior::Drop => drop(ws),
        Behavior::CloseNormal => {
            let frame = CloseFrame {
                code: CloseCode::Normal,
                reason: "bye".into(),
            };
            let _ = ws.send(Message::Close(Some(frame))).await;
            let _ = ws.next().await;
        }
        Behavior::Silent => {
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(ws);
        }
    }
}

async fn spawn_server(script: Vec<Behavior>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        for behavior in script {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve(stream, behavior));
        }
    });
    format!("ws://{addr}")
}

fn config(url: String) -> ConnectionConfig {
    ConnectionConfig {
        url,
        max_reconnect_attempts: 3,
        reconnect_base_delay_ms: 10,
        reconnect_max_delay_ms: 50,
        heartbeat_interval_ms: 60_000,
        heartbeat_timeout_ms: 60_000,
        handshake_timeout_ms: 2_000,
    }
}

fn manager(
    config: ConnectionConfig,
) -> (
    Arc<ConnectionManager<TestHandler>>,
    Arc<NoNewPositions>,
    mpsc::UnboundedReceiver<Event>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let breaker = Arc::new(NoNewPositions::with_default_slots());
    let mgr = Arc::new(ConnectionManager::new(
        config,
        Arc::new(TestHandler { events: tx }),
        breaker.clone(),
        CancellationToken::new(),
    ));
    (mgr, breaker, rx)
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event in time")
        .expect("handler alive")
}

#[tokio::test]
async fn test_first_connect_failure_is_startup_fatal() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (mgr, breaker, _rx) = manager(config(format!("ws://{addr}")));
    let err = mgr.run().await.unwrap_err();

    assert!(matches!(err, WsError::StartupFailed { ref feed, .. } if feed == "test"));
    assert!(err.fatal_reason().is_some());
    assert!(breaker.is_blocked());
}

#[tokio::test]
async fn test_reconnects_and_clears_breaker_once_listening() {
    let url = spawn_server(vec![Behavior::Drop, Behavior::Hold]).await;
    let (mgr, breaker, mut rx) = manager(config(url));
    let runner = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run().await }
    });

    assert_eq!(next_event(&mut rx).await, Event::Ready(false));
    assert_eq!(next_event(&mut rx).await, Event::Ready(true));
    // The unparseable frame is dropped, the session stays up.
    assert_eq!(next_event(&mut rx).await, Event::Message("hello".to_string()));
    assert!(!breaker.is_blocked());
    assert_eq!(mgr.reconnect_count(), 0);

    mgr.shutdown();
    runner.await.unwrap().unwrap();
    assert_eq!(breaker.blocked_by(), vec![MARKET_LISTENER.to_string()]);
}

#[tokio::test]
async fn test_retries_exhausted_after_budget() {
    let url = spawn_server(vec![Behavior::Drop]).await;
    let mut cfg = config(url);
    cfg.max_reconnect_attempts = 2;
    let (mgr, breaker, mut rx) = manager(cfg);

    let result = tokio::time::timeout(Duration::from_secs(5), mgr.run())
        .await
        .unwrap();

    assert_eq!(next_event(&mut rx).await, Event::Ready(false));
    match result {
        Err(WsError::RetriesExhausted { feed, attempts }) => {
            assert_eq!(feed, "test");
            assert_eq!(attempts, 2);
        }
        other => panic!("expected RetriesExhausted, got {other:?}"),
    }
    assert!(breaker.is_blocked());
}

#[tokio::test]
async fn test_normal_close_ends_lifecycle() {
    let url = spawn_server(vec![Behavior::CloseNormal]).await;
    let (mgr, breaker, mut rx) = manager(config(url));

    let result = tokio::time::timeout(Duration::from_secs(5), mgr.run())
        .await
        .unwrap();

    assert!(result.is_ok());
    assert_eq!(next_event(&mut rx).await, Event::Ready(false));
    assert!(breaker.is_blocked());
}

#[tokio::test]
async fn test_missed_keepalive_forces_reconnect() {
    let url = spawn_server(vec![Behavior::Silent, Behavior::Hold]).await;
    let mut cfg = config(url);
    cfg.heartbeat_interval_ms = 20;
    cfg.heartbeat_timeout_ms = 40;
    let (mgr, _breaker, mut rx) = manager(cfg);
    let runner = tokio::spawn({
        let mgr = mgr.clone();
        async move { mgr.run().await }
    });

    assert_eq!(next_event(&mut rx).await, Event::Ready(false));
    assert_eq!(next_event(&mut rx).await, Event::Ready(true));

    mgr.shutdown();
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_before_start_returns_ok() {
    let (mgr, _breaker, _rx) = manager(config("ws://127.0.0.1:9".to_string()));
    mgr.shutdown();
    assert!(mgr.run().await.is_ok());
}
