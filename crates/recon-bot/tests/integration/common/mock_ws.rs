//! Mock WebSocket server for integration tests.
//!
//! Speaks just enough of either streaming protocol to get a feed listening:
//! - market: `connected` greeting, `authenticated`, `subscription`
//! - account: `authorization`, `listening`
//!
//! Frames pushed with [`MockWsServer::push`] go to every open connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Market,
    Account,
}

/// A mock WebSocket server for testing.
pub struct MockWsServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    push_tx: broadcast::Sender<String>,
    messages: Arc<Mutex<Vec<String>>>,
    listening: Arc<Mutex<u32>>,
}

impl MockWsServer {
    /// Start a mock server on a random port.
    pub async fn start(protocol: Protocol) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (push_tx, _) = broadcast::channel::<String>(64);
        let messages = Arc::new(Mutex::new(Vec::new()));
        let listening = Arc::new(Mutex::new(0));

        let push = push_tx.clone();
        let msgs = messages.clone();
        let ready = listening.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Ok((stream, _)) = listener.accept() => {
                        tokio::spawn(handle_connection(
                            stream,
                            protocol,
                            push.subscribe(),
                            msgs.clone(),
                            ready.clone(),
                        ));
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });

        Self {
            addr,
            shutdown_tx,
            push_tx,
            messages,
            listening,
        }
    }

    /// Get the server's WebSocket URL.
    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// Send `frame` to every connection that finished its handshake.
    pub fn push(&self, frame: impl Into<String>) {
        let _ = self.push_tx.send(frame.into());
    }

    /// Wait until `count` sessions have been acknowledged as listening.
    pub async fn wait_listening(&self, count: u32) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while *self.listening.lock().await < count {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("feed never started listening");
        // Let the client finish its ready hook.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// All text frames received from clients.
    pub async fn received_messages(&self) -> Vec<String> {
        self.messages.lock().await.clone()
    }

    /// Shutdown the server.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

fn reply(protocol: Protocol, request: &Value) -> Option<(Value, bool)> {
    let action = request.get("action")?.as_str()?;
    match (protocol, action) {
        (Protocol::Market, "auth") => Some((json!([{"T": "success", "msg": "authenticated"}]), false)),
        (Protocol::Market, "subscribe") => Some((
            json!([{
                "T": "subscription",
                "bars": request.get("bars").cloned().unwrap_or(Value::Null),
                "trades": request.get("trades").cloned().unwrap_or(Value::Null),
            }]),
            true,
        )),
        (Protocol::Account, "auth") => Some((
            json!({"stream": "authorization", "data": {"action": "authenticate", "status": "authorized"}}),
            false,
        )),
        (Protocol::Account, "listen") => Some((
            json!({"stream": "listening", "data": {"streams": ["trade_updates"]}}),
            true,
        )),
        _ => None,
    }
}

async fn handle_connection(
    stream: TcpStream,
    protocol: Protocol,
    mut pushes: broadcast::Receiver<String>,
    messages: Arc<Mutex<Vec<String>>>,
    listening: Arc<Mutex<u32>>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            eprintln!("WebSocket handshake failed: {}", e);
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    if protocol == Protocol::Market {
        let hello = json!([{"T": "success", "msg": "connected"}]);
        let _ = write.send(Message::Text(hello.to_string())).await;
    }

    loop {
        tokio::select! {
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    messages.lock().await.push(text.clone());
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    if let Some((response, ready)) = reply(protocol, &request) {
                        let _ = write.send(Message::Text(response.to_string())).await;
                        if ready {
                            *listening.lock().await += 1;
                        }
                    }
                }
                Some(Ok(Message::Ping(data))) => {
                    let _ = write.send(Message::Pong(data)).await;
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                _ => {}
            },
            pushed = pushes.recv() => match pushed {
                Ok(frame) => {
                    let _ = write.send(Message::Text(frame)).await;
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_server_starts() {
        let server = MockWsServer::start(Protocol::Market).await;
        assert!(server.url().starts_with("ws://127.0.0.1:"));
        server.shutdown().await;
    }
}
