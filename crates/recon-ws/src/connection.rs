//! Connection lifecycle shared by the streaming feeds.
//!
//! `Disconnected -> Connecting -> Authenticating -> Subscribing -> Listening`,
//! back to `Disconnected` on error, then reconnect with capped exponential
//! backoff. A failure before the first session ever reaches `Listening` is
//! fatal, as is exhausting the retry budget. A normal close from the peer
//! ends the lifecycle.

use crate::error::{WsError, WsResult};
use crate::handler::{FeedHandler, HandshakeStep};
use crate::heartbeat::{run_keepalive, HeartbeatManager};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use recon_core::Backoff;
use recon_risk::NoNewPositions;
use recon_telemetry::Metrics;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    connect_async_tls_with_config, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL.
    pub url: String,
    /// Consecutive reconnect attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
    /// Base delay for exponential backoff.
    pub reconnect_base_delay_ms: u64,
    /// Maximum delay for exponential backoff.
    pub reconnect_max_delay_ms: u64,
    /// Keepalive ping interval.
    pub heartbeat_interval_ms: u64,
    /// A ping must be acknowledged within this.
    pub heartbeat_timeout_ms: u64,
    /// Deadline for connect, and for each handshake acknowledgement.
    pub handshake_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            max_reconnect_attempts: 10,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
            heartbeat_interval_ms: 30000,
            heartbeat_timeout_ms: 10000,
            handshake_timeout_ms: 10000,
        }
    }
}

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Listening,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Subscribing => "subscribing",
            Self::Listening => "listening",
        }
    }
}

/// How one session ended.
struct SessionReport {
    /// The session reached `Listening` and its ready hook succeeded.
    established: bool,
    result: WsResult<()>,
}

/// Runs one feed's connection lifecycle.
pub struct ConnectionManager<H: FeedHandler> {
    config: ConnectionConfig,
    handler: Arc<H>,
    breaker: Arc<NoNewPositions>,
    state: RwLock<ConnectionState>,
    heartbeat: Arc<HeartbeatManager>,
    reconnect_count: AtomicU32,
    shutdown_token: CancellationToken,
}

impl<H: FeedHandler> ConnectionManager<H> {
    /// Create a manager. Cancelling `shutdown_token` stops the lifecycle.
    pub fn new(
        config: ConnectionConfig,
        handler: Arc<H>,
        breaker: Arc<NoNewPositions>,
        shutdown_token: CancellationToken,
    ) -> Self {
        let heartbeat = Arc::new(HeartbeatManager::new(
            config.heartbeat_interval_ms,
            config.heartbeat_timeout_ms,
        ));
        Self {
            config,
            handler,
            breaker,
            state: RwLock::new(ConnectionState::Disconnected),
            heartbeat,
            reconnect_count: AtomicU32::new(0),
            shutdown_token,
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Consecutive failed attempts since the last established session.
    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Signal graceful shutdown.
    pub fn shutdown(&self) {
        info!(feed = self.handler.name(), "Connection shutdown requested");
        self.shutdown_token.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
        Metrics::feed_state_set(self.handler.name(), state.as_str());
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            self.config.reconnect_base_delay_ms,
            self.config.reconnect_max_delay_ms,
        )
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handshake_timeout_ms)
    }

    fn block_new_positions(&self) {
        if let Err(e) = self.breaker.set(self.handler.breaker_slot()) {
            warn!(feed = self.handler.name(), ?e, "Breaker slot unavailable");
        }
        Metrics::no_new_positions_set(self.breaker.is_blocked());
    }

    fn allow_new_positions(&self) {
        if let Err(e) = self.breaker.clear(self.handler.breaker_slot()) {
            warn!(feed = self.handler.name(), ?e, "Breaker slot unavailable");
        }
        Metrics::no_new_positions_set(self.breaker.is_blocked());
    }

    /// Run until shutdown, a normal close from the peer, or a fatal error.
    ///
    /// Returns `Ok` on shutdown or normal close. Returns
    /// [`WsError::StartupFailed`], [`WsError::RetriesExhausted`] or
    /// [`WsError::Fatal`] when the process must liquidate and stop.
    pub async fn run(&self) -> WsResult<()> {
        let feed = self.handler.name().to_string();
        // Nothing may open until this feed is listening.
        self.block_new_positions();

        let backoff = self.backoff();
        let mut established = false;
        let mut attempt = 0u32;

        loop {
            if self.is_shutdown() {
                info!(feed = %feed, "Shutdown requested, exiting connect loop");
                self.set_state(ConnectionState::Disconnected);
                return Ok(());
            }

            let report = self.run_session(established).await;
            if report.established {
                established = true;
                attempt = 0;
                self.reconnect_count.store(0, Ordering::SeqCst);
            }
            self.set_state(ConnectionState::Disconnected);
            self.block_new_positions();

            if self.is_shutdown() {
                info!(feed = %feed, "Shutdown requested after disconnect, not reconnecting");
                return Ok(());
            }

            let err = match report.result {
                Ok(()) => {
                    info!(feed = %feed, "Feed closed normally by peer, lifecycle finished");
                    return Ok(());
                }
                Err(e) => e,
            };

            if matches!(err, WsError::Fatal(_)) {
                error!(feed = %feed, error = %err, "Fatal error on feed");
                return Err(err);
            }

            if !established {
                error!(feed = %feed, error = %err, "Feed failed before first session");
                return Err(WsError::StartupFailed {
                    feed,
                    reason: err.to_string(),
                });
            }

            attempt += 1;
            self.reconnect_count.store(attempt, Ordering::SeqCst);
            if self.config.max_reconnect_attempts > 0 && attempt > self.config.max_reconnect_attempts
            {
                error!(feed = %feed, attempts = attempt - 1, "Max reconnection attempts reached");
                return Err(WsError::RetriesExhausted {
                    feed,
                    attempts: attempt - 1,
                });
            }

            Metrics::feed_reconnect(&feed, reconnect_reason(&err));
            let delay = backoff.delay(attempt);
            warn!(
                feed = %feed,
                error = %err,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Reconnecting"
            );

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = self.shutdown_token.cancelled() => {
                    info!(feed = %feed, "Shutdown requested during backoff, exiting");
                    return Ok(());
                }
            }
        }
    }

    async fn run_session(&self, reconnect: bool) -> SessionReport {
        let (mut write, mut read) = match self.open_session().await {
            Ok(halves) => halves,
            Err(e) => {
                return SessionReport {
                    established: false,
                    result: Err(e),
                }
            }
        };

        self.set_state(ConnectionState::Listening);
        if let Err(e) = self.handler.on_ready(reconnect).await {
            warn!(feed = self.handler.name(), error = %e, "Feed ready hook failed");
            if let Err(close_err) = write.send(Message::Close(None)).await {
                debug!(?close_err, "Close frame not sent");
            }
            return SessionReport {
                established: false,
                result: Err(e),
            };
        }
        self.allow_new_positions();
        info!(feed = self.handler.name(), reconnect, "Feed listening");

        self.heartbeat.reset();
        let session = self.shutdown_token.child_token();
        let (ping_tx, mut ping_rx) = mpsc::channel(1);
        let keepalive = tokio::spawn(run_keepalive(
            self.handler.name().to_string(),
            self.heartbeat.clone(),
            session.clone(),
            ping_tx,
        ));

        let result = self
            .listen(&mut write, &mut read, &session, &mut ping_rx)
            .await;

        session.cancel();
        if let Err(e) = keepalive.await {
            warn!(?e, "Keepalive task failed");
        }

        SessionReport {
            established: true,
            result,
        }
    }

    /// Connect, authenticate and subscribe.
    async fn open_session(&self) -> WsResult<(WsSink, WsSource)> {
        self.set_state(ConnectionState::Connecting);
        info!(feed = self.handler.name(), url = %self.config.url, "Connecting to WebSocket");

        // TCP_NODELAY for lower latency.
        let connect = connect_async_tls_with_config(self.config.url.as_str(), None, true, None);
        let (ws_stream, _response) = tokio::select! {
            res = tokio::time::timeout(self.handshake_timeout(), connect) => {
                res.map_err(|_| WsError::HandshakeTimeout("connect"))?
                    .map_err(|e| WsError::ConnectionFailed(e.to_string()))?
            }
            () = self.shutdown_token.cancelled() => return Err(WsError::Cancelled),
        };
        let (mut write, mut read) = ws_stream.split();

        self.set_state(ConnectionState::Authenticating);
        if let Some(frame) = self.handler.auth_request()? {
            write.send(Message::Text(frame)).await?;
            self.await_ack(&mut write, &mut read, "authentication", |text| {
                self.handler.on_auth_message(text)
            })
            .await?;
        }

        self.set_state(ConnectionState::Subscribing);
        if let Some(frame) = self.handler.subscribe_request()? {
            write.send(Message::Text(frame)).await?;
            self.await_ack(&mut write, &mut read, "subscription", |text| {
                self.handler.on_subscribe_message(text)
            })
            .await?;
        }

        Ok((write, read))
    }

    /// Read until `inspect` reports the stage acknowledged.
    async fn await_ack<F>(
        &self,
        write: &mut WsSink,
        read: &mut WsSource,
        stage: &'static str,
        mut inspect: F,
    ) -> WsResult<()>
    where
        F: FnMut(&str) -> WsResult<HandshakeStep>,
    {
        let deadline = tokio::time::sleep(self.handshake_timeout());
        tokio::pin!(deadline);

        loop {
            let msg = tokio::select! {
                () = self.shutdown_token.cancelled() => return Err(WsError::Cancelled),
                () = &mut deadline => return Err(WsError::HandshakeTimeout(stage)),
                msg = read.next() => msg,
            };

            let text = match msg {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Binary(bytes))) => String::from_utf8(bytes)
                    .map_err(|e| WsError::HandshakeFailed(format!("non-UTF-8 {stage} frame: {e}")))?,
                Some(Ok(Message::Ping(data))) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = close_details(frame);
                    warn!(code, %reason, stage, "WebSocket closed during handshake");
                    return Err(WsError::ConnectionClosed { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(WsError::ConnectionClosed {
                        code: 1006,
                        reason: format!("Stream ended during {stage}"),
                    })
                }
            };

            if inspect(&text)? == HandshakeStep::Done {
                debug!(feed = self.handler.name(), stage, "Handshake stage acknowledged");
                return Ok(());
            }
        }
    }

    async fn listen(
        &self,
        write: &mut WsSink,
        read: &mut WsSource,
        session: &CancellationToken,
        ping_rx: &mut mpsc::Receiver<()>,
    ) -> WsResult<()> {
        loop {
            tokio::select! {
                biased;

                () = session.cancelled() => {
                    if let Err(e) = write.send(Message::Close(None)).await {
                        debug!(?e, "Close frame not sent");
                    }
                    if self.is_shutdown() {
                        info!(feed = self.handler.name(), "Shutdown signal received in listen loop");
                        return Ok(());
                    }
                    return Err(WsError::HeartbeatTimeout);
                }

                Some(()) = ping_rx.recv() => {
                    write.send(Message::Ping(Vec::new())).await?;
                    self.heartbeat.record_ping();
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.heartbeat.record_message();
                        self.dispatch(&text).await?;
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        self.heartbeat.record_message();
                        match String::from_utf8(bytes) {
                            Ok(text) => self.dispatch(&text).await?,
                            Err(e) => warn!(feed = self.handler.name(), ?e, "Dropping non-UTF-8 frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        self.heartbeat.record_message();
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Pong(_))) => {
                        self.heartbeat.record_pong();
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = close_details(frame);
                        if code == u16::from(CloseCode::Normal) {
                            info!(feed = self.handler.name(), %reason, "WebSocket closed normally by server");
                            return Ok(());
                        }
                        warn!(feed = self.handler.name(), code, %reason, "WebSocket closed by server");
                        return Err(WsError::ConnectionClosed { code, reason });
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => {
                        error!(feed = self.handler.name(), ?e, "WebSocket read error");
                        return Err(e.into());
                    }
                    None => {
                        warn!(feed = self.handler.name(), "WebSocket stream ended");
                        return Err(WsError::ConnectionClosed {
                            code: 1006,
                            reason: "Stream ended".to_string(),
                        });
                    }
                },
            }
        }
    }

    async fn dispatch(&self, text: &str) -> WsResult<()> {
        match self.handler.on_message(text).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_recoverable() => {
                warn!(feed = self.handler.name(), error = %e, "Dropping message");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

fn close_details(frame: Option<CloseFrame<'_>>) -> (u16, String) {
    frame
        .map(|f| (u16::from(f.code), f.reason.to_string()))
        .unwrap_or((1005, "No status".to_string()))
}

fn reconnect_reason(err: &WsError) -> &'static str {
    match err {
        WsError::HeartbeatTimeout => "heartbeat_timeout",
        WsError::ConnectionClosed { .. } => "closed",
        WsError::HandshakeFailed(_) | WsError::HandshakeTimeout(_) | WsError::Unauthorized(_) => {
            "handshake"
        }
        _ => "error",
    }
}
