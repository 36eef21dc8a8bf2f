//! Feed-specific protocol plugged into the shared connection lifecycle.

use std::future::Future;
use std::pin::Pin;

use crate::error::WsResult;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Outcome of inspecting one message during a handshake stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStep {
    /// Not the acknowledgement yet; keep reading.
    Pending,
    /// Stage acknowledged.
    Done,
}

/// Protocol of one streaming feed.
///
/// The connection manager owns the socket and calls into the handler at
/// each lifecycle stage. Errors from `on_message` that are
/// [`recoverable`](crate::WsError::is_recoverable) drop the message;
/// anything else ends the session.
pub trait FeedHandler: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Circuit breaker slot held while this feed is down.
    fn breaker_slot(&self) -> &str;

    /// Authentication frame, if the feed needs one.
    fn auth_request(&self) -> WsResult<Option<String>>;

    /// Inspect a message received while authenticating.
    fn on_auth_message(&self, text: &str) -> WsResult<HandshakeStep>;

    /// Subscription frame, if the feed needs one.
    fn subscribe_request(&self) -> WsResult<Option<String>>;

    /// Inspect a message received while subscribing.
    fn on_subscribe_message(&self, text: &str) -> WsResult<HandshakeStep>;

    /// Called once the session is listening, before the first message is
    /// dispatched. `reconnect` is false only for the first session.
    fn on_ready(&self, reconnect: bool) -> BoxFuture<'_, WsResult<()>>;

    /// Handle one inbound data message.
    fn on_message<'a>(&'a self, text: &'a str) -> BoxFuture<'a, WsResult<()>>;
}
