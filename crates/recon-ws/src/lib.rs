//! WebSocket lifecycle shared by the market and account feeds.
//!
//! Provides:
//! - Connect, authenticate and subscribe with per-stage deadlines
//! - Keepalive pings with a forced close on a missed deadline
//! - Reconnection with capped exponential backoff and a retry budget
//! - Circuit breaker slot held for as long as the feed is not listening
//!
//! Feed protocols plug in through [`FeedHandler`].

pub mod connection;
pub mod error;
pub mod handler;
pub mod heartbeat;

pub use connection::{ConnectionConfig, ConnectionManager, ConnectionState};
pub use error::{WsError, WsResult};
pub use handler::{BoxFuture, FeedHandler, HandshakeStep};
pub use heartbeat::{HeartbeatManager, HeartbeatStats};

use std::sync::Once;

static INIT_CRYPTO: Once = Once::new();

/// Initialize the TLS crypto provider.
/// Must be called before any WebSocket connections are made.
pub fn init_crypto() {
    INIT_CRYPTO.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
