//! WebSocket error types.

use recon_risk::FatalReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WsError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: code={code}, reason={reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Handshake timed out during {0}")]
    HandshakeTimeout(&'static str),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Heartbeat timeout")]
    HeartbeatTimeout,

    #[error("Message parse error: {0}")]
    ParseError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("{feed} failed at startup: {reason}")]
    StartupFailed { feed: String, reason: String },

    #[error("{feed} reconnect retries exhausted after {attempts} attempts")]
    RetriesExhausted { feed: String, attempts: u32 },

    #[error("Fatal: {0}")]
    Fatal(FatalReason),

    #[error("Tungstenite error: {0}")]
    Tungstenite(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WsError {
    /// Per-message problems: log, drop the message, keep listening.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ParseError(_) | Self::Protocol(_) | Self::Json(_))
    }

    /// Reason to hand the halt latch, for errors that end the process.
    #[must_use]
    pub fn fatal_reason(&self) -> Option<FatalReason> {
        match self {
            Self::Fatal(reason) => Some(reason.clone()),
            Self::StartupFailed { feed, reason } => Some(FatalReason::StartupFailed {
                feed: feed.clone(),
                reason: reason.clone(),
            }),
            Self::RetriesExhausted { feed, attempts } => Some(FatalReason::RetriesExhausted {
                feed: feed.clone(),
                attempts: *attempts,
            }),
            _ => None,
        }
    }
}

pub type WsResult<T> = Result<T, WsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(WsError::ParseError("x".into()).is_recoverable());
        assert!(WsError::Protocol("x".into()).is_recoverable());
        assert!(!WsError::HeartbeatTimeout.is_recoverable());
        assert!(!WsError::Unauthorized("x".into()).is_recoverable());

        let exhausted = WsError::RetriesExhausted {
            feed: "market".into(),
            attempts: 3,
        };
        assert_eq!(
            exhausted.fatal_reason(),
            Some(FatalReason::RetriesExhausted {
                feed: "market".into(),
                attempts: 3
            })
        );
        assert!(WsError::HeartbeatTimeout.fatal_reason().is_none());
    }
}
