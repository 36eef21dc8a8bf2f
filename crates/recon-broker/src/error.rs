//! Broker error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Response decode error: {0}")]
    Decode(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid quantity for {symbol}: {value:?}")]
    InvalidQuantity { symbol: String, value: String },

    #[error("Unsupported side for {symbol}: {side}")]
    UnsupportedSide { symbol: String, side: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BrokerError {
    /// Transport failures, throttling and server errors are worth retrying.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpClient(_) => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classes() {
        assert!(BrokerError::HttpClient("timeout".into()).is_retryable());
        assert!(BrokerError::Status { status: 503, body: String::new() }.is_retryable());
        assert!(BrokerError::Status { status: 429, body: String::new() }.is_retryable());
        assert!(!BrokerError::Status { status: 422, body: String::new() }.is_retryable());
        assert!(!BrokerError::Decode("bad".into()).is_retryable());
    }
}
