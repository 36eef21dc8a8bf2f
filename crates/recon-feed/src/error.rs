//! Feed error types.

use recon_risk::FatalReason;
use recon_ws::WsError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Invalid quantity in {field}: {value:?}")]
    InvalidQuantity { field: String, value: String },

    #[error("Worker pool closed")]
    PoolClosed,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FeedError {
    /// A malformed quantity cannot be skipped without losing track of the
    /// broker's position.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidQuantity { .. })
    }
}

impl From<FeedError> for WsError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::InvalidQuantity { field, value } => {
                WsError::Fatal(FatalReason::InvalidQuantity { field, value })
            }
            FeedError::PoolClosed => WsError::Cancelled,
            FeedError::Json(e) => WsError::Json(e),
            other => WsError::ParseError(other.to_string()),
        }
    }
}

pub type FeedResult<T> = Result<T, FeedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantity_errors_are_fatal() {
        let err = FeedError::InvalidQuantity {
            field: "position_qty".into(),
            value: "abc".into(),
        };
        assert!(err.is_fatal());
        let ws: WsError = err.into();
        assert!(matches!(
            ws,
            WsError::Fatal(FatalReason::InvalidQuantity { ref field, .. }) if field == "position_qty"
        ));
    }

    #[test]
    fn test_parse_errors_are_recoverable() {
        let ws: WsError = FeedError::ParseError("missing event".into()).into();
        assert!(ws.is_recoverable());
        let ws: WsError = FeedError::InvalidData("bad price".into()).into();
        assert!(ws.is_recoverable());
    }
}
