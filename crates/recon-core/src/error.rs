//! Error types for recon-core.

use thiserror::Error;

/// Core error types.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid decimal in field {field}: {value:?} ({reason})")]
    InvalidDecimal {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Unknown asset class: {0}")]
    UnknownAssetClass(String),

    #[error("Invalid timestamp in field {field}: {value:?}")]
    InvalidTimestamp { field: String, value: String },
}

/// Result type alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;
