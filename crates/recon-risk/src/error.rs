//! Risk error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("Unknown circuit breaker slot: {0}")]
    UnknownSlot(String),
}

pub type RiskResult<T> = Result<T, RiskError>;
