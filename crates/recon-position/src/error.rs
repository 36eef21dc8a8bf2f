//! Position error types.

use recon_broker::BrokerError;
use recon_core::{CoreError, OrderSide};
use recon_risk::FatalReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PositionError {
    #[error("Position not found: {0}")]
    NotFound(String),

    #[error("Invalid position state: {0}")]
    InvalidState(String),

    #[error("Cannot open {side} position on {symbol}: only long opens are supported")]
    UnsupportedSide { symbol: String, side: OrderSide },

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Fatal: {0}")]
    Fatal(FatalReason),
}

impl PositionError {
    #[must_use]
    pub fn fatal_reason(&self) -> Option<&FatalReason> {
        match self {
            Self::Fatal(reason) => Some(reason),
            _ => None,
        }
    }
}

pub type PositionResult<T> = Result<T, PositionError>;
