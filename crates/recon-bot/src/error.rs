//! Application error types.

use recon_risk::FatalReason;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<recon_ws::WsError>),

    #[error("Broker error: {0}")]
    Broker(#[from] recon_broker::BrokerError),

    #[error("Telemetry error: {0}")]
    Telemetry(#[from] recon_telemetry::TelemetryError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] recon_persistence::PersistenceError),

    #[error("Fatal: {reason} (liquidated: {liquidated})")]
    Fatal {
        reason: FatalReason,
        liquidated: bool,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
