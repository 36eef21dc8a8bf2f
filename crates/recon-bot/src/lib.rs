//! Position reconciliation engine.
//!
//! Main application that wires the components together:
//! - Broker REST client
//! - Market feed with a sharded worker pool
//! - Account feed applying order updates and reconciling on reconnect
//! - Trade log persistence
//! - Fatal supervision: liquidate everything and stop

pub mod app;
pub mod config;
pub mod error;

pub use app::Application;
pub use config::AppConfig;
pub use error::{AppError, AppResult};
