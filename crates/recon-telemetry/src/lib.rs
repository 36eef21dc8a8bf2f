//! Prometheus metrics and structured logging.
//!
//! - `init_logging`: tracing subscriber, JSON in production, pretty otherwise
//! - `Metrics`: facade over the process-wide prometheus registry

pub mod error;
pub mod logging;
pub mod metrics;

pub use error::{TelemetryError, TelemetryResult};
pub use logging::init_logging;
pub use metrics::Metrics;
