//! Trade log persistence.
//!
//! Position events are enqueued fire-and-forget and written by one consumer
//! task to daily JSON Lines files for post-analysis.

pub mod error;
pub mod queue;
pub mod writer;

pub use error::{PersistenceError, PersistenceResult};
pub use queue::{PersistRequest, PersistenceHandle, PersistenceTask};
pub use writer::{RecordSink, TradeLogWriter, TradeRecord};
