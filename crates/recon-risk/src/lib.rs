//! Trading safety controls.
//!
//! - `NoNewPositions`: circuit breaker gating new position opens while any
//!   dependency (market feed, account feed, persistence) is unhealthy
//! - `HaltLatch`: records the first fatal condition and wakes the supervisor

pub mod circuit_breaker;
pub mod error;
pub mod halt;

pub use circuit_breaker::{
    NoNewPositions, ACCOUNT_LISTENER, DEFAULT_SLOTS, MARKET_LISTENER, PERSISTENCE,
};
pub use error::{RiskError, RiskResult};
pub use halt::{FatalReason, HaltLatch};
