//! Broker REST interface.
//!
//! - `Broker`: order submission and account queries the engine depends on
//! - `RestBroker`: reqwest implementation for an Alpaca-style API
//! - `MockBroker`: recording implementation for tests

pub mod broker;
pub mod client;
pub mod error;
pub mod mock;

pub use broker::{BoxFuture, Broker, ClosedOrder, DynBroker};
pub use client::{order_qty, RestBroker, RestBrokerConfig};
pub use error::{BrokerError, BrokerResult};
pub use mock::{BrokerCall, MockBroker};
