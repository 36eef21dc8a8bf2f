//! Market and account feed protocols.
//!
//! Both feeds plug into [`recon_ws::ConnectionManager`] as a
//! [`recon_ws::FeedHandler`]:
//!
//! - [`MarketFeed`]: bars and trades, fanned out to a [`WorkerPool`]
//!   sharded by symbol
//! - [`AccountFeed`]: order updates applied to positions; reconciliation on
//!   every reconnect

pub mod account;
pub mod error;
pub mod market;
pub mod order_update;
pub mod pool;

pub use account::{AccountFeed, AccountFeedConfig};
pub use error::{FeedError, FeedResult};
pub use market::{parse_market_frame, ControlMessage, MarketFeed, MarketFeedConfig, MarketFrame};
pub use order_update::parse_order_update;
pub use pool::WorkerPool;
