//! Integration tests for recon-bot.
//!
//! These tests run the whole application against mock feeds and a mock
//! broker:
//! - Open and fill flowing from market data to the trade log
//! - Fatal errors ending in liquidation
//! - Graceful shutdown

pub mod common;
