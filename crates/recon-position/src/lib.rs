//! Position state for the reconciliation engine.
//!
//! # Key Components
//!
//! - [`RollingWindow`]: fixed-size OHLC series per asset
//! - [`Strategy`]: pluggable decision logic evaluated on market updates
//! - [`Asset`]: window, cached broker quantity, and one position per strategy
//! - [`AssetBook`]: symbol registry; routes order updates and runs
//!   reconciliation
//! - [`EngineContext`]: broker, circuit breaker, persistence and halt latch
//!   shared by every asset

pub mod asset;
pub mod book;
pub mod error;
pub mod reconcile;
pub mod strategy;
pub mod window;

pub use asset::{Asset, CloseOutcome, OpenOutcome, SharedPosition, UpdateOutcome};
pub use book::{AssetBook, EngineConfig, EngineContext};
pub use error::{PositionError, PositionResult};
pub use reconcile::{ReconcileOutcome, ReconcileReport, ReconciliationDiff, SymbolReport};
pub use strategy::{Action, AssetView, Decision, Strategy};
pub use window::{RollingWindow, Series};
