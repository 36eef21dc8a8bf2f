//! Engine-wide context and the symbol -> asset registry.

use std::sync::Arc;

use dashmap::DashMap;
use recon_broker::DynBroker;
use recon_core::{AssetClass, OrderType, OrderUpdate, ParsedOrderId, Position, PositionKey};
use recon_persistence::PersistenceHandle;
use recon_risk::{HaltLatch, NoNewPositions};
use serde::Deserialize;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::asset::{Asset, UpdateOutcome};
use crate::error::PositionResult;
use crate::strategy::Strategy;

/// Window size and freshness limits for opening positions.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Bars kept per asset.
    pub window_size: usize,
    /// An open is refused when the last price is older than this.
    pub max_price_age_ms: u64,
    /// An open is refused when the decision is older than this.
    pub max_decision_age_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window_size: 60,
            max_price_age_ms: 90_000,
            max_decision_age_ms: 5_000,
        }
    }
}

/// Collaborators shared by every asset.
pub struct EngineContext {
    pub broker: DynBroker,
    pub breaker: Arc<NoNewPositions>,
    pub persistence: PersistenceHandle,
    pub halt: Arc<HaltLatch>,
    pub config: EngineConfig,
    /// Readers: open, close and order-update application. Writer:
    /// reconciliation.
    state_lock: RwLock<()>,
}

impl EngineContext {
    pub fn new(
        broker: DynBroker,
        breaker: Arc<NoNewPositions>,
        persistence: PersistenceHandle,
        halt: Arc<HaltLatch>,
        config: EngineConfig,
    ) -> Self {
        Self {
            broker,
            breaker,
            persistence,
            halt,
            config,
            state_lock: RwLock::new(()),
        }
    }

    pub async fn read_state(&self) -> RwLockReadGuard<'_, ()> {
        self.state_lock.read().await
    }

    pub async fn write_state(&self) -> RwLockWriteGuard<'_, ()> {
        self.state_lock.write().await
    }
}

/// Every traded asset, created at startup and never removed.
pub struct AssetBook {
    assets: DashMap<String, Arc<Asset>>,
    ctx: Arc<EngineContext>,
}

impl AssetBook {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            assets: DashMap::new(),
            ctx,
        }
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    /// Register an asset. Re-registering a symbol replaces it.
    pub fn add_asset(
        &self,
        symbol: &str,
        asset_class: AssetClass,
        strategies: Vec<Arc<dyn Strategy>>,
    ) -> Arc<Asset> {
        let asset = Arc::new(Asset::new(
            symbol,
            asset_class,
            strategies,
            self.ctx.clone(),
        ));
        self.assets.insert(symbol.to_string(), asset.clone());
        asset
    }

    pub fn get(&self, symbol: &str) -> Option<Arc<Asset>> {
        self.assets.get(symbol).map(|a| a.value().clone())
    }

    /// Symbols in sorted order.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.assets.iter().map(|a| a.key().clone()).collect();
        symbols.sort();
        symbols
    }

    /// Assets in symbol order.
    pub fn assets(&self) -> Vec<Arc<Asset>> {
        self.symbols()
            .iter()
            .filter_map(|symbol| self.get(symbol))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Snapshot of the position identified by `key`.
    pub fn position(&self, key: &PositionKey) -> Option<Position> {
        let asset = self.get(&key.symbol)?;
        if asset.asset_class() != key.asset_class {
            return None;
        }
        asset.position(&key.strategy)
    }

    /// Apply one order update to the position it belongs to.
    ///
    /// A close that resolves with quantity left over is re-issued here, after
    /// the state lock is released.
    pub async fn apply_order_update(&self, update: &OrderUpdate) -> PositionResult<UpdateOutcome> {
        let symbol = match update.symbol.clone() {
            Some(symbol) => symbol,
            None => match ParsedOrderId::parse(&update.client_order_id) {
                Some(parsed) => parsed.symbol,
                None => {
                    warn!(client_order_id = %update.client_order_id, "Order update without symbol");
                    return Ok(UpdateOutcome::Ignored);
                }
            },
        };
        let key = PositionKey::new(update.asset_class, symbol, update.strategy.clone());

        let Some(asset) = self.get(&key.symbol) else {
            warn!(key = %key, "Order update for untracked symbol");
            return Ok(UpdateOutcome::Ignored);
        };
        if asset.asset_class() != key.asset_class {
            warn!(key = %key, "Order update asset class does not match tracked asset");
            return Ok(UpdateOutcome::Ignored);
        }

        let outcome = {
            let _state = self.ctx.read_state().await;
            asset.apply_order_update(update)?
        };
        debug!(key = %key, event = %update.event, outcome = ?outcome, "Order update applied");

        if let UpdateOutcome::ReissueClose(strategy) = &outcome {
            if let Err(e) = asset.close(strategy, OrderType::Ioc).await {
                warn!(key = %key, error = %e, "Close re-issue failed");
            }
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_defaults_fill_missing_fields() {
        let config: EngineConfig = toml::from_str("window_size = 120").unwrap();
        assert_eq!(config.window_size, 120);
        assert_eq!(config.max_price_age_ms, 90_000);
        assert_eq!(config.max_decision_age_ms, 5_000);
    }
}
