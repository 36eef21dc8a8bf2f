//! Application supervisor.
//!
//! Builds the engine, runs the persistence consumer and both feed
//! lifecycles, and waits for the first of:
//! - Ctrl-C or an external cancel of the shutdown token (graceful)
//! - a feed lifecycle ending normally (graceful)
//! - a halt latch trip or a fatal feed error
//!
//! The fatal path cancels the feeds, liquidates every position, records the
//! liquidation, drains persistence and returns [`AppError::Fatal`].

use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use recon_broker::{DynBroker, RestBroker};
use recon_core::Backoff;
use recon_feed::{AccountFeed, AccountFeedConfig, MarketFeed, MarketFeedConfig, WorkerPool};
use recon_persistence::{PersistRequest, PersistenceHandle, PersistenceTask, TradeLogWriter};
use recon_position::{AssetBook, EngineContext, Strategy};
use recon_risk::{FatalReason, HaltLatch, NoNewPositions};
use recon_telemetry::Metrics;
use recon_ws::{ConnectionConfig, ConnectionManager, FeedHandler, WsResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Why the supervisor stopped waiting.
#[derive(Debug)]
enum Exit {
    Shutdown(&'static str),
    Fatal(FatalReason),
}

type FeedTask = JoinHandle<WsResult<()>>;

/// Main application.
pub struct Application {
    config: AppConfig,
    broker: DynBroker,
    breaker: Arc<NoNewPositions>,
    halt: Arc<HaltLatch>,
    book: Arc<AssetBook>,
    persistence: PersistenceHandle,
    persistence_rx: mpsc::UnboundedReceiver<PersistRequest>,
    shutdown: CancellationToken,
}

impl Application {
    /// Create the application with the REST broker and no strategies.
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let broker: DynBroker = Arc::new(RestBroker::new(config.broker.rest())?);
        Ok(Self::with_parts(config, broker, Vec::new()))
    }

    /// Create the application around an existing broker, registering
    /// `strategies` on every asset.
    pub fn with_parts(
        config: AppConfig,
        broker: DynBroker,
        strategies: Vec<Arc<dyn Strategy>>,
    ) -> Self {
        let breaker = Arc::new(NoNewPositions::with_default_slots());
        let halt = Arc::new(HaltLatch::new());
        let (persistence, persistence_rx) = PersistenceHandle::channel();

        let ctx = Arc::new(EngineContext::new(
            broker.clone(),
            breaker.clone(),
            persistence.clone(),
            halt.clone(),
            config.engine.engine(),
        ));
        let book = Arc::new(AssetBook::new(ctx));
        for asset in &config.assets {
            book.add_asset(&asset.symbol, asset.asset_class, strategies.clone());
        }
        info!(
            assets = book.len(),
            strategies = strategies.len(),
            "Asset book built"
        );

        Self {
            config,
            broker,
            breaker,
            halt,
            book,
            persistence,
            persistence_rx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn book(&self) -> &Arc<AssetBook> {
        &self.book
    }

    pub fn halt(&self) -> &Arc<HaltLatch> {
        &self.halt
    }

    pub fn breaker(&self) -> &Arc<NoNewPositions> {
        &self.breaker
    }

    /// Cancelling this token stops the application gracefully.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Run until shutdown or a fatal error.
    pub async fn run(self) -> AppResult<()> {
        let Self {
            config,
            broker,
            breaker,
            halt,
            book,
            persistence,
            persistence_rx,
            shutdown,
        } = self;

        // Persistence outlives the feeds so the fatal path can still record
        // the liquidation.
        let persistence_token = CancellationToken::new();
        let writer = TradeLogWriter::new(&config.persistence.data_dir)?;
        let persistence_task = tokio::spawn(
            PersistenceTask::new(
                persistence_rx,
                writer,
                breaker.clone(),
                Backoff::new(
                    config.persistence.retry_base_delay_ms,
                    config.persistence.retry_max_delay_ms,
                ),
                persistence_token.clone(),
            )
            .run(),
        );

        let symbols = config.symbols();
        let pool = Arc::new(WorkerPool::spawn(
            config.market_workers(),
            symbols.len(),
            book.clone(),
            shutdown.child_token(),
        ));
        let market = MarketFeed::new(
            MarketFeedConfig {
                key_id: config.broker.key_id.clone(),
                secret_key: config.broker.secret_key.clone(),
                symbols,
                trades: config.market_feed.trades,
            },
            pool.clone(),
        );
        let account = AccountFeed::new(
            AccountFeedConfig {
                key_id: config.broker.key_id.clone(),
                secret_key: config.broker.secret_key.clone(),
            },
            book.clone(),
        );

        let mut market_task = spawn_feed(
            ConnectionConfig::from(&config.market_feed),
            market,
            &breaker,
            &shutdown,
        );
        let mut account_task = spawn_feed(
            ConnectionConfig::from(&config.account_feed),
            account,
            &breaker,
            &shutdown,
        );
        info!("Application running");

        let exit = tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Ctrl-C handler failed");
                }
                Exit::Shutdown("interrupt")
            }
            () = shutdown.cancelled() => Exit::Shutdown("shutdown requested"),
            () = halt.tripped() => match halt.reason() {
                Some(reason) => Exit::Fatal(reason),
                None => Exit::Shutdown("halt without reason"),
            },
            joined = &mut market_task => feed_exit("market", joined),
            joined = &mut account_task => feed_exit("account", joined),
        };

        shutdown.cancel();
        for (name, task) in [("market", market_task), ("account", account_task)] {
            if !task.is_finished() {
                if let Err(e) = task.await {
                    warn!(feed = name, error = %e, "Feed task ended abnormally");
                }
            }
        }
        if let Ok(pool) = Arc::try_unwrap(pool) {
            pool.join().await;
        }

        let result = match exit {
            Exit::Shutdown(why) => {
                info!(reason = why, "Shutting down");
                Ok(())
            }
            Exit::Fatal(reason) => {
                if !halt.is_triggered() {
                    halt.trigger(reason.clone());
                }
                let liquidated = liquidate(&broker, &config).await;
                persistence.enqueue_delete_all();
                Err(AppError::Fatal { reason, liquidated })
            }
        };

        persistence_token.cancel();
        drop(persistence);
        drop(book);
        if let Err(e) = persistence_task.await {
            error!(error = %e, "Persistence task ended abnormally");
        }
        match Metrics::render() {
            Ok(metrics) => debug!(metrics = %metrics, "Final metrics"),
            Err(e) => warn!(error = %e, "Metrics snapshot failed"),
        }
        info!("Application stopped");
        result
    }
}

fn spawn_feed<H: FeedHandler>(
    config: ConnectionConfig,
    handler: H,
    breaker: &Arc<NoNewPositions>,
    shutdown: &CancellationToken,
) -> FeedTask {
    let manager = ConnectionManager::new(
        config,
        Arc::new(handler),
        breaker.clone(),
        shutdown.child_token(),
    );
    tokio::spawn(async move { manager.run().await })
}

fn feed_exit(
    feed: &'static str,
    joined: Result<WsResult<()>, tokio::task::JoinError>,
) -> Exit {
    match joined {
        Ok(Ok(())) => {
            info!(feed, "Feed lifecycle finished");
            Exit::Shutdown("feed closed")
        }
        Ok(Err(e)) => match e.fatal_reason() {
            Some(reason) => {
                error!(feed, error = %e, "Feed failed");
                Exit::Fatal(reason)
            }
            None => {
                warn!(feed, error = %e, "Feed stopped");
                Exit::Shutdown("feed stopped")
            }
        },
        Err(e) => {
            error!(feed, error = %e, "Feed task ended abnormally");
            Exit::Shutdown("feed task ended")
        }
    }
}

/// Close every broker position, retrying up to the configured limit.
async fn liquidate(broker: &DynBroker, config: &AppConfig) -> bool {
    let attempts = config.liquidation.max_attempts.max(1);
    let delay = Duration::from_millis(config.liquidation.retry_delay_ms);
    for attempt in 1..=attempts {
        match broker.liquidate_all().await {
            Ok(()) => {
                info!(attempt, "All positions liquidated");
                return true;
            }
            Err(e) => {
                error!(attempt, attempts, error = %e, "Liquidation failed");
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    error!(attempts, "Liquidation abandoned, positions may remain open");
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_ws::WsError;

    #[test]
    fn test_feed_exit_classification() {
        assert!(matches!(feed_exit("market", Ok(Ok(()))), Exit::Shutdown(_)));
        assert!(matches!(
            feed_exit(
                "market",
                Ok(Err(WsError::RetriesExhausted {
                    feed: "market".into(),
                    attempts: 3
                }))
            ),
            Exit::Fatal(FatalReason::RetriesExhausted { attempts: 3, .. })
        ));
        assert!(matches!(
            feed_exit("account", Ok(Err(WsError::Cancelled))),
            Exit::Shutdown(_)
        ));
    }
}
