//! Bounded worker pool applying market events to assets.
//!
//! Events are sharded by symbol so every event for one asset is handled by
//! the same worker, in arrival order. Each shard's channel is bounded;
//! a full shard makes the feed reader wait.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use recon_core::MarketEvent;
use recon_position::AssetBook;
use recon_telemetry::Metrics;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::error::{FeedError, FeedResult};

pub struct WorkerPool {
    senders: Vec<mpsc::Sender<MarketEvent>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `workers` shards with `capacity` queued events each.
    pub fn spawn(
        workers: usize,
        capacity: usize,
        book: Arc<AssetBook>,
        shutdown: CancellationToken,
    ) -> Self {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let mut senders = Vec::with_capacity(workers);
        let mut handles = Vec::with_capacity(workers);

        for id in 0..workers {
            let (tx, rx) = mpsc::channel(capacity);
            senders.push(tx);
            handles.push(tokio::spawn(run_worker(
                id,
                rx,
                book.clone(),
                shutdown.clone(),
            )));
        }
        info!(workers, capacity, "Market worker pool started");

        Self { senders, handles }
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Shard owning `symbol`.
    pub fn shard(&self, symbol: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        symbol.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    /// Queue an event on its shard, waiting while the shard is full.
    pub async fn dispatch(&self, event: MarketEvent) -> FeedResult<()> {
        let shard = self.shard(event.symbol());
        self.senders[shard]
            .send(event)
            .await
            .map_err(|_| FeedError::PoolClosed)
    }

    /// Close every shard and wait for queued events to drain.
    pub async fn join(self) {
        drop(self.senders);
        for handle in self.handles {
            if let Err(e) = handle.await {
                debug!(error = %e, "Market worker ended abnormally");
            }
        }
    }
}

async fn run_worker(
    id: usize,
    mut rx: mpsc::Receiver<MarketEvent>,
    book: Arc<AssetBook>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => {
                debug!(worker = id, "Market worker stopping");
                break;
            }
            event = rx.recv() => match event {
                Some(event) => handle_event(&book, &event),
                None => break,
            },
        }
    }
}

fn handle_event(book: &AssetBook, event: &MarketEvent) {
    let Some(asset) = book.get(event.symbol()) else {
        trace!(symbol = event.symbol(), "Market event for untracked symbol");
        return;
    };
    asset.apply_market_event(event);
    Metrics::market_event(match event {
        MarketEvent::Bar(_) => "bar",
        MarketEvent::Trade(_) => "trade",
    });
    asset.signal();
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use recon_broker::MockBroker;
    use recon_core::{AssetClass, Bar};
    use recon_persistence::PersistenceHandle;
    use recon_position::{EngineConfig, EngineContext, Series};
    use recon_risk::{HaltLatch, NoNewPositions};
    use rust_decimal_macros::dec;

    fn book() -> Arc<AssetBook> {
        let (persistence, _rx) = PersistenceHandle::channel();
        let ctx = Arc::new(EngineContext::new(
            Arc::new(MockBroker::new()),
            Arc::new(NoNewPositions::with_default_slots()),
            persistence,
            Arc::new(HaltLatch::new()),
            EngineConfig {
                window_size: 5,
                ..EngineConfig::default()
            },
        ));
        let book = Arc::new(AssetBook::new(ctx));
        book.add_asset("AAPL", AssetClass::UsEquity, Vec::new());
        book
    }

    fn bar(symbol: &str, close: rust_decimal::Decimal, minutes_ago: i64) -> MarketEvent {
        let minute = Utc.with_ymd_and_hms(2024, 1, 2, 15, 30, 0).unwrap();
        MarketEvent::Bar(Bar {
            symbol: symbol.to_string(),
            open: close,
            high: close,
            low: close,
            close,
            bar_time: minute - Duration::minutes(minutes_ago),
            received_at: minute,
        })
    }

    #[tokio::test]
    async fn test_shard_is_stable_per_symbol() {
        let pool = WorkerPool::spawn(4, 2, book(), CancellationToken::new());
        assert_eq!(pool.workers(), 4);
        let first = pool.shard("AAPL");
        for _ in 0..10 {
            assert_eq!(pool.shard("AAPL"), first);
        }
        assert!(pool.shard("BTC/USD") < 4);
        pool.join().await;
    }

    #[tokio::test]
    async fn test_events_applied_in_order() {
        let book = book();
        let pool = WorkerPool::spawn(2, 1, book.clone(), CancellationToken::new());

        pool.dispatch(bar("AAPL", dec!(10), 2)).await.unwrap();
        pool.dispatch(bar("AAPL", dec!(11), 1)).await.unwrap();
        pool.dispatch(bar("AAPL", dec!(12), 0)).await.unwrap();
        pool.dispatch(bar("MSFT", dec!(99), 0)).await.unwrap();
        pool.join().await;

        let window = book.get("AAPL").unwrap().window();
        assert_eq!(window.last_close(), dec!(12));
        assert_eq!(window.at(Series::Close, 1), Some(dec!(11)));
        assert_eq!(window.at(Series::Close, 2), Some(dec!(10)));
    }

    #[tokio::test]
    async fn test_dispatch_after_shutdown_fails() {
        let shutdown = CancellationToken::new();
        let pool = WorkerPool::spawn(1, 1, book(), shutdown.clone());
        shutdown.cancel();
        // Worker exits; once its receiver is gone the send fails.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            pool.dispatch(bar("AAPL", dec!(1), 0)).await,
            Err(FeedError::PoolClosed)
        ));
    }
}
