//! Fire-and-forget persistence queue.
//!
//! Callers enqueue without waiting. A single consumer task writes records in
//! arrival order, so records for one position stay FIFO. While the sink is
//! failing the consumer holds the `persistence` circuit breaker slot and
//! retries the same record with capped backoff.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recon_core::{Backoff, PersistAction, Position};
use recon_risk::{NoNewPositions, PERSISTENCE};
use recon_telemetry::Metrics;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::writer::{RecordSink, TradeRecord};

/// One queued persistence request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistRequest {
    pub action: PersistAction,
    pub position: Option<Position>,
    pub requested_at: DateTime<Utc>,
}

impl From<PersistRequest> for TradeRecord {
    fn from(req: PersistRequest) -> Self {
        Self {
            action: req.action,
            recorded_at: req.requested_at,
            position: req.position,
        }
    }
}

/// Cloneable enqueue handle.
#[derive(Debug, Clone)]
pub struct PersistenceHandle {
    tx: mpsc::UnboundedSender<PersistRequest>,
}

impl PersistenceHandle {
    /// Create a handle and the receiver a [`PersistenceTask`] consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PersistRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Enqueue a position snapshot under `action`.
    pub fn enqueue(&self, action: PersistAction, position: &Position) {
        self.send(PersistRequest {
            action,
            position: Some(position.clone()),
            requested_at: Utc::now(),
        });
    }

    /// Enqueue the marker that all positions were liquidated.
    pub fn enqueue_delete_all(&self) {
        self.send(PersistRequest {
            action: PersistAction::DeleteAllPositions,
            position: None,
            requested_at: Utc::now(),
        });
    }

    fn send(&self, req: PersistRequest) {
        let action = req.action;
        if self.tx.send(req).is_err() {
            error!(action = %action, "Persistence queue closed, record lost");
        } else {
            Metrics::persistence_queue_inc();
        }
    }
}

/// Single consumer draining the queue into a [`RecordSink`].
pub struct PersistenceTask<S: RecordSink> {
    rx: mpsc::UnboundedReceiver<PersistRequest>,
    sink: S,
    breaker: Arc<NoNewPositions>,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl<S: RecordSink> PersistenceTask<S> {
    pub fn new(
        rx: mpsc::UnboundedReceiver<PersistRequest>,
        sink: S,
        breaker: Arc<NoNewPositions>,
        backoff: Backoff,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rx,
            sink,
            breaker,
            backoff,
            shutdown,
        }
    }

    /// Run until every handle is dropped or shutdown is requested.
    ///
    /// On shutdown, requests already queued are written once more before
    /// returning; a record that still fails is logged and dropped.
    pub async fn run(mut self) -> S {
        info!("Persistence task started");
        loop {
            tokio::select! {
                biased;

                req = self.rx.recv() => match req {
                    Some(req) => self.persist(req).await,
                    None => break,
                },

                _ = self.shutdown.cancelled() => {
                    self.drain();
                    break;
                }
            }
        }
        if let Err(e) = self.sink.close() {
            warn!(?e, "Failed to close persistence sink");
        }
        info!("Persistence task stopped");
        self.sink
    }

    async fn persist(&mut self, req: PersistRequest) {
        Metrics::persistence_queue_dec();
        let record = TradeRecord::from(req);
        let mut attempt: u32 = 0;
        loop {
            match self.sink.append(&record) {
                Ok(()) => {
                    if attempt > 0 {
                        info!(attempt, "Persistence recovered");
                        self.set_breaker(false);
                    }
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    Metrics::persistence_failure();
                    self.set_breaker(true);
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        action = %record.action,
                        "Persistence write failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            error!(action = %record.action, "Shutdown while retrying, record dropped");
                            return;
                        }
                    }
                }
            }
        }
    }

    fn drain(&mut self) {
        let mut drained = 0usize;
        while let Ok(req) = self.rx.try_recv() {
            Metrics::persistence_queue_dec();
            let record = TradeRecord::from(req);
            match self.sink.append(&record) {
                Ok(()) => drained += 1,
                Err(e) => error!(error = %e, action = %record.action, "Record dropped at shutdown"),
            }
        }
        debug!(drained, "Persistence queue drained");
    }

    fn set_breaker(&self, blocked: bool) {
        let result = if blocked {
            self.breaker.set(PERSISTENCE)
        } else {
            self.breaker.clear(PERSISTENCE)
        };
        if let Err(e) = result {
            warn!(?e, "Persistence breaker slot unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PersistenceError, PersistenceResult};
    use chrono::TimeZone;
    use recon_core::{AssetClass, OrderSide, OrderType, PositionId, TriggerContext};
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sink that fails a fixed number of times before accepting records.
    struct FlakySink {
        failures_left: usize,
        written: Vec<TradeRecord>,
        attempts: Arc<AtomicUsize>,
    }

    impl RecordSink for FlakySink {
        fn append(&mut self, record: &TradeRecord) -> PersistenceResult<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.failures_left > 0 {
                self.failures_left -= 1;
                return Err(PersistenceError::Io(std::io::Error::other("disk full")));
            }
            self.written.push(record.clone());
            Ok(())
        }

        fn close(&mut self) -> PersistenceResult<()> {
            Ok(())
        }
    }

    fn sink(failures: usize) -> (FlakySink, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (
            FlakySink {
                failures_left: failures,
                written: Vec::new(),
                attempts: attempts.clone(),
            },
            attempts,
        )
    }

    fn position(strategy: &str) -> Position {
        let t = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let id = PositionId::new("ETH/USD", strategy, t).unwrap();
        let trigger = TriggerContext {
            side: OrderSide::Buy,
            order_type: OrderType::Ioc,
            trigger_time: t,
            trigger_price: dec!(2000),
            bar_time: t,
            price_received_at: t,
        };
        Position::pending_open(id, "ETH/USD", strategy, AssetClass::Crypto, trigger)
    }

    #[tokio::test]
    async fn test_records_written_in_order() {
        let (handle, rx) = PersistenceHandle::channel();
        let breaker = Arc::new(NoNewPositions::with_default_slots());
        let (sink, _) = sink(0);
        let task = PersistenceTask::new(
            rx,
            sink,
            breaker,
            Backoff::new(1, 5),
            CancellationToken::new(),
        );

        handle.enqueue(PersistAction::Open, &position("a"));
        handle.enqueue(PersistAction::Close, &position("a"));
        handle.enqueue_delete_all();
        drop(handle);

        let sink = task.run().await;
        let actions: Vec<_> = sink.written.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![
                PersistAction::Open,
                PersistAction::Close,
                PersistAction::DeleteAllPositions
            ]
        );
    }

    #[tokio::test]
    async fn test_failure_holds_breaker_until_recovered() {
        let (handle, rx) = PersistenceHandle::channel();
        let breaker = Arc::new(NoNewPositions::with_default_slots());
        let (sink, attempts) = sink(3);
        let task = PersistenceTask::new(
            rx,
            sink,
            breaker.clone(),
            Backoff::new(20, 40),
            CancellationToken::new(),
        );
        let join = tokio::spawn(task.run());

        handle.enqueue(PersistAction::Open, &position("a"));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(breaker.is_blocked());
        assert_eq!(breaker.blocked_by(), vec![PERSISTENCE.to_string()]);

        drop(handle);
        let sink = join.await.unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(sink.written.len(), 1);
        assert!(!breaker.is_blocked());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queue() {
        let (handle, rx) = PersistenceHandle::channel();
        let shutdown = CancellationToken::new();
        let (sink, _) = sink(0);
        let task = PersistenceTask::new(
            rx,
            sink,
            Arc::new(NoNewPositions::with_default_slots()),
            Backoff::new(1, 5),
            shutdown.clone(),
        );

        handle.enqueue(PersistAction::Open, &position("a"));
        handle.enqueue(PersistAction::Open, &position("b"));
        shutdown.cancel();

        let sink = task.run().await;
        assert_eq!(sink.written.len(), 2);
    }
}
