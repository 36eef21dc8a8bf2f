//! Keepalive bookkeeping for one socket session.
//!
//! A ping goes out every interval unless one is already outstanding. The
//! peer acknowledges with a pong or with any other traffic; if neither
//! arrives within the timeout the session is considered dead.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct State {
    last_ping: Option<DateTime<Utc>>,
    last_pong: Option<DateTime<Utc>>,
    last_message: DateTime<Utc>,
    awaiting_ack: bool,
}

impl State {
    fn fresh() -> Self {
        Self {
            last_ping: None,
            last_pong: None,
            last_message: Utc::now(),
            awaiting_ack: false,
        }
    }
}

/// Heartbeat state shared by the listen loop and the keepalive task.
pub struct HeartbeatManager {
    interval_ms: u64,
    timeout_ms: u64,
    state: RwLock<State>,
}

impl HeartbeatManager {
    pub fn new(interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            interval_ms,
            timeout_ms,
            state: RwLock::new(State::fresh()),
        }
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// Reset for a new session.
    pub fn reset(&self) {
        *self.state.write() = State::fresh();
    }

    pub fn record_ping(&self) {
        let mut state = self.state.write();
        state.last_ping = Some(Utc::now());
        state.awaiting_ack = true;
    }

    pub fn record_pong(&self) {
        let now = Utc::now();
        let mut state = self.state.write();
        if let Some(ping) = state.last_ping {
            debug!(rtt_ms = (now - ping).num_milliseconds(), "Received pong");
        }
        state.last_pong = Some(now);
        state.last_message = now;
        state.awaiting_ack = false;
    }

    /// Any inbound traffic acknowledges an outstanding ping.
    pub fn record_message(&self) {
        let mut state = self.state.write();
        state.last_message = Utc::now();
        state.awaiting_ack = false;
    }

    /// True if a ping has gone unacknowledged for longer than the timeout.
    pub fn is_timed_out(&self) -> bool {
        let state = self.state.read();
        match (state.awaiting_ack, state.last_ping) {
            (true, Some(ping)) => (Utc::now() - ping).num_milliseconds() > self.timeout_ms as i64,
            _ => false,
        }
    }

    pub fn should_send_ping(&self) -> bool {
        !self.state.read().awaiting_ack
    }

    pub fn time_since_last_message_ms(&self) -> i64 {
        (Utc::now() - self.state.read().last_message).num_milliseconds()
    }

    pub fn stats(&self) -> HeartbeatStats {
        let state = *self.state.read();
        HeartbeatStats {
            last_ping: state.last_ping,
            last_pong: state.last_pong,
            last_message: state.last_message,
            awaiting_ack: state.awaiting_ack,
        }
    }
}

/// Heartbeat statistics.
#[derive(Debug, Clone)]
pub struct HeartbeatStats {
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub last_message: DateTime<Utc>,
    pub awaiting_ack: bool,
}

/// Keepalive task for one session.
///
/// Requests a ping from the listen loop (which owns the socket sink) every
/// interval. On an unacknowledged ping past the timeout it cancels
/// `session`, which makes the listen loop close the socket.
pub async fn run_keepalive(
    feed: String,
    heartbeat: Arc<HeartbeatManager>,
    session: CancellationToken,
    ping_tx: mpsc::Sender<()>,
) {
    let mut ticker = tokio::time::interval(heartbeat.interval());
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            () = session.cancelled() => return,
            _ = ticker.tick() => {
                if heartbeat.is_timed_out() {
                    warn!(
                        feed = %feed,
                        silent_ms = heartbeat.time_since_last_message_ms(),
                        "Keepalive deadline missed, forcing socket closed"
                    );
                    session.cancel();
                    return;
                }
                if heartbeat.should_send_ping() && ping_tx.try_send(()).is_err() {
                    debug!(feed = %feed, "Ping already queued");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_initial_state() {
        let hb = HeartbeatManager::new(45000, 10000);
        assert!(!hb.is_timed_out());
        assert!(hb.should_send_ping());
    }

    #[test]
    fn test_ping_then_any_message_acknowledges() {
        let hb = HeartbeatManager::new(45000, 10000);
        hb.record_ping();
        assert!(!hb.should_send_ping());
        hb.record_message();
        assert!(hb.should_send_ping());
        assert!(hb.stats().last_pong.is_none());
    }

    #[test]
    fn test_unacknowledged_ping_times_out() {
        let hb = HeartbeatManager::new(10, 0);
        hb.record_ping();
        std::thread::sleep(Duration::from_millis(5));
        assert!(hb.is_timed_out());
        hb.record_pong();
        assert!(!hb.is_timed_out());
    }

    #[tokio::test]
    async fn test_keepalive_requests_pings_then_cancels() {
        let hb = Arc::new(HeartbeatManager::new(10, 15));
        let session = CancellationToken::new();
        let (ping_tx, mut ping_rx) = mpsc::channel(1);
        let task = tokio::spawn(run_keepalive(
            "test".to_string(),
            hb.clone(),
            session.clone(),
            ping_tx,
        ));

        // Ping requested, but never acknowledged.
        ping_rx.recv().await.unwrap();
        hb.record_ping();

        tokio::time::timeout(Duration::from_secs(1), session.cancelled())
            .await
            .unwrap();
        task.await.unwrap();
    }
}
