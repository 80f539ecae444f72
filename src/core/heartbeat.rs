use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::Instant;

use super::frame::WsFrame;
use super::types::now_epoch_ms;

/// Heartbeat cadence and the stale-connection policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive unanswered pings that evict the connection; `None` only records latency.
    pub max_missed: Option<u32>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 25_000,
            timeout_ms: 20_000,
            max_missed: Some(2),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What the session should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatTick {
    /// Send `ping {timestamp}`.
    Ping { timestamp_ms: u64 },
    /// Too many pings are still in flight; skip this tick.
    Skip,
    /// The connection stopped answering.
    Stale { missed: u32 },
}

/// Application-level ping/pong tracker keyed by the ping timestamp.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    pending: HashMap<u64, Instant>,
    max_pending: usize,
    consecutive_missed: u32,
    last_latency: Option<Duration>,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            max_pending: 8,
            consecutive_missed: 0,
            last_latency: None,
        }
    }

    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    pub fn consecutive_missed(&self) -> u32 {
        self.consecutive_missed
    }

    pub fn last_latency(&self) -> Option<Duration> {
        self.last_latency
    }

    pub fn tick(&mut self) -> HeartbeatTick {
        self.expire_pending();

        if let Some(limit) = self.config.max_missed
            && limit > 0
            && self.consecutive_missed >= limit
        {
            return HeartbeatTick::Stale {
                missed: self.consecutive_missed,
            };
        }

        if self.pending.len() >= self.max_pending {
            return HeartbeatTick::Skip;
        }

        let mut timestamp_ms = now_epoch_ms();
        while self.pending.contains_key(&timestamp_ms) {
            timestamp_ms += 1;
        }
        self.pending.insert(timestamp_ms, Instant::now());
        HeartbeatTick::Ping { timestamp_ms }
    }

    /// Record a pong and return the measured round trip.
    ///
    /// A pong for an unknown or already expired ping still proves liveness; its latency
    /// falls back to wall-clock `now - timestamp`.
    pub fn on_pong(&mut self, timestamp_ms: Option<u64>) -> Duration {
        let latency = match timestamp_ms {
            Some(ts) => match self.pending.remove(&ts) {
                Some(sent) => sent.elapsed(),
                None => Duration::from_millis(now_epoch_ms().saturating_sub(ts)),
            },
            None => self
                .pending
                .values()
                .min()
                .map(|sent| sent.elapsed())
                .unwrap_or_default(),
        };
        if timestamp_ms.is_none() {
            self.pending.clear();
        }
        self.consecutive_missed = 0;
        self.last_latency = Some(latency);
        latency
    }

    /// Websocket control pings from the server are answered in kind.
    pub fn reply_to(&self, frame: &WsFrame) -> Option<WsFrame> {
        match frame {
            WsFrame::Ping(payload) => Some(WsFrame::Pong(payload.clone())),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        let timeout = self.config.timeout();
        self.pending.values().any(|sent| sent.elapsed() > timeout)
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.consecutive_missed = 0;
    }

    fn expire_pending(&mut self) {
        let timeout = self.config.timeout();
        let before = self.pending.len();
        self.pending.retain(|_, sent| sent.elapsed() <= timeout);
        let expired = (before - self.pending.len()) as u32;
        self.consecutive_missed = self.consecutive_missed.saturating_add(expired);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn config(max_missed: Option<u32>) -> HeartbeatConfig {
        HeartbeatConfig {
            interval_ms: 1_000,
            timeout_ms: 500,
            max_missed,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn pong_reports_latency_and_clears_misses() {
        let mut monitor = HeartbeatMonitor::new(config(Some(2)));
        let HeartbeatTick::Ping { timestamp_ms } = monitor.tick() else {
            panic!("first tick should ping");
        };

        tokio::time::advance(Duration::from_millis(40)).await;
        let latency = monitor.on_pong(Some(timestamp_ms));
        assert_eq!(latency, Duration::from_millis(40));
        assert_eq!(monitor.last_latency(), Some(latency));
        assert!(!monitor.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_misses_mark_connection_stale() {
        let mut monitor = HeartbeatMonitor::new(config(Some(2)));

        assert!(matches!(monitor.tick(), HeartbeatTick::Ping { .. }));
        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert!(monitor.is_stale());
        assert!(matches!(monitor.tick(), HeartbeatTick::Ping { .. }));
        assert_eq!(monitor.consecutive_missed(), 1);

        tokio::time::advance(Duration::from_millis(1_000)).await;
        assert_eq!(monitor.tick(), HeartbeatTick::Stale { missed: 2 });

        monitor.reset();
        assert_eq!(monitor.consecutive_missed(), 0);
        assert!(matches!(monitor.tick(), HeartbeatTick::Ping { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn record_only_mode_never_goes_stale() {
        let mut monitor = HeartbeatMonitor::new(config(None)).with_max_pending(2);
        for _ in 0..5 {
            let tick = monitor.tick();
            assert!(!matches!(tick, HeartbeatTick::Stale { .. }));
            tokio::time::advance(Duration::from_millis(1_000)).await;
        }
        assert_eq!(monitor.consecutive_missed(), 5 - 1);
    }

    #[test]
    fn pending_cap_skips_ticks() {
        let mut monitor = HeartbeatMonitor::new(HeartbeatConfig {
            interval_ms: 1_000,
            timeout_ms: 60_000,
            max_missed: None,
        })
        .with_max_pending(1);
        assert!(matches!(monitor.tick(), HeartbeatTick::Ping { .. }));
        assert_eq!(monitor.tick(), HeartbeatTick::Skip);
    }

    #[test]
    fn answers_control_pings() {
        let monitor = HeartbeatMonitor::new(HeartbeatConfig::default());
        let reply = monitor.reply_to(&WsFrame::Ping(Bytes::from_static(b"p")));
        assert_eq!(reply, Some(WsFrame::Pong(Bytes::from_static(b"p"))));
        assert_eq!(monitor.reply_to(&WsFrame::text("x")), None);
    }
}
