//! Heartbeat Monitoring
//!
//! Detects silent connection death. The session pings the feed every
//! `ping_interval` and treats the connection as lost once no frame of any
//! kind has arrived for `timeout`. Any inbound frame, including pongs,
//! counts as activity.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

/// Configuration for heartbeat monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping frames.
    pub ping_interval: Duration,
    /// Inactivity after which the connection is considered dead.
    pub timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Build a config, or `None` when the interval is zero (disabled).
    #[must_use]
    pub const fn enabled(ping_interval: Duration, timeout: Duration) -> Option<Self> {
        if ping_interval.is_zero() {
            None
        } else {
            Some(Self {
                ping_interval,
                timeout,
            })
        }
    }
}

/// What to do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a ping.
    Ping,
    /// The connection has been silent past the timeout.
    Expired {
        /// Time since the last inbound frame.
        silent_for: Duration,
    },
}

/// Liveness tracker for one physical connection.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    last_activity: Instant,
    interval: Interval,
}

impl HeartbeatMonitor {
    /// Start monitoring from now.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let mut interval = tokio::time::interval_at(now + config.ping_interval, config.ping_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            last_activity: now,
            interval,
        }
    }

    /// Record an inbound frame.
    pub fn record_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Decide what to do at `now`.
    #[must_use]
    pub fn check(&self, now: Instant) -> HeartbeatAction {
        let silent_for = now.saturating_duration_since(self.last_activity);
        if silent_for >= self.config.timeout {
            HeartbeatAction::Expired { silent_for }
        } else {
            HeartbeatAction::Ping
        }
    }

    /// Wait for the next tick and decide what to do.
    ///
    /// Cancel safe.
    pub async fn tick(&mut self) -> HeartbeatAction {
        let now = self.interval.tick().await;
        self.check(now)
    }
}

/// Wait on an optional monitor; never resolves when monitoring is disabled.
pub async fn next_tick(monitor: &mut Option<HeartbeatMonitor>) -> HeartbeatAction {
    match monitor {
        Some(monitor) => monitor.tick().await,
        None => std::future::pending().await,
    }
}
