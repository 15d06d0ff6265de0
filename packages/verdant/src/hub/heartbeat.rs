//! Application-level heartbeat policy for devices
//!
//! Transport pings keep the socket alive; this layer confirms the
//! firmware on the other end is still responsive. The registry drives
//! it: one `on_tick` per device per ping interval, one `on_pong` per
//! pong received. All time comes in as `tokio::time::Instant` so the
//! policy tests run under paused time.

use crate::config::HeartbeatConfig;
use tokio::time::Instant;

/// What the registry should do with a device at a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Device responded in time; send the next ping.
    SendPing,
    /// The previous ping went unanswered past the response timeout.
    Expired,
}

/// Per-device heartbeat bookkeeping.
#[derive(Debug, Clone)]
pub struct HeartbeatState {
    last_ping_at: Option<Instant>,
    last_pong_at: Instant,
}

impl HeartbeatState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_ping_at: None,
            last_pong_at: now,
        }
    }

    pub fn on_pong(&mut self, now: Instant) {
        self.last_pong_at = now;
    }
}

/// Shared heartbeat policy, one per hub.
#[derive(Debug, Clone)]
pub struct HeartbeatPolicy {
    config: HeartbeatConfig,
}

impl HeartbeatPolicy {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self { config }
    }

    pub fn ping_interval(&self) -> std::time::Duration {
        self.config.ping_interval
    }

    /// Evaluate a device at its heartbeat tick. A device expires when
    /// its last ping drew no pong within the response timeout;
    /// otherwise the tick records a fresh ping.
    pub fn on_tick(&self, state: &mut HeartbeatState, now: Instant) -> HeartbeatVerdict {
        if let Some(ping_at) = state.last_ping_at {
            let answered = state.last_pong_at >= ping_at;
            if !answered && now.duration_since(ping_at) >= self.config.response_timeout {
                return HeartbeatVerdict::Expired;
            }
        }
        state.last_ping_at = Some(now);
        HeartbeatVerdict::SendPing
    }
}
