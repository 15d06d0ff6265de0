//! Reconnect policy for the consumer link
//!
//! Pure state machine: the connection loop reports outcomes and gets
//! back a decision. Backoff grows geometrically from the base delay up
//! to the cap; after the attempt budget is spent the link goes offline
//! and stays there until a manual trigger resets it.

use crate::config::LinkConfig;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Never connected yet, or reset by a manual trigger.
    Idle,
    Connected,
    /// Waiting out a backoff delay before attempt `attempt`.
    Reconnecting { attempt: u32 },
    /// Attempt budget exhausted; only a manual trigger leaves this state.
    Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { delay: Duration },
    GiveUp,
}

#[derive(Debug, Clone)]
pub struct ReconnectManager {
    config: LinkConfig,
    attempts: u32,
    state: LinkState,
}

impl ReconnectManager {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            attempts: 0,
            state: LinkState::Idle,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Delay before retry number `attempt` (zero-based):
    /// `min(cap, base * growth^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.config.backoff_base.as_millis() as f64;
        let ms = base * self.config.backoff_growth.powi(attempt as i32);
        let capped = ms.min(self.config.backoff_cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// The link came up. Resets the attempt counter so the next failure
    /// starts the backoff ladder from the bottom.
    pub fn on_connected(&mut self) {
        self.attempts = 0;
        self.state = LinkState::Connected;
    }

    /// The link dropped or a connection attempt failed.
    pub fn on_disconnected(&mut self) -> ReconnectDecision {
        if self.attempts >= self.config.max_attempts {
            self.state = LinkState::Offline;
            return ReconnectDecision::GiveUp;
        }
        let delay = self.delay_for(self.attempts);
        self.attempts += 1;
        self.state = LinkState::Reconnecting {
            attempt: self.attempts,
        };
        ReconnectDecision::Retry { delay }
    }

    /// Manual trigger: leave offline (or any) state and start over with
    /// a fresh attempt budget and no delay.
    pub fn force_reconnect(&mut self) {
        self.attempts = 0;
        self.state = LinkState::Idle;
    }
}
