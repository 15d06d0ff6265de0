//! Per-sensor activity stabilizer
//!
//! Raw readings flip in and out of the valid band constantly. The
//! stabilizer keeps a small ring of recent classifications and commits
//! a transition only when the most recent samples agree on the new
//! state, and no sooner than the minimum interval after the previous
//! transition. A reset (link lost, device gone) clears everything
//! including the cooldown, so activity after a reconnect commits as
//! soon as the agreement fills.

use crate::config::SensorConfig;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct SensorStabilizer {
    window: usize,
    agreement: usize,
    min_interval: Duration,
    samples: VecDeque<bool>,
    active: bool,
    last_transition: Option<Instant>,
}

impl SensorStabilizer {
    pub fn new(config: &SensorConfig) -> Self {
        Self {
            window: config.window,
            agreement: config.agreement.min(config.window),
            min_interval: config.min_interval,
            samples: VecDeque::with_capacity(config.window),
            active: false,
            last_transition: None,
        }
    }

    /// The committed (stabilized) activity state.
    pub fn active(&self) -> bool {
        self.active
    }

    /// Feed one classified sample. Returns the new committed state if
    /// this sample completed a transition, None otherwise.
    pub fn push(&mut self, sample: bool, now: Instant) -> Option<bool> {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);

        let candidate = !self.active;
        if !self.recent_agree(candidate) {
            return None;
        }
        if let Some(at) = self.last_transition {
            if now.duration_since(at) < self.min_interval {
                return None;
            }
        }
        self.active = candidate;
        self.last_transition = Some(now);
        Some(candidate)
    }

    /// Clear samples, committed state, and the transition cooldown.
    pub fn reset(&mut self) {
        self.samples.clear();
        self.active = false;
        self.last_transition = None;
    }

    fn recent_agree(&self, wanted: bool) -> bool {
        if self.samples.len() < self.agreement {
            return false;
        }
        self.samples
            .iter()
            .rev()
            .take(self.agreement)
            .all(|&s| s == wanted)
    }
}
