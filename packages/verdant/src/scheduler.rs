//! Keyed cancellable deferred tasks
//!
//! All deferred work in the hub (grace-period disconnects, heartbeat
//! cycles) goes through one scheduler so that "cancel and reschedule"
//! is a single idempotent operation keyed by (subject, purpose) rather
//! than a pile of hand-tracked timer handles.
//!
//! A fired timer delivers its message back to the owning actor's
//! command channel; the timer marks its own token cancelled after
//! sending, so `is_pending` never reports an already-fired timer.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// What a pending timer is for. One live timer per (subject, purpose).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerPurpose {
    /// Grace period between an apparent disconnect and its confirmation.
    DisconnectGrace,
    /// Next application-level heartbeat cycle for a device.
    Heartbeat,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub subject: String,
    pub purpose: TimerPurpose,
}

impl TimerKey {
    pub fn new(subject: impl Into<String>, purpose: TimerPurpose) -> Self {
        Self {
            subject: subject.into(),
            purpose,
        }
    }
}

/// Deferred-message scheduler bound to an mpsc command channel.
pub struct Scheduler<M> {
    tx: mpsc::Sender<M>,
    pending: HashMap<TimerKey, CancellationToken>,
}

impl<M: Send + 'static> Scheduler<M> {
    pub fn new(tx: mpsc::Sender<M>) -> Self {
        Self {
            tx,
            pending: HashMap::new(),
        }
    }

    /// Arm a timer for `key`, replacing any existing one. After `delay`,
    /// `msg` is delivered to the command channel unless cancelled first.
    pub fn arm(&mut self, key: TimerKey, delay: Duration, msg: M) {
        self.cancel(&key);
        let token = CancellationToken::new();
        self.pending.insert(key.clone(), token.clone());
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    trace!(subject = %key.subject, ?key.purpose, "timer cancelled");
                }
                _ = tokio::time::sleep(delay) => {
                    // Mark fired before delivery so is_pending stays accurate.
                    token.cancel();
                    let _ = tx.send(msg).await;
                }
            }
        });
    }

    /// Arm only if no live timer exists for `key`. Returns true if a new
    /// timer was armed. This is how grace periods stay single-shot: a
    /// second disconnect signal while one is pending is a no-op.
    pub fn arm_if_absent(&mut self, key: TimerKey, delay: Duration, msg: M) -> bool {
        if self.is_pending(&key) {
            return false;
        }
        self.arm(key, delay, msg);
        true
    }

    /// Cancel a live timer. Returns true if one was actually cancelled.
    pub fn cancel(&mut self, key: &TimerKey) -> bool {
        match self.pending.remove(key) {
            Some(token) if !token.is_cancelled() => {
                token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every live timer for a subject, across purposes.
    pub fn cancel_subject(&mut self, subject: &str) {
        let keys: Vec<TimerKey> = self
            .pending
            .keys()
            .filter(|k| k.subject == subject)
            .cloned()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.pending
            .get(key)
            .map(|t| !t.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{advance, Duration};

    fn key(name: &str) -> TimerKey {
        TimerKey::new(name, TimerPurpose::DisconnectGrace)
    }

    #[tokio::test(start_paused = true)]
    async fn armed_timer_fires_after_delay() {
        let (tx, mut rx) = mpsc::channel::<u32>(8);
        let mut sched = Scheduler::new(tx);

        sched.arm(key("a"), Duration::from_millis(100), 1);
        assert!(sched.is_pending(&key("a")));

        advance(Duration::from_millis(101)).await;
        assert_eq!(rx.recv().await, Some(1));
        assert!(!sched.is_pending(&key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_delivery() {
        let (tx, mut rx) = mpsc::channel::<u32>(8);
        let mut sched = Scheduler::new(tx);

        sched.arm(key("a"), Duration::from_millis(100), 1);
        assert!(sched.cancel(&key("a")));

        advance(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
        // Second cancel is a no-op.
        assert!(!sched.cancel(&key("a")));
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_replaces_previous_timer() {
        let (tx, mut rx) = mpsc::channel::<u32>(8);
        let mut sched = Scheduler::new(tx);

        sched.arm(key("a"), Duration::from_millis(100), 1);
        sched.arm(key("a"), Duration::from_millis(300), 2);

        advance(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());

        advance(Duration::from_millis(200)).await;
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn arm_if_absent_is_single_shot_while_pending() {
        let (tx, mut rx) = mpsc::channel::<u32>(8);
        let mut sched = Scheduler::new(tx);

        assert!(sched.arm_if_absent(key("a"), Duration::from_millis(100), 1));
        assert!(!sched.arm_if_absent(key("a"), Duration::from_millis(100), 2));

        advance(Duration::from_millis(101)).await;
        assert_eq!(rx.recv().await, Some(1));
        assert!(rx.try_recv().is_err());

        // After firing, the key can be armed again.
        assert!(sched.arm_if_absent(key("a"), Duration::from_millis(100), 3));
        advance(Duration::from_millis(101)).await;
        assert_eq!(rx.recv().await, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_subject_clears_all_purposes() {
        let (tx, mut rx) = mpsc::channel::<u32>(8);
        let mut sched = Scheduler::new(tx);

        sched.arm(
            TimerKey::new("a", TimerPurpose::DisconnectGrace),
            Duration::from_millis(100),
            1,
        );
        sched.arm(
            TimerKey::new("a", TimerPurpose::Heartbeat),
            Duration::from_millis(100),
            2,
        );
        sched.cancel_subject("a");

        advance(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
