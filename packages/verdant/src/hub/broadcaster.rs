//! Composite state fan-out to consumers
//!
//! The broadcaster owns the per-device-type state table and the
//! broadcast channel consumers subscribe to. Every state change flows
//! through here so the published invariant holds at all times:
//! `valid` implies `connected`, and a disconnected entry always reads
//! `{connected: false, valid: false, value: None}`.
//!
//! Rate policy: a meaningful transition (connected or valid flipping)
//! broadcasts immediately; value-only updates broadcast at most once
//! per `every_messages` received readings.

use crate::config::{BroadcastConfig, SensorConfig};
use crate::device::DeviceType;
use crate::hub::protocol::{DeviceState, HubMessage};
use crate::metrics::HubMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, trace};

struct BroadcasterInner {
    states: BTreeMap<DeviceType, DeviceState>,
    /// Readings received since the last broadcast.
    since_broadcast: u32,
}

pub struct StateBroadcaster {
    inner: RwLock<BroadcasterInner>,
    tx: broadcast::Sender<HubMessage>,
    config: BroadcastConfig,
    sensor: SensorConfig,
    metrics: Arc<HubMetrics>,
}

impl StateBroadcaster {
    pub fn new(config: BroadcastConfig, sensor: SensorConfig, metrics: Arc<HubMetrics>) -> Self {
        let (tx, _) = broadcast::channel(config.channel_capacity);
        let states = DeviceType::ALL
            .iter()
            .map(|t| (*t, DeviceState::DISCONNECTED))
            .collect();
        Self {
            inner: RwLock::new(BroadcasterInner {
                states,
                since_broadcast: 0,
            }),
            tx,
            config,
            sensor,
            metrics,
        }
    }

    /// Subscribe to hub fan-out (state updates plus presence events).
    pub fn subscribe(&self) -> broadcast::Receiver<HubMessage> {
        self.tx.subscribe()
    }

    /// Publish a message to all subscribed consumers.
    pub fn publish(&self, msg: HubMessage) {
        // Send fails only when no consumer is subscribed.
        let _ = self.tx.send(msg);
    }

    /// Apply a sensor reading. Receiving data implies presence, so the
    /// type is marked connected even if its registration was missed.
    pub async fn apply_reading(&self, sensor: DeviceType, value: Option<f64>) {
        let mut inner = self.inner.write().await;
        let entry = inner.states.get(&sensor).copied().unwrap_or_default();

        let valid = value.map(|v| self.sensor.is_valid(v)).unwrap_or(false);
        let next = DeviceState {
            connected: true,
            valid,
            value,
        };
        if !entry.connected {
            trace!(%sensor, "reading implies presence");
        }
        let meaningful = !entry.connected || next.valid != entry.valid;
        inner.states.insert(sensor, next);
        inner.since_broadcast += 1;

        if meaningful || inner.since_broadcast >= self.config.every_messages {
            inner.since_broadcast = 0;
            let states = inner.states.clone();
            drop(inner);
            self.broadcast_states(states);
        } else {
            self.metrics.broadcast_suppressed();
        }
    }

    /// Apply a presence change. Always broadcasts: connectivity flips
    /// are meaningful by definition. Disconnection clears validity and
    /// the last value.
    pub async fn apply_connection_change(&self, sensor: DeviceType, connected: bool) {
        let mut inner = self.inner.write().await;
        let next = if connected {
            DeviceState {
                connected: true,
                valid: false,
                value: None,
            }
        } else {
            DeviceState::DISCONNECTED
        };
        inner.states.insert(sensor, next);
        inner.since_broadcast = 0;
        let states = inner.states.clone();
        drop(inner);
        debug!(%sensor, connected, "presence change");
        self.broadcast_states(states);
    }

    /// Current state table, for snapshot replies to consumers.
    pub async fn snapshot(&self) -> BTreeMap<DeviceType, DeviceState> {
        self.inner.read().await.states.clone()
    }

    fn broadcast_states(&self, states: BTreeMap<DeviceType, DeviceState>) {
        self.metrics.broadcast_sent();
        let _ = self.tx.send(HubMessage::StateUpdate { states });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BroadcastFileConfig, SensorFileConfig};

    fn broadcaster() -> StateBroadcaster {
        StateBroadcaster::new(
            BroadcastConfig::from_file(&BroadcastFileConfig::default()),
            SensorConfig::from_file(&SensorFileConfig::default()),
            Arc::new(HubMetrics::new()),
        )
    }

    async fn state_of(b: &StateBroadcaster, t: DeviceType) -> DeviceState {
        b.snapshot().await[&t]
    }

    #[tokio::test]
    async fn reading_implies_presence() {
        let b = broadcaster();
        let mut rx = b.subscribe();
        b.apply_reading(DeviceType::Soil, Some(0.5)).await;
        let s = state_of(&b, DeviceType::Soil).await;
        assert!(s.connected && s.valid);
        // Presence flip is meaningful: broadcast right away.
        assert!(matches!(
            rx.recv().await.unwrap(),
            HubMessage::StateUpdate { .. }
        ));
    }

    #[tokio::test]
    async fn disconnect_clears_validity_and_value() {
        let b = broadcaster();
        b.apply_connection_change(DeviceType::Soil, true).await;
        b.apply_reading(DeviceType::Soil, Some(0.5)).await;
        let s = state_of(&b, DeviceType::Soil).await;
        assert!(s.connected && s.valid);
        assert_eq!(s.value, Some(0.5));

        b.apply_connection_change(DeviceType::Soil, false).await;
        let s = state_of(&b, DeviceType::Soil).await;
        assert_eq!(s, DeviceState::DISCONNECTED);
    }

    #[tokio::test]
    async fn out_of_range_reading_is_connected_but_invalid() {
        let b = broadcaster();
        b.apply_connection_change(DeviceType::Light, true).await;
        b.apply_reading(DeviceType::Light, Some(0.95)).await;
        let s = state_of(&b, DeviceType::Light).await;
        assert!(s.connected);
        assert!(!s.valid);
        assert_eq!(s.value, Some(0.95));
    }

    #[tokio::test]
    async fn validity_flip_broadcasts_immediately() {
        let b = broadcaster();
        let mut rx = b.subscribe();
        b.apply_connection_change(DeviceType::Soil, true).await;
        rx.recv().await.unwrap();

        // invalid -> valid is a meaningful transition
        b.apply_reading(DeviceType::Soil, Some(0.5)).await;
        let msg = rx.recv().await.unwrap();
        match msg {
            HubMessage::StateUpdate { states } => {
                assert!(states[&DeviceType::Soil].valid);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn value_only_updates_are_rate_limited() {
        let b = broadcaster();
        b.apply_connection_change(DeviceType::Soil, true).await;
        b.apply_reading(DeviceType::Soil, Some(0.5)).await; // valid flip, resets counter
        let mut rx = b.subscribe();

        // Four value-only updates: all within the same valid band, no broadcast.
        for v in [0.51, 0.52, 0.53, 0.54] {
            b.apply_reading(DeviceType::Soil, Some(v)).await;
        }
        assert!(rx.try_recv().is_err());

        // Fifth message hits the periodic threshold.
        b.apply_reading(DeviceType::Soil, Some(0.55)).await;
        let msg = rx.recv().await.unwrap();
        match msg {
            HubMessage::StateUpdate { states } => {
                assert_eq!(states[&DeviceType::Soil].value, Some(0.55));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn reading_without_value_invalidates() {
        let b = broadcaster();
        b.apply_connection_change(DeviceType::Temperature, true).await;
        b.apply_reading(DeviceType::Temperature, Some(0.6)).await;
        assert!(state_of(&b, DeviceType::Temperature).await.valid);

        b.apply_reading(DeviceType::Temperature, None).await;
        let s = state_of(&b, DeviceType::Temperature).await;
        assert!(s.connected);
        assert!(!s.valid);
        assert_eq!(s.value, None);
    }
}
