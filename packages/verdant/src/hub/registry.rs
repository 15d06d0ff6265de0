//! Presence registry actor
//!
//! Owns every device record and serializes all presence mutations
//! through one command channel, so connect/disconnect races (flapping
//! sockets, duplicate registrations, heartbeat expiry during a
//! reconnect) resolve in arrival order with no locking.
//!
//! Presence lifecycle: a registered device stays present across a
//! short grace period after its channel drops. Only when the grace
//! period elapses without a re-registration is the disconnect
//! confirmed, published to consumers, and the record removed. A device
//! returning within grace produces no events at all.

use crate::config::PresenceConfig;
use crate::device::DeviceType;
use crate::hub::broadcaster::StateBroadcaster;
use crate::hub::heartbeat::{HeartbeatPolicy, HeartbeatState, HeartbeatVerdict};
use crate::hub::protocol::{DisconnectReason, HubMessage};
use crate::metrics::HubMetrics;
use crate::scheduler::{Scheduler, TimerKey, TimerPurpose};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("device name '{0}' does not resolve to a known sensor type")]
    UnknownDeviceType(String),
    #[error("registry unavailable")]
    Unavailable,
}

/// The socket-side handle the registry keeps for a present device.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    pub connection_id: Uuid,
    pub sender: mpsc::Sender<HubMessage>,
    pub cancel: CancellationToken,
}

struct DeviceRecord {
    name: String,
    device_type: DeviceType,
    /// None while the device is inside its disconnect grace period.
    channel: Option<ChannelHandle>,
    last_seen: Instant,
    heartbeat: HeartbeatState,
}

/// Presence summary returned to status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub device_type: DeviceType,
    pub connected: bool,
    pub idle_ms: u64,
}

pub enum RegistryCommand {
    /// A channel identified itself as a device.
    Identify {
        channel: ChannelHandle,
        name: String,
        respond_to: oneshot::Sender<Result<DeviceType, RegistryError>>,
    },
    /// Any inbound traffic from a device channel.
    Activity { connection_id: Uuid },
    /// Heartbeat pong from a device channel.
    Pong { connection_id: Uuid },
    /// A device channel closed (socket gone or task ended).
    ChannelClosed { connection_id: Uuid },
    /// Deferred: heartbeat cycle for a device.
    HeartbeatTick { name: String },
    /// Deferred: a disconnect grace period ran out.
    GraceExpired {
        name: String,
        reason: DisconnectReason,
    },
    /// Presence snapshot for status queries.
    Devices {
        respond_to: oneshot::Sender<Vec<DeviceInfo>>,
    },
}

pub struct Registry {
    rx: mpsc::Receiver<RegistryCommand>,
    scheduler: Scheduler<RegistryCommand>,
    devices: HashMap<String, DeviceRecord>,
    /// connection id -> device name, for channel-scoped commands.
    by_connection: HashMap<Uuid, String>,
    config: PresenceConfig,
    heartbeat: HeartbeatPolicy,
    broadcaster: Arc<StateBroadcaster>,
    metrics: Arc<HubMetrics>,
}

impl Registry {
    pub fn spawn(
        config: PresenceConfig,
        heartbeat: HeartbeatPolicy,
        broadcaster: Arc<StateBroadcaster>,
        metrics: Arc<HubMetrics>,
    ) -> RegistryHandle {
        let (tx, rx) = mpsc::channel(256);
        let registry = Registry {
            rx,
            scheduler: Scheduler::new(tx.clone()),
            devices: HashMap::new(),
            by_connection: HashMap::new(),
            config,
            heartbeat,
            broadcaster,
            metrics,
        };
        tokio::spawn(registry.run());
        RegistryHandle { tx }
    }

    async fn run(mut self) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => self.handle(cmd).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => self.sweep().await,
            }
        }
        debug!("registry actor stopped");
    }

    async fn handle(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Identify {
                channel,
                name,
                respond_to,
            } => {
                let result = self.identify(channel, name).await;
                let _ = respond_to.send(result);
            }
            RegistryCommand::Activity { connection_id } => {
                if let Some(record) = self.record_for_connection(&connection_id) {
                    record.last_seen = Instant::now();
                }
            }
            RegistryCommand::Pong { connection_id } => {
                let now = Instant::now();
                if let Some(record) = self.record_for_connection(&connection_id) {
                    record.last_seen = now;
                    record.heartbeat.on_pong(now);
                }
            }
            RegistryCommand::ChannelClosed { connection_id } => {
                self.channel_closed(connection_id);
            }
            RegistryCommand::HeartbeatTick { name } => {
                self.heartbeat_tick(name).await;
            }
            RegistryCommand::GraceExpired { name, reason } => {
                self.grace_expired(name, reason).await;
            }
            RegistryCommand::Devices { respond_to } => {
                let now = Instant::now();
                let mut infos: Vec<DeviceInfo> = self
                    .devices
                    .values()
                    .map(|r| DeviceInfo {
                        name: r.name.clone(),
                        device_type: r.device_type,
                        connected: r.channel.is_some(),
                        idle_ms: now.duration_since(r.last_seen).as_millis() as u64,
                    })
                    .collect();
                infos.sort_by(|a, b| a.name.cmp(&b.name));
                let _ = respond_to.send(infos);
            }
        }
    }

    async fn identify(
        &mut self,
        channel: ChannelHandle,
        name: String,
    ) -> Result<DeviceType, RegistryError> {
        let device_type = DeviceType::from_name(&name)
            .ok_or_else(|| RegistryError::UnknownDeviceType(name.clone()))?;
        let now = Instant::now();
        self.metrics.device_registered();

        match self.devices.get_mut(&name) {
            // Returning within grace: cancel the pending disconnect and
            // reattach. Consumers never learn the device was gone.
            Some(record) if record.channel.is_none() => {
                self.scheduler
                    .cancel(&TimerKey::new(name.as_str(), TimerPurpose::DisconnectGrace));
                self.by_connection
                    .insert(channel.connection_id, name.clone());
                record.channel = Some(channel);
                record.last_seen = now;
                record.heartbeat = HeartbeatState::new(now);
                info!(device = %name, "device returned within grace");
            }
            // Duplicate name on a live channel: the new channel wins,
            // the old one is terminated. Presence is continuous.
            Some(record) => {
                if let Some(old) = record.channel.take() {
                    warn!(device = %name, "duplicate registration, closing previous channel");
                    self.by_connection.remove(&old.connection_id);
                    old.cancel.cancel();
                }
                self.by_connection
                    .insert(channel.connection_id, name.clone());
                record.channel = Some(channel);
                record.last_seen = now;
                record.heartbeat = HeartbeatState::new(now);
            }
            // Fresh registration: record it and tell consumers.
            None => {
                self.by_connection
                    .insert(channel.connection_id, name.clone());
                self.devices.insert(
                    name.clone(),
                    DeviceRecord {
                        name: name.clone(),
                        device_type,
                        channel: Some(channel),
                        last_seen: now,
                        heartbeat: HeartbeatState::new(now),
                    },
                );
                self.metrics.device_present();
                info!(device = %name, %device_type, "device registered");
                self.broadcaster
                    .apply_connection_change(device_type, true)
                    .await;
                self.broadcaster
                    .publish(HubMessage::EspConnected { name: name.clone() });
            }
        }

        self.scheduler.arm(
            TimerKey::new(name.as_str(), TimerPurpose::Heartbeat),
            self.heartbeat.ping_interval(),
            RegistryCommand::HeartbeatTick { name },
        );
        Ok(device_type)
    }

    /// Detach the channel and start the grace clock. Stale close
    /// notifications from a superseded channel are ignored.
    fn channel_closed(&mut self, connection_id: Uuid) {
        let Some(name) = self.by_connection.remove(&connection_id) else {
            return;
        };
        let Some(record) = self.devices.get_mut(&name) else {
            return;
        };
        let current = record
            .channel
            .as_ref()
            .is_some_and(|c| c.connection_id == connection_id);
        if !current {
            return;
        }
        record.channel = None;
        self.begin_grace(name, DisconnectReason::ChannelClosed);
    }

    fn begin_grace(&mut self, name: String, reason: DisconnectReason) {
        self.scheduler
            .cancel(&TimerKey::new(name.as_str(), TimerPurpose::Heartbeat));
        let armed = self.scheduler.arm_if_absent(
            TimerKey::new(name.as_str(), TimerPurpose::DisconnectGrace),
            self.config.grace,
            RegistryCommand::GraceExpired {
                name: name.clone(),
                reason,
            },
        );
        if armed {
            debug!(device = %name, ?reason, "grace period started");
        }
    }

    async fn heartbeat_tick(&mut self, name: String) {
        let now = Instant::now();
        let Some(record) = self.devices.get_mut(&name) else {
            return;
        };
        let Some(channel) = record.channel.as_ref() else {
            return;
        };
        match self.heartbeat.on_tick(&mut record.heartbeat, now) {
            HeartbeatVerdict::SendPing => {
                let ping = HubMessage::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis() as u64,
                };
                if channel.sender.send(ping).await.is_err() {
                    // Channel task already gone; let ChannelClosed handle it.
                    return;
                }
                self.scheduler.arm(
                    TimerKey::new(name.as_str(), TimerPurpose::Heartbeat),
                    self.heartbeat.ping_interval(),
                    RegistryCommand::HeartbeatTick { name },
                );
            }
            HeartbeatVerdict::Expired => {
                warn!(device = %name, "heartbeat expired, closing channel");
                self.metrics.heartbeat_timeout();
                if let Some(old) = record.channel.take() {
                    self.by_connection.remove(&old.connection_id);
                    old.cancel.cancel();
                }
                self.begin_grace(name, DisconnectReason::HeartbeatTimeout);
            }
        }
    }

    async fn grace_expired(&mut self, name: String, reason: DisconnectReason) {
        let still_gone = self
            .devices
            .get(&name)
            .is_some_and(|r| r.channel.is_none());
        if !still_gone {
            return;
        }
        let Some(record) = self.devices.remove(&name) else {
            return;
        };
        self.scheduler.cancel_subject(&name);
        self.metrics.device_disconnected();
        info!(device = %name, ?reason, "disconnect confirmed");
        self.broadcaster
            .apply_connection_change(record.device_type, false)
            .await;
        self.broadcaster
            .publish(HubMessage::EspDisconnected { name, reason });
    }

    /// Periodic sweep: any device with a live channel but no traffic
    /// for the absolute activity timeout gets its channel closed and a
    /// grace period started.
    async fn sweep(&mut self) {
        let now = Instant::now();
        let stale: Vec<String> = self
            .devices
            .values()
            .filter(|r| {
                r.channel.is_some()
                    && now.duration_since(r.last_seen) >= self.config.activity_timeout
            })
            .map(|r| r.name.clone())
            .collect();
        for name in stale {
            warn!(device = %name, "no activity past timeout, closing channel");
            if let Some(record) = self.devices.get_mut(&name) {
                if let Some(old) = record.channel.take() {
                    self.by_connection.remove(&old.connection_id);
                    old.cancel.cancel();
                }
            }
            self.begin_grace(name, DisconnectReason::ActivityTimeout);
        }
    }

    fn record_for_connection(&mut self, connection_id: &Uuid) -> Option<&mut DeviceRecord> {
        let name = self.by_connection.get(connection_id)?;
        self.devices.get_mut(name)
    }
}

/// Cloneable handle to the registry actor.
#[derive(Clone)]
pub struct RegistryHandle {
    tx: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub async fn identify(
        &self,
        channel: ChannelHandle,
        name: String,
    ) -> Result<DeviceType, RegistryError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Identify {
                channel,
                name,
                respond_to,
            })
            .await
            .map_err(|_| RegistryError::Unavailable)?;
        rx.await.map_err(|_| RegistryError::Unavailable)?
    }

    pub async fn activity(&self, connection_id: Uuid) {
        let _ = self
            .tx
            .send(RegistryCommand::Activity { connection_id })
            .await;
    }

    pub async fn pong(&self, connection_id: Uuid) {
        let _ = self.tx.send(RegistryCommand::Pong { connection_id }).await;
    }

    pub async fn channel_closed(&self, connection_id: Uuid) {
        let _ = self
            .tx
            .send(RegistryCommand::ChannelClosed { connection_id })
            .await;
    }

    pub async fn devices(&self) -> Result<Vec<DeviceInfo>, RegistryError> {
        let (respond_to, rx) = oneshot::channel();
        self.tx
            .send(RegistryCommand::Devices { respond_to })
            .await
            .map_err(|_| RegistryError::Unavailable)?;
        rx.await.map_err(|_| RegistryError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BroadcastConfig, BroadcastFileConfig, HeartbeatConfig, SensorConfig, SensorFileConfig,
    };
    use std::time::Duration;
    use tokio::sync::broadcast;
    use tokio::time::sleep;

    fn presence_config() -> PresenceConfig {
        PresenceConfig {
            grace: Duration::from_millis(3000),
            sweep_interval: Duration::from_millis(2000),
            activity_timeout: Duration::from_millis(10_000),
        }
    }

    fn heartbeat_config() -> HeartbeatConfig {
        HeartbeatConfig {
            transport_interval: Duration::from_secs(30),
            transport_grace: Duration::from_secs(5),
            ping_interval: Duration::from_secs(15),
            response_timeout: Duration::from_secs(10),
        }
    }

    struct Harness {
        registry: RegistryHandle,
        events: broadcast::Receiver<HubMessage>,
    }

    fn harness() -> Harness {
        let broadcaster = Arc::new(StateBroadcaster::new(
            BroadcastConfig::from_file(&BroadcastFileConfig::default()),
            SensorConfig::from_file(&SensorFileConfig::default()),
            Arc::new(HubMetrics::new()),
        ));
        let events = broadcaster.subscribe();
        let registry = Registry::spawn(
            presence_config(),
            HeartbeatPolicy::new(heartbeat_config()),
            broadcaster,
            Arc::new(HubMetrics::new()),
        );
        Harness { registry, events }
    }

    fn channel() -> (ChannelHandle, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            ChannelHandle {
                connection_id: Uuid::new_v4(),
                sender: tx,
                cancel: CancellationToken::new(),
            },
            rx,
        )
    }

    /// Drain fan-out until a matching event arrives, skipping state updates.
    fn next_presence_event(rx: &mut broadcast::Receiver<HubMessage>) -> Option<HubMessage> {
        while let Ok(msg) = rx.try_recv() {
            match msg {
                HubMessage::StateUpdate { .. } => continue,
                other => return Some(other),
            }
        }
        None
    }

    #[tokio::test(start_paused = true)]
    async fn register_then_confirmed_disconnect() {
        let mut h = harness();
        let (ch, _rx) = channel();
        let id = ch.connection_id;

        let dt = h.registry.identify(ch, "soilTune-01".into()).await.unwrap();
        assert_eq!(dt, DeviceType::Soil);
        sleep(Duration::from_millis(10)).await;
        assert!(matches!(
            next_presence_event(&mut h.events),
            Some(HubMessage::EspConnected { .. })
        ));

        h.registry.channel_closed(id).await;
        // Still present inside the grace period.
        sleep(Duration::from_millis(2900)).await;
        assert!(next_presence_event(&mut h.events).is_none());
        let devices = h.registry.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].connected);

        // Grace elapses: exactly one disconnect, record removed.
        sleep(Duration::from_millis(200)).await;
        match next_presence_event(&mut h.events) {
            Some(HubMessage::EspDisconnected { name, reason }) => {
                assert_eq!(name, "soilTune-01");
                assert_eq!(reason, DisconnectReason::ChannelClosed);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(next_presence_event(&mut h.events).is_none());
        assert!(h.registry.devices().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn flap_within_grace_emits_no_events() {
        let mut h = harness();
        let (ch, _rx) = channel();
        let id = ch.connection_id;
        h.registry.identify(ch, "lightTune".into()).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        next_presence_event(&mut h.events); // consume EspConnected

        h.registry.channel_closed(id).await;
        sleep(Duration::from_millis(1500)).await;

        // Device comes back before the grace period ends.
        let (ch2, _rx2) = channel();
        h.registry.identify(ch2, "lightTune".into()).await.unwrap();

        // Well past where the original grace would have expired.
        sleep(Duration::from_millis(5000)).await;
        assert!(next_presence_event(&mut h.events).is_none());
        let devices = h.registry.devices().await.unwrap();
        assert_eq!(devices.len(), 1);
        assert!(devices[0].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_registration_supersedes_old_channel() {
        let mut h = harness();
        let (ch1, _rx1) = channel();
        let cancel1 = ch1.cancel.clone();
        let id1 = ch1.connection_id;
        h.registry.identify(ch1, "tempTune".into()).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        next_presence_event(&mut h.events);

        let (ch2, _rx2) = channel();
        h.registry.identify(ch2, "tempTune".into()).await.unwrap();
        sleep(Duration::from_millis(10)).await;

        assert!(cancel1.is_cancelled());
        // No presence events for the takeover.
        assert!(next_presence_event(&mut h.events).is_none());

        // A late close from the superseded channel must not start grace.
        h.registry.channel_closed(id1).await;
        sleep(Duration::from_millis(5000)).await;
        assert!(next_presence_event(&mut h.events).is_none());
        assert!(h.registry.devices().await.unwrap()[0].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_device_name_is_rejected() {
        let h = harness();
        let (ch, _rx) = channel();
        let err = h.registry.identify(ch, "mystery".into()).await.unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDeviceType(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn missed_pongs_terminate_and_disconnect() {
        let mut h = harness();
        let (ch, mut rx) = channel();
        let cancel = ch.cancel.clone();
        let id = ch.connection_id;
        h.registry.identify(ch, "soilTune".into()).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        next_presence_event(&mut h.events);

        // Keep activity fresh so the sweep never fires, but answer no
        // pings. First tick at 15s sends a ping; the tick at 30s finds
        // it unanswered past the 10s timeout.
        for _ in 0..6 {
            sleep(Duration::from_secs(5)).await;
            h.registry.activity(id).await;
        }
        sleep(Duration::from_millis(500)).await;
        assert!(matches!(rx.try_recv(), Ok(HubMessage::Ping { .. })));
        assert!(cancel.is_cancelled());

        // Grace then confirms the disconnect.
        sleep(Duration::from_millis(3100)).await;
        match next_presence_event(&mut h.events) {
            Some(HubMessage::EspDisconnected { reason, .. }) => {
                assert_eq!(reason, DisconnectReason::HeartbeatTimeout);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn silent_device_is_swept_out() {
        let mut h = harness();
        let (ch, _rx) = channel();
        h.registry.identify(ch, "lightTune".into()).await.unwrap();
        sleep(Duration::from_millis(10)).await;
        next_presence_event(&mut h.events);

        // No activity at all: the sweep closes the channel at ~10s and
        // grace confirms at ~13s. The heartbeat would also expire, but
        // the sweep fires first.
        sleep(Duration::from_millis(13_500)).await;
        match next_presence_event(&mut h.events) {
            Some(HubMessage::EspDisconnected { reason, .. }) => {
                assert!(matches!(
                    reason,
                    DisconnectReason::ActivityTimeout | DisconnectReason::HeartbeatTimeout
                ));
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
        assert!(h.registry.devices().await.unwrap().is_empty());
    }
}
