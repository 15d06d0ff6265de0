//! Consumer client: follow the hub and resolve scenes
//!
//! Connects to the hub, mirrors device presence, stabilizes per-sensor
//! activity from raw readings, and logs every composite scene change.
//! The link is driven by the reconnect manager; SIGHUP forces an
//! immediate reconnect at any point, including out of offline mode.

use crate::client::reconnect::{LinkState, ReconnectDecision, ReconnectManager};
use crate::client::resolver::{CompositeStateResolver, Resolution};
use crate::client::stabilizer::SensorStabilizer;
use crate::config::{SensorConfig, VerdantConfig};
use crate::device::DeviceType;
use crate::hub::protocol::{DeviceState, HubMessage, Inbound};
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use std::collections::BTreeMap;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Consumer-side view of the installation: presence per device type,
/// a stabilizer per sensor, and the scene resolver on top.
pub struct Mirror {
    entries: BTreeMap<DeviceType, Entry>,
    resolver: CompositeStateResolver,
    sensor: SensorConfig,
}

struct Entry {
    connected: bool,
    stabilizer: SensorStabilizer,
}

impl Mirror {
    pub fn new(sensor: &SensorConfig) -> Self {
        let entries = DeviceType::ALL
            .iter()
            .map(|t| {
                (
                    *t,
                    Entry {
                        connected: false,
                        stabilizer: SensorStabilizer::new(sensor),
                    },
                )
            })
            .collect();
        Self {
            entries,
            resolver: CompositeStateResolver::new(),
            sensor: sensor.clone(),
        }
    }

    /// A raw reading arrived. Returns a resolution if the stabilized
    /// activity flipped and that changed the scene or mute set.
    pub fn on_reading(
        &mut self,
        sensor: DeviceType,
        value: Option<f64>,
        now: Instant,
    ) -> Option<Resolution> {
        let entry = self.entries.get_mut(&sensor)?;
        if !entry.connected {
            return None;
        }
        let sample = value.map(|v| self.sensor.is_valid(v)).unwrap_or(false);
        let committed = entry.stabilizer.push(sample, now)?;
        self.resolver.update(sensor, committed)
    }

    /// Presence changed for a device type. A disconnect clears the
    /// stabilizer outright; stale samples must not survive a gap.
    pub fn on_connection(&mut self, sensor: DeviceType, connected: bool) -> Option<Resolution> {
        if let Some(entry) = self.entries.get_mut(&sensor) {
            entry.connected = connected;
            if !connected {
                entry.stabilizer.reset();
                return self.resolver.update(sensor, false);
            }
        }
        None
    }

    /// Apply a full state snapshot from the hub.
    pub fn on_snapshot(
        &mut self,
        states: &BTreeMap<DeviceType, DeviceState>,
    ) -> Vec<Resolution> {
        let mut changes = Vec::new();
        for (sensor, state) in states {
            if let Some(res) = self.on_connection(*sensor, state.connected) {
                changes.push(res);
            }
        }
        changes
    }

    /// Drop all mirrored state, as after losing the link.
    pub fn reset(&mut self) {
        for entry in self.entries.values_mut() {
            entry.connected = false;
            entry.stabilizer.reset();
        }
        for sensor in DeviceType::ALL {
            self.resolver.update(sensor, false);
        }
    }

    pub fn current(&self) -> &Resolution {
        self.resolver.current()
    }
}

fn announce(res: &Resolution) {
    let muted: Vec<&str> = res.muted.iter().map(|d| d.as_str()).collect();
    info!(scene = %res.scene, ?muted, "scene changed");
}

enum SessionEnd {
    Dropped,
    ForceReconnect,
}

/// Run the consumer until the process is stopped.
pub async fn run(url: String, config: VerdantConfig) -> Result<()> {
    let mut manager = ReconnectManager::new(config.link.clone());
    let mut sighup = signal(SignalKind::hangup())?;
    let mut mirror = Mirror::new(&config.sensor);

    loop {
        if manager.state() == LinkState::Offline {
            warn!("link offline; send SIGHUP to retry");
            sighup.recv().await;
            manager.force_reconnect();
        }

        info!(%url, "connecting to hub");
        match connect_async(url.as_str()).await {
            Ok((ws, _)) => {
                manager.on_connected();
                mirror.reset();
                info!("connected");
                match session(ws, &mut mirror, &mut sighup).await {
                    SessionEnd::ForceReconnect => {
                        manager.force_reconnect();
                        continue;
                    }
                    SessionEnd::Dropped => {
                        warn!("link dropped");
                        mirror.reset();
                    }
                }
            }
            Err(err) => {
                warn!(%err, "connection failed");
            }
        }

        match manager.on_disconnected() {
            ReconnectDecision::Retry { delay } => {
                info!(delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = sighup.recv() => {
                        manager.force_reconnect();
                    }
                }
            }
            ReconnectDecision::GiveUp => {}
        }
    }
}

async fn session(
    ws: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mirror: &mut Mirror,
    sighup: &mut tokio::signal::unix::Signal,
) -> SessionEnd {
    let (mut sink, mut stream) = ws.split();

    let hello = serde_json::to_string(&Inbound::Hello {
        client: Some("verdant-listen".to_string()),
    });
    let status = serde_json::to_string(&Inbound::GetEspStatus);
    for msg in [hello, status].into_iter().flatten() {
        if sink.send(Message::Text(msg.into())).await.is_err() {
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, forcing reconnect");
                let _ = sink.close().await;
                return SessionEnd::ForceReconnect;
            }
            frame = stream.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            return SessionEnd::Dropped;
                        }
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        warn!(%err, "read error");
                        return SessionEnd::Dropped;
                    }
                };
                let msg = match serde_json::from_str::<HubMessage>(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        warn!(%err, "malformed hub message");
                        continue;
                    }
                };
                match msg {
                    HubMessage::Welcome { client_id } => {
                        debug!(%client_id, "welcomed by hub");
                    }
                    HubMessage::StateUpdate { states } => {
                        for res in mirror.on_snapshot(&states) {
                            announce(&res);
                        }
                    }
                    HubMessage::EspConnected { name } => {
                        info!(device = %name, "device present");
                        if let Some(sensor) = DeviceType::from_name(&name) {
                            if let Some(res) = mirror.on_connection(sensor, true) {
                                announce(&res);
                            }
                        }
                    }
                    HubMessage::EspDisconnected { name, reason } => {
                        info!(device = %name, ?reason, "device gone");
                        if let Some(sensor) = DeviceType::from_name(&name) {
                            if let Some(res) = mirror.on_connection(sensor, false) {
                                announce(&res);
                            }
                        }
                    }
                    HubMessage::SensorData { sensor, value, .. } => {
                        debug!(%sensor, ?value, "reading");
                        if let Some(res) = mirror.on_reading(sensor, value, Instant::now()) {
                            announce(&res);
                        }
                    }
                    HubMessage::Ping { timestamp } => {
                        let pong = serde_json::to_string(&Inbound::Pong { timestamp });
                        if let Ok(pong) = pong {
                            if sink.send(Message::Text(pong.into())).await.is_err() {
                                return SessionEnd::Dropped;
                            }
                        }
                    }
                    HubMessage::Pong { .. } => {}
                    HubMessage::Error { message } => {
                        warn!(%message, "hub reported an error");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::resolver::Scene;
    use crate::config::SensorFileConfig;

    fn mirror() -> Mirror {
        Mirror::new(&SensorConfig::from_file(&SensorFileConfig::default()))
    }

    fn connect(m: &mut Mirror, sensor: DeviceType) {
        m.on_connection(sensor, true);
    }

    #[tokio::test(start_paused = true)]
    async fn readings_before_presence_are_ignored() {
        let mut m = mirror();
        for _ in 0..5 {
            assert!(m
                .on_reading(DeviceType::Soil, Some(0.5), Instant::now())
                .is_none());
        }
        assert_eq!(m.current().scene, Scene::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn stabilized_activity_drives_the_scene() {
        let mut m = mirror();
        connect(&mut m, DeviceType::Soil);

        assert!(m.on_reading(DeviceType::Soil, Some(0.5), Instant::now()).is_none());
        assert!(m.on_reading(DeviceType::Soil, Some(0.6), Instant::now()).is_none());
        let res = m
            .on_reading(DeviceType::Soil, Some(0.7), Instant::now())
            .unwrap();
        assert_eq!(res.scene, Scene::Soil);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_drops_activity_immediately() {
        let mut m = mirror();
        connect(&mut m, DeviceType::Light);
        for _ in 0..3 {
            m.on_reading(DeviceType::Light, Some(0.5), Instant::now());
        }
        assert_eq!(m.current().scene, Scene::Light);

        let res = m.on_connection(DeviceType::Light, false).unwrap();
        assert_eq!(res.scene, Scene::Idle);

        // Stale agreement must not resurface on reconnect.
        connect(&mut m, DeviceType::Light);
        assert!(m.on_reading(DeviceType::Light, Some(0.5), Instant::now()).is_none());
        assert!(m.on_reading(DeviceType::Light, Some(0.5), Instant::now()).is_none());
        assert!(m
            .on_reading(DeviceType::Light, Some(0.5), Instant::now())
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn two_active_sensors_resolve_a_pair() {
        let mut m = mirror();
        connect(&mut m, DeviceType::Soil);
        connect(&mut m, DeviceType::Temperature);
        for _ in 0..3 {
            m.on_reading(DeviceType::Soil, Some(0.5), Instant::now());
        }
        tokio::time::advance(std::time::Duration::from_millis(1100)).await;
        for _ in 0..3 {
            m.on_reading(DeviceType::Temperature, Some(0.6), Instant::now());
        }
        let res = m.current();
        assert_eq!(res.scene, Scene::Mire);
        assert!(res.muted.contains(&DeviceType::Soil));
        assert!(res.muted.contains(&DeviceType::Temperature));
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_disconnect_resets() {
        let mut m = mirror();
        connect(&mut m, DeviceType::Soil);
        for _ in 0..3 {
            m.on_reading(DeviceType::Soil, Some(0.5), Instant::now());
        }
        let mut states = BTreeMap::new();
        states.insert(DeviceType::Soil, DeviceState::DISCONNECTED);
        let changes = m.on_snapshot(&states);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].scene, Scene::Idle);
    }
}
