//! Wire protocol for hub <-> device/consumer communication
//!
//! All messages are JSON with a `type` discriminator. Devices and
//! consumers share one inbound enum; the first message on a channel
//! decides the role (`register_esp` makes it a device, anything else a
//! consumer).

use crate::device::DeviceType;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Messages the hub accepts from devices and consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Consumer greeting. `client` is a free-form label for logs.
    Hello {
        #[serde(default)]
        client: Option<String>,
    },
    /// Device registration. The name resolves the device type.
    RegisterEsp { name: String },
    /// A sensor reading from a registered device.
    SensorData {
        sensor: DeviceType,
        name: String,
        /// None when the device reports without a usable sample.
        #[serde(default)]
        value: Option<f64>,
    },
    /// Application-level liveness probe from a peer.
    Ping { timestamp: u64 },
    /// Device response to a hub ping.
    Pong { timestamp: u64 },
    /// Consumer request for a full presence snapshot.
    GetEspStatus,
}

/// Messages the hub sends to devices and consumers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    /// Greeting reply carrying the channel's assigned id.
    Welcome { client_id: String },
    /// A device became present (registered, or returned within grace).
    EspConnected { name: String },
    /// A device's absence was confirmed after the grace period.
    EspDisconnected { name: String, reason: DisconnectReason },
    /// A sensor reading relayed to consumers.
    SensorData {
        sensor: DeviceType,
        name: String,
        value: Option<f64>,
    },
    /// Application-level liveness probe to a device.
    Ping { timestamp: u64 },
    /// Reply to an inbound ping.
    Pong { timestamp: u64 },
    /// Full composite state snapshot, keyed by device type.
    StateUpdate {
        states: BTreeMap<DeviceType, DeviceState>,
    },
    /// Protocol error reported back to the peer.
    Error { message: String },
}

/// Why a device's presence ended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectReason {
    /// The channel closed and the grace period elapsed.
    ChannelClosed,
    /// No pong within the response timeout.
    HeartbeatTimeout,
    /// No activity of any kind within the absolute timeout.
    ActivityTimeout,
}

/// Per-device-type state as broadcast to consumers.
///
/// Invariant: `valid` implies `connected`; a disconnected entry always
/// reads `{connected: false, valid: false, value: None}`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct DeviceState {
    pub connected: bool,
    pub valid: bool,
    #[serde(default)]
    pub value: Option<f64>,
}

impl DeviceState {
    pub const DISCONNECTED: DeviceState = DeviceState {
        connected: false,
        valid: false,
        value: None,
    };
}

impl Default for DeviceState {
    fn default() -> Self {
        Self::DISCONNECTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inbound_register_wire_format() {
        let json = r#"{"type":"register_esp","name":"soilTune-01"}"#;
        let msg: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            Inbound::RegisterEsp {
                name: "soilTune-01".to_string()
            }
        );
    }

    #[test]
    fn inbound_sensor_data_allows_missing_value() {
        let json = r#"{"type":"sensor_data","sensor":"light","name":"lightTune"}"#;
        let msg: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            Inbound::SensorData {
                sensor: DeviceType::Light,
                name: "lightTune".to_string(),
                value: None,
            }
        );
    }

    #[test]
    fn hello_client_is_optional() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"hello"}"#).unwrap();
        assert_eq!(msg, Inbound::Hello { client: None });
    }

    #[test]
    fn state_update_wire_format() {
        let mut states = BTreeMap::new();
        states.insert(
            DeviceType::Soil,
            DeviceState {
                connected: true,
                valid: true,
                value: Some(0.55),
            },
        );
        states.insert(DeviceType::Light, DeviceState::DISCONNECTED);
        let msg = HubMessage::StateUpdate { states };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"state_update""#));
        assert!(json.contains(r#""soil":{"connected":true,"valid":true,"value":0.55}"#));

        let back: HubMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn disconnect_reason_wire_format() {
        let msg = HubMessage::EspDisconnected {
            name: "tempTune".to_string(),
            reason: DisconnectReason::HeartbeatTimeout,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""reason":"heartbeat_timeout""#));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(serde_json::from_str::<Inbound>(r#"{"type":"bogus"}"#).is_err());
        assert!(serde_json::from_str::<Inbound>("not json").is_err());
    }
}
