//! Device type identification
//!
//! Every remote sensor device carries a stable name (e.g. "soilTune-01").
//! The device type is resolved from that name exactly once, at
//! registration, via a fixed lookup table and carried on the device
//! record thereafter.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The three sensor categories the installation knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Soil,
    Light,
    Temperature,
}

impl DeviceType {
    /// All known device types, in canonical order.
    pub const ALL: [DeviceType; 3] = [
        DeviceType::Soil,
        DeviceType::Light,
        DeviceType::Temperature,
    ];

    /// Fixed name → type lookup. Matches the sensor tag embedded in the
    /// device name ("soilTune", "LightSensor", "temp-03", ...),
    /// case-insensitively. Returns None for unrecognized names.
    pub fn from_name(name: &str) -> Option<DeviceType> {
        let lower = name.to_ascii_lowercase();
        if lower.contains("soil") || lower.contains("moisture") {
            Some(DeviceType::Soil)
        } else if lower.contains("light") {
            Some(DeviceType::Light)
        } else if lower.contains("temp") {
            Some(DeviceType::Temperature)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Soil => "soil",
            DeviceType::Light => "light",
            DeviceType::Temperature => "temperature",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
