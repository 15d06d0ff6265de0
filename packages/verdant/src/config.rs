use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [presence]
//                    grace_ms = 3000
//
//   env var:         VERDANT_PRESENCE__GRACE_MS=3000   (double underscore = nesting)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub hub: HubFileConfig,
    #[serde(default)]
    pub presence: PresenceFileConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatFileConfig,
    #[serde(default)]
    pub broadcast: BroadcastFileConfig,
    #[serde(default)]
    pub sensor: SensorFileConfig,
    #[serde(default)]
    pub link: LinkFileConfig,
}

/// Hub bind settings (lives under `[hub]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HubFileConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HubFileConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Presence lifecycle tunables (lives under `[presence]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PresenceFileConfig {
    /// Grace period between an apparent disconnect and its confirmation.
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    /// Interval of the activity sweep for silently lost devices.
    #[serde(default = "default_sweep_ms")]
    pub sweep_ms: u64,
    /// Absolute inactivity timeout caught by the sweep.
    #[serde(default = "default_activity_timeout_ms")]
    pub activity_timeout_ms: u64,
}

impl Default for PresenceFileConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            sweep_ms: default_sweep_ms(),
            activity_timeout_ms: default_activity_timeout_ms(),
        }
    }
}

/// Heartbeat tunables (lives under `[heartbeat]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HeartbeatFileConfig {
    /// Transport-level ping interval, applied to every channel.
    #[serde(default = "default_transport_ping_secs")]
    pub transport_ping_secs: u64,
    /// Extra margin on top of 2x the transport interval before a silent
    /// peer is force-closed.
    #[serde(default = "default_transport_grace_secs")]
    pub transport_grace_secs: u64,
    /// Application-level ping interval, devices only.
    #[serde(default = "default_device_ping_secs")]
    pub device_ping_secs: u64,
    /// Pong response timeout, measured from the last successful pong.
    #[serde(default = "default_pong_timeout_secs")]
    pub pong_timeout_secs: u64,
}

impl Default for HeartbeatFileConfig {
    fn default() -> Self {
        Self {
            transport_ping_secs: default_transport_ping_secs(),
            transport_grace_secs: default_transport_grace_secs(),
            device_ping_secs: default_device_ping_secs(),
            pong_timeout_secs: default_pong_timeout_secs(),
        }
    }
}

/// Broadcast rate policy (lives under `[broadcast]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BroadcastFileConfig {
    /// Without a meaningful transition, broadcast at most once per this
    /// many received messages.
    #[serde(default = "default_broadcast_every")]
    pub every_messages: u32,
    /// Fan-out channel capacity per consumer.
    #[serde(default = "default_broadcast_capacity")]
    pub channel_capacity: usize,
}

impl Default for BroadcastFileConfig {
    fn default() -> Self {
        Self {
            every_messages: default_broadcast_every(),
            channel_capacity: default_broadcast_capacity(),
        }
    }
}

/// Sensor classification tunables (lives under `[sensor]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SensorFileConfig {
    /// Acceptance range for a reading to count as valid/active.
    #[serde(default = "default_valid_min")]
    pub valid_min: f64,
    #[serde(default = "default_valid_max")]
    pub valid_max: f64,
    /// Ring buffer size of the consumer-side stabilizer.
    #[serde(default = "default_window")]
    pub window: usize,
    /// How many most-recent samples must agree to count as stable.
    #[serde(default = "default_agreement")]
    pub agreement: usize,
    /// Minimum interval between committed transitions.
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
}

impl Default for SensorFileConfig {
    fn default() -> Self {
        Self {
            valid_min: default_valid_min(),
            valid_max: default_valid_max(),
            window: default_window(),
            agreement: default_agreement(),
            min_interval_ms: default_min_interval_ms(),
        }
    }
}

/// Consumer link tunables (lives under `[link]`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LinkFileConfig {
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_growth")]
    pub backoff_growth: f64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    /// Consecutive failures before the consumer goes offline.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for LinkFileConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: default_backoff_base_ms(),
            backoff_growth: default_backoff_growth(),
            backoff_cap_ms: default_backoff_cap_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_grace_ms() -> u64 {
    3000
}
fn default_sweep_ms() -> u64 {
    2000
}
fn default_activity_timeout_ms() -> u64 {
    10_000
}
fn default_transport_ping_secs() -> u64 {
    30
}
fn default_transport_grace_secs() -> u64 {
    5
}
fn default_device_ping_secs() -> u64 {
    15
}
fn default_pong_timeout_secs() -> u64 {
    10
}
fn default_broadcast_every() -> u32 {
    5
}
fn default_broadcast_capacity() -> usize {
    256
}
fn default_valid_min() -> f64 {
    0.4
}
fn default_valid_max() -> f64 {
    0.8
}
fn default_window() -> usize {
    5
}
fn default_agreement() -> usize {
    3
}
fn default_min_interval_ms() -> u64 {
    1000
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_backoff_growth() -> f64 {
    1.3
}
fn default_backoff_cap_ms() -> u64 {
    30_000
}
fn default_max_attempts() -> u32 {
    10
}

/// Build a figment that layers: defaults → config.toml → VERDANT_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `VERDANT_PRESENCE__GRACE_MS=5000`  →  `presence.grace_ms = 5000`
///   `VERDANT_HUB__PORT=9090`           →  `hub.port = 9090`
pub fn load_config(config_path: &Path) -> figment::Figment {
    use figment::{
        providers::{Env, Format, Serialized, Toml},
        Figment,
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_path))
        .merge(Env::prefixed("VERDANT_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout)
// =============================================================================

/// Presence registry configuration (runtime view).
#[derive(Clone, Debug)]
pub struct PresenceConfig {
    pub grace: Duration,
    pub sweep_interval: Duration,
    pub activity_timeout: Duration,
}

impl PresenceConfig {
    pub fn from_file(fc: &PresenceFileConfig) -> Self {
        Self {
            grace: Duration::from_millis(fc.grace_ms),
            sweep_interval: Duration::from_millis(fc.sweep_ms),
            activity_timeout: Duration::from_millis(fc.activity_timeout_ms),
        }
    }
}

/// Heartbeat configuration (runtime view).
#[derive(Clone, Debug)]
pub struct HeartbeatConfig {
    pub transport_interval: Duration,
    pub transport_grace: Duration,
    pub ping_interval: Duration,
    pub response_timeout: Duration,
}

impl HeartbeatConfig {
    pub fn from_file(fc: &HeartbeatFileConfig) -> Self {
        Self {
            transport_interval: Duration::from_secs(fc.transport_ping_secs),
            transport_grace: Duration::from_secs(fc.transport_grace_secs),
            ping_interval: Duration::from_secs(fc.device_ping_secs),
            response_timeout: Duration::from_secs(fc.pong_timeout_secs),
        }
    }

    /// A channel silent for longer than this is force-closed.
    pub fn transport_deadline(&self) -> Duration {
        self.transport_interval * 2 + self.transport_grace
    }
}

/// Broadcast policy configuration (runtime view).
#[derive(Clone, Debug)]
pub struct BroadcastConfig {
    pub every_messages: u32,
    pub channel_capacity: usize,
}

impl BroadcastConfig {
    pub fn from_file(fc: &BroadcastFileConfig) -> Self {
        Self {
            every_messages: fc.every_messages.max(1),
            channel_capacity: fc.channel_capacity,
        }
    }
}

/// Sensor classification configuration (runtime view).
#[derive(Clone, Debug)]
pub struct SensorConfig {
    pub valid_min: f64,
    pub valid_max: f64,
    pub window: usize,
    pub agreement: usize,
    pub min_interval: Duration,
}

impl SensorConfig {
    pub fn from_file(fc: &SensorFileConfig) -> Self {
        Self {
            valid_min: fc.valid_min,
            valid_max: fc.valid_max,
            window: fc.window.max(1),
            agreement: fc.agreement.max(1),
            min_interval: Duration::from_millis(fc.min_interval_ms),
        }
    }

    /// The acceptance-range predicate: is a reading value in the
    /// configured "active" band?
    pub fn is_valid(&self, value: f64) -> bool {
        value >= self.valid_min && value <= self.valid_max
    }
}

/// Consumer link configuration (runtime view).
#[derive(Clone, Debug)]
pub struct LinkConfig {
    pub backoff_base: Duration,
    pub backoff_growth: f64,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
}

impl LinkConfig {
    pub fn from_file(fc: &LinkFileConfig) -> Self {
        Self {
            backoff_base: Duration::from_millis(fc.backoff_base_ms),
            backoff_growth: fc.backoff_growth,
            backoff_cap: Duration::from_millis(fc.backoff_cap_ms),
            max_attempts: fc.max_attempts,
        }
    }
}

/// Fully resolved runtime configuration.
#[derive(Clone, Debug)]
pub struct VerdantConfig {
    pub host: String,
    pub port: u16,
    pub presence: PresenceConfig,
    pub heartbeat: HeartbeatConfig,
    pub broadcast: BroadcastConfig,
    pub sensor: SensorConfig,
    pub link: LinkConfig,
}

impl VerdantConfig {
    pub fn from_file(fc: &FileConfig) -> Self {
        Self {
            host: fc.hub.host.clone(),
            port: fc.hub.port,
            presence: PresenceConfig::from_file(&fc.presence),
            heartbeat: HeartbeatConfig::from_file(&fc.heartbeat),
            broadcast: BroadcastConfig::from_file(&fc.broadcast),
            sensor: SensorConfig::from_file(&fc.sensor),
            link: LinkConfig::from_file(&fc.link),
        }
    }

    pub fn load(config_path: &Path) -> Result<Self> {
        let fc: FileConfig = load_config(config_path).extract()?;
        Ok(Self::from_file(&fc))
    }
}
