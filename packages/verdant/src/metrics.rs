//! Hub metrics for observability
//!
//! Runtime counters exposed at `/api/metrics`.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Hub-wide metrics
#[derive(Debug, Default)]
pub struct HubMetrics {
    // Connection metrics
    /// Currently open WebSocket connections (devices + consumers)
    pub active_connections: AtomicU64,
    /// Total connections since hub start
    pub total_connections: AtomicU64,

    // Device metrics
    /// Devices currently considered present
    pub devices_present: AtomicU64,
    /// Device registrations since hub start (including re-registrations)
    pub devices_registered: AtomicU64,
    /// Confirmed disconnections (grace period elapsed)
    pub devices_disconnected: AtomicU64,
    /// Channels terminated by heartbeat timeout
    pub heartbeat_timeouts: AtomicU64,

    // Message metrics
    /// Sensor readings received from devices
    pub readings_received: AtomicU64,
    /// Inbound messages discarded (malformed, unknown device)
    pub messages_discarded: AtomicU64,
    /// State broadcasts published to consumers
    pub broadcasts_sent: AtomicU64,
    /// Broadcasts suppressed by the rate policy
    pub broadcasts_suppressed: AtomicU64,

    /// Hub start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn device_registered(&self) {
        self.devices_registered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_present(&self) {
        self.devices_present.fetch_add(1, Ordering::Relaxed);
    }

    pub fn device_disconnected(&self) {
        self.devices_present.fetch_sub(1, Ordering::Relaxed);
        self.devices_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn heartbeat_timeout(&self) {
        self.heartbeat_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reading_received(&self) {
        self.readings_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_discarded(&self) {
        self.messages_discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_sent(&self) {
        self.broadcasts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broadcast_suppressed(&self) {
        self.broadcasts_suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            devices: DeviceMetrics {
                present: self.devices_present.load(Ordering::Relaxed),
                registered: self.devices_registered.load(Ordering::Relaxed),
                disconnected: self.devices_disconnected.load(Ordering::Relaxed),
                heartbeat_timeouts: self.heartbeat_timeouts.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                readings: self.readings_received.load(Ordering::Relaxed),
                discarded: self.messages_discarded.load(Ordering::Relaxed),
                broadcasts_sent: self.broadcasts_sent.load(Ordering::Relaxed),
                broadcasts_suppressed: self.broadcasts_suppressed.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub devices: DeviceMetrics,
    pub messages: MessageMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub present: u64,
    pub registered: u64,
    pub disconnected: u64,
    pub heartbeat_timeouts: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub readings: u64,
    pub discarded: u64,
    pub broadcasts_sent: u64,
    pub broadcasts_suppressed: u64,
}

/// Health status for `/healthz`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub devices_present: u64,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = HubMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_device_tracking() {
        let metrics = HubMetrics::new();

        metrics.device_registered();
        metrics.device_present();
        assert_eq!(metrics.devices_present.load(Ordering::Relaxed), 1);

        metrics.device_disconnected();
        assert_eq!(metrics.devices_present.load(Ordering::Relaxed), 0);
        assert_eq!(metrics.devices_disconnected.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = HubMetrics::new();
        metrics.connection_opened();
        metrics.reading_received();
        metrics.broadcast_sent();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.messages.readings, 1);
        assert_eq!(snapshot.messages.broadcasts_sent, 1);
    }
}
