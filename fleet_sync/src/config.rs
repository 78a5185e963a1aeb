use std::time::Duration;

use fleet_ws::TransportConfig;

use crate::notifications::NotificationFilter;

/// Reconnect delay schedule: `min(base * 2^attempt, max)`, then jittered
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.2 = ±20%); 0 disables it
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_delay: Duration::from_millis(500), max_delay: Duration::from_secs(30), jitter: 0.2 }
    }
}

impl BackoffConfig {
    /// Retry quickly; for dashboards on a local network
    pub fn aggressive() -> Self {
        Self { base_delay: Duration::from_millis(100), max_delay: Duration::from_secs(5), jitter: 0.2 }
    }

    pub fn conservative() -> Self {
        Self { base_delay: Duration::from_secs(2), max_delay: Duration::from_secs(120), jitter: 0.2 }
    }

    /// No jitter, so delays are reproducible
    pub fn deterministic(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay, jitter: 0.0 }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL the topic endpoint paths are appended to, e.g. `wss://api.example.com`
    pub ws_base_url: String,
    pub transport: TransportConfig,
    pub backoff: BackoffConfig,
    /// Send `subscribe`/`unsubscribe` control frames for each topic on an endpoint
    pub handshake_frames: bool,
    /// Raise a connection-lost alert after this many consecutive failed attempts
    pub alert_after_attempts: Option<u32>,
    /// Capacity of the `SyncEvent` broadcast channel
    pub event_capacity: usize,
    pub notification_filter: NotificationFilter,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ws_base_url: "ws://localhost:8080".to_string(),
            transport: TransportConfig::default(),
            backoff: BackoffConfig::default(),
            handshake_frames: false,
            alert_after_attempts: Some(5),
            event_capacity: 256,
            notification_filter: NotificationFilter::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self { ws_base_url: ws_base_url.into(), ..Default::default() }
    }

    /// Full WebSocket URL for an endpoint path
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}/{}", self.ws_base_url.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}
