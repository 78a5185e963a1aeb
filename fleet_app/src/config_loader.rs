use std::path::Path;
use std::time::Duration;

use config::Config;
use config::ConfigError;
use config::Environment;
use config::File;
use fleet_sync::BackoffConfig;
use fleet_sync::NotificationFilter;
use fleet_sync::SyncConfig;
use fleet_types::Topic;
use fleet_ws::TransportConfig;
use serde::Deserialize;

pub const ENV_PREFIX: &str = "FLEET";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BackoffSection {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for BackoffSection {
    fn default() -> Self {
        Self { base_delay_ms: 500, max_delay_ms: 30_000, jitter: 0.2 }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NotificationSection {
    pub company_id: Option<String>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub dir: String,
    pub level: String,
    pub stdout: bool,
}

impl Default for LogSection {
    fn default() -> Self {
        Self { dir: "logs".to_string(), level: "info".to_string(), stdout: true }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MonitorConfigFile {
    pub api_base_url: String,
    pub ws_base_url: String,
    /// JSON file holding the bearer token; missing means anonymous
    pub token_file: Option<String>,
    pub topics: Vec<String>,
    pub handshake_frames: bool,
    pub connect_timeout_ms: u64,
    pub alert_after_attempts: Option<u32>,
    /// Refresh the token this long before it expires
    pub token_refresh_margin_secs: u64,
    pub token_check_interval_secs: u64,
    pub backoff: BackoffSection,
    pub notifications: NotificationSection,
    pub log: LogSection,
}

impl Default for MonitorConfigFile {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080".to_string(),
            ws_base_url: "ws://localhost:8080".to_string(),
            token_file: None,
            topics: vec![Topic::declared_routes().to_string()],
            handshake_frames: false,
            connect_timeout_ms: 10_000,
            alert_after_attempts: Some(5),
            token_refresh_margin_secs: 300,
            token_check_interval_secs: 60,
            backoff: BackoffSection::default(),
            notifications: NotificationSection::default(),
            log: LogSection::default(),
        }
    }
}

impl MonitorConfigFile {
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            ws_base_url: self.ws_base_url.clone(),
            transport: TransportConfig { open_timeout: Duration::from_millis(self.connect_timeout_ms) },
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(self.backoff.base_delay_ms),
                max_delay: Duration::from_millis(self.backoff.max_delay_ms.max(self.backoff.base_delay_ms)),
                jitter: self.backoff.jitter.clamp(0.0, 1.0),
            },
            handshake_frames: self.handshake_frames,
            alert_after_attempts: self.alert_after_attempts,
            notification_filter: NotificationFilter::new(self.notifications.company_id.clone(), self.notifications.roles.clone()),
            ..Default::default()
        }
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().map(Topic::new).collect()
    }
}

/// Load a monitor config file, overlaid with `FLEET__*` environment variables
/// (e.g. `FLEET__WS_BASE_URL`, `FLEET__BACKOFF__MAX_DELAY_MS`)
pub fn load_monitor_config<P: AsRef<Path>>(path: P) -> Result<MonitorConfigFile, ConfigError> {
    let config = Config::builder()
        .add_source(File::from(path.as_ref()))
        .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("__").separator("__"))
        .build()?;

    config.try_deserialize()
}

/// Load monitor config with fallback to default
pub fn load_monitor_config_or_default<P: AsRef<Path>>(path: P) -> MonitorConfigFile {
    let path = path.as_ref();
    match load_monitor_config(path) {
        Ok(config) => {
            tracing::info!("Loaded monitor config from {}", path.display());
            config
        }
        Err(err) => {
            tracing::warn!("Failed to load monitor config from {}: {}. Using defaults.", path.display(), err);
            MonitorConfigFile::default()
        }
    }
}
