use std::path::Path;

use serde::Deserialize;

use crate::error::{TrackerError, TrackerResult};
use crate::types::Properties;

/// Root tracker configuration. Loaded from environment variables with the
/// prefix `BEACON__` and, optionally, a TOML config file.
///
/// The value is immutable once a tracker is built from it.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub host: String,
    /// When false the tracker is built as a no-op.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default = "default_app_version")]
    pub app_version: String,
    /// Buffered events are flushed once the buffer grows past this size.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Debounce window for flushing a buffer that never reaches `buffer_size`.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_session_max_inactive_ms")]
    pub session_max_inactive_ms: i64,
    #[serde(default = "default_delivery_channel_capacity")]
    pub delivery_channel_capacity: usize,
    /// Page the host is currently showing; used when a call carries no `url`.
    #[serde(default = "default_page_url")]
    pub page_url: String,
    #[serde(default)]
    pub referrer: Option<String>,
    #[serde(default)]
    pub device: DeviceConfig,
    /// Seed for the global properties merged into every event.
    #[serde(default)]
    pub global_properties: Properties,
}

/// Static device facts reported with every event.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default)]
    pub device_version: String,
    #[serde(default = "default_os_name")]
    pub os_name: String,
    #[serde(default)]
    pub os_version: String,
    #[serde(default = "default_platform_name")]
    pub platform_name: String,
    #[serde(default = "default_app_version")]
    pub platform_version: String,
}

fn default_enabled() -> bool {
    true
}
fn default_platform() -> String {
    "web".to_string()
}
fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
fn default_buffer_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    5000
}
fn default_session_max_inactive_ms() -> i64 {
    3 * 60 * 60 * 1000
}
fn default_delivery_channel_capacity() -> usize {
    1024
}
fn default_page_url() -> String {
    "app://localhost/".to_string()
}
fn default_device_name() -> String {
    "desktop".to_string()
}
fn default_os_name() -> String {
    std::env::consts::OS.to_string()
}
fn default_platform_name() -> String {
    "beacon".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            device_version: String::new(),
            os_name: default_os_name(),
            os_version: String::new(),
            platform_name: default_platform_name(),
            platform_version: default_app_version(),
        }
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            host: String::new(),
            enabled: default_enabled(),
            platform: default_platform(),
            app_version: default_app_version(),
            buffer_size: default_buffer_size(),
            flush_interval_ms: default_flush_interval_ms(),
            session_max_inactive_ms: default_session_max_inactive_ms(),
            delivery_channel_capacity: default_delivery_channel_capacity(),
            page_url: default_page_url(),
            referrer: None,
            device: DeviceConfig::default(),
            global_properties: Properties::new(),
        }
    }
}

impl TrackerConfig {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(Self::env_source());
        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load configuration from a file, with environment variables taking precedence.
    pub fn load_from(path: &Path) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(Self::env_source());
        let config = builder.build()?;
        config.try_deserialize()
    }

    fn env_source() -> config::Environment {
        config::Environment::with_prefix("BEACON")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
    }

    pub fn with_credentials(mut self, host: impl Into<String>, api_key: impl Into<String>) -> Self {
        self.host = host.into();
        self.api_key = api_key.into();
        self
    }

    /// Tracking cannot proceed without an API key and an ingestion host.
    pub fn validate(&self) -> TrackerResult<()> {
        if self.api_key.trim().is_empty() {
            return Err(TrackerError::Config("missing tracking api key".into()));
        }
        if self.host.trim().is_empty() {
            return Err(TrackerError::Config("missing tracking host".into()));
        }
        if self.buffer_size == 0 {
            return Err(TrackerError::Config("buffer_size must be positive".into()));
        }
        if self.session_max_inactive_ms <= 0 {
            return Err(TrackerError::Config(
                "session_max_inactive_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}
