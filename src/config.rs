//! Device configuration
//!
//! Loaded from TOML. Secrets may be referenced through environment variables
//! and are resolved at runtime, never at load time.

use crate::session::topics::{validate_device_id, validate_id_scope};
use crate::session::{BrokerEndpoint, DEFAULT_MQTTS_PORT};
use crate::transport::{WifiAuth, WifiCredentials};
use crate::twin::{PlainHub, PlugAndPlay, TwinProtocol};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConfig {
    pub device: DeviceSection,
    #[serde(default)]
    pub cloud: CloudSection,
    #[serde(default)]
    pub wifi: WifiSection,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub twin: TwinSection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Device identifier (must match [a-zA-Z0-9._-]+)
    pub id: String,
    #[serde(default = "default_firmware_version")]
    pub firmware_version: String,
    /// Initial log verbosity, 0 (off) to 5 (trace)
    #[serde(default = "default_debug_level")]
    pub debug_level: u8,
}

fn default_firmware_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_debug_level() -> u8 {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CloudSection {
    #[serde(default = "default_hub_endpoint")]
    pub hub_endpoint: String,
    #[serde(default = "default_provisioning_endpoint")]
    pub provisioning_endpoint: String,
    /// Required when `use_provisioning` is set
    pub id_scope: Option<String>,
    #[serde(default)]
    pub use_provisioning: bool,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
}

fn default_hub_endpoint() -> String {
    "mqtts://hub.azure-devices.net:8883".to_string()
}

fn default_provisioning_endpoint() -> String {
    "mqtts://global.azure-devices-provisioning.net:8883".to_string()
}

fn default_model_id() -> String {
    "dtmi:com:Microchip:SAM_IoT_WM;2".to_string()
}

fn default_keep_alive() -> u16 {
    240
}

impl Default for CloudSection {
    fn default() -> Self {
        Self {
            hub_endpoint: default_hub_endpoint(),
            provisioning_endpoint: default_provisioning_endpoint(),
            id_scope: None,
            use_provisioning: false,
            model_id: default_model_id(),
            keep_alive_secs: default_keep_alive(),
        }
    }
}

impl CloudSection {
    pub fn hub_broker(&self) -> Result<BrokerEndpoint, ConfigError> {
        parse_endpoint(&self.hub_endpoint)
    }

    pub fn provisioning_broker(&self) -> Result<BrokerEndpoint, ConfigError> {
        parse_endpoint(&self.provisioning_endpoint)
    }
}

/// Parse an `mqtt://` or `mqtts://` URL into host and port
pub fn parse_endpoint(raw: &str) -> Result<BrokerEndpoint, ConfigError> {
    let url = Url::parse(raw).map_err(|e| ConfigError::InvalidEndpoint(format!("{raw}: {e}")))?;

    let default_port = match url.scheme() {
        "mqtts" => DEFAULT_MQTTS_PORT,
        "mqtt" => DEFAULT_MQTT_PORT,
        other => {
            return Err(ConfigError::InvalidEndpoint(format!(
                "{raw}: unsupported scheme '{other}'"
            )))
        }
    };

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{raw}: missing host")))?;

    Ok(BrokerEndpoint::new(host, url.port().unwrap_or(default_port)))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WifiSection {
    #[serde(default)]
    pub ssid: String,
    pub passphrase: Option<String>,
    /// Environment variable holding the passphrase, preferred over `passphrase`
    pub passphrase_env: Option<String>,
    #[serde(default)]
    pub auth: WifiAuth,
}

impl WifiSection {
    pub fn credentials(&self) -> WifiCredentials {
        let passphrase = self
            .passphrase_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
            .or_else(|| self.passphrase.clone());

        WifiCredentials {
            ssid: self.ssid.clone(),
            passphrase,
            auth: self.auth,
        }
    }
}

/// Scheduler tick and timeout durations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default = "default_wifi_timeout_ms")]
    pub wifi_timeout_ms: u64,
    #[serde(default = "default_dns_retry_ms")]
    pub dns_retry_ms: u64,
    #[serde(default = "default_reset_delay_ms")]
    pub reset_delay_ms: u64,
    #[serde(default = "default_telemetry_interval_secs")]
    pub telemetry_interval_secs: u32,
}

fn default_tick_ms() -> u64 {
    500
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_wifi_timeout_ms() -> u64 {
    5_000
}

fn default_dns_retry_ms() -> u64 {
    10_000
}

fn default_reset_delay_ms() -> u64 {
    2_000
}

fn default_telemetry_interval_secs() -> u32 {
    10
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            session_timeout_ms: default_session_timeout_ms(),
            wifi_timeout_ms: default_wifi_timeout_ms(),
            dns_retry_ms: default_dns_retry_ms(),
            reset_delay_ms: default_reset_delay_ms(),
            telemetry_interval_secs: default_telemetry_interval_secs(),
        }
    }
}

impl TimingConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn wifi_timeout(&self) -> Duration {
        Duration::from_millis(self.wifi_timeout_ms)
    }

    pub fn dns_retry(&self) -> Duration {
        Duration::from_millis(self.dns_retry_ms)
    }

    pub fn reset_delay(&self) -> Duration {
        Duration::from_millis(self.reset_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "timing.tick_ms must be greater than zero".to_string(),
            ));
        }

        let timeouts = [
            ("session_timeout_ms", self.session_timeout_ms),
            ("wifi_timeout_ms", self.wifi_timeout_ms),
            ("dns_retry_ms", self.dns_retry_ms),
            ("reset_delay_ms", self.reset_delay_ms),
        ];
        for (name, value) in timeouts {
            if value < self.tick_ms {
                return Err(ConfigError::InvalidConfig(format!(
                    "timing.{name} ({value}) is shorter than one tick ({})",
                    self.tick_ms
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TwinProtocolKind {
    #[default]
    PlugAndPlay,
    PlainHub,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TwinSection {
    #[serde(default)]
    pub protocol: TwinProtocolKind,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid device ID: {0}")]
    InvalidDeviceId(String),
    #[error("Invalid broker endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: SyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// In-memory configuration with every default applied
    pub fn default_for<S: Into<String>>(device_id: S) -> Self {
        Self {
            device: DeviceSection {
                id: device_id.into(),
                firmware_version: default_firmware_version(),
                debug_level: default_debug_level(),
            },
            cloud: CloudSection::default(),
            wifi: WifiSection::default(),
            timing: TimingConfig::default(),
            twin: TwinSection::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_device_id(&self.device.id).map_err(|e| {
            ConfigError::InvalidDeviceId(format!(
                "'{}' must match pattern [a-zA-Z0-9._-]+ ({e})",
                self.device.id
            ))
        })?;

        if self.device.debug_level > 5 {
            return Err(ConfigError::InvalidConfig(format!(
                "device.debug_level must be 0..=5, got {}",
                self.device.debug_level
            )));
        }

        self.cloud.hub_broker()?;
        if self.cloud.use_provisioning {
            self.cloud.provisioning_broker()?;
            let scope = self.cloud.id_scope.as_deref().ok_or_else(|| {
                ConfigError::InvalidConfig(
                    "cloud.use_provisioning requires cloud.id_scope".to_string(),
                )
            })?;
            validate_id_scope(scope).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;
        }

        self.timing.validate()
    }

    /// Twin reporting convention selected by `[twin] protocol`
    pub fn twin_protocol(&self) -> Box<dyn TwinProtocol> {
        match self.twin.protocol {
            TwinProtocolKind::PlugAndPlay => Box::new(PlugAndPlay::new(self.cloud.model_id.clone())),
            TwinProtocolKind::PlainHub => Box::new(PlainHub),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
id = "test-device"
firmware_version = "1.0.0"

[cloud]
hub_endpoint = "mqtts://test-hub.azure-devices.net"

[wifi]
ssid = "lab"
passphrase = "secret"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
