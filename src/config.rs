//! # Bridge Configuration
//!
//! Typed configuration for every component of the bridge. The whole document is
//! loaded once at startup from a TOML file and then handed to each component by
//! reference; nothing reads configuration from ambient globals.
//!
//! ## Layout
//!
//! ```text
//! [device]   endpoint, credentials, local subdomain
//! [mqtt]     broker connection and topic naming
//! [timers]   named waits used by the retry controller and the poll loop
//! [limits]   per-field [min, max] bounds for inbound writes
//! [general]  diagnostics switches and the daily info schedule
//! ```
//!
//! Every section except `[device]` has defaults, so a minimal file only needs
//! the endpoint and the credentials.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

const CONFIG_DIR: &str = ".config/solmate-bridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct BridgeConfig {
    pub device: DeviceConfig,
    #[serde(default)]
    pub mqtt: MqttSettings,
    #[serde(default)]
    pub timers: TimerConfig,
    #[serde(default)]
    pub limits: LimitConfig,
    #[serde(default)]
    pub general: GeneralConfig,
}

/// Endpoint and credentials of the device session.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct DeviceConfig {
    pub server_uri: String,
    pub serial_number: String,
    /// Replaces `serial_number` for authentication when set and non-empty
    #[serde(default)]
    pub spare_serial_number: Option<String>,
    pub password: String,
    pub device_id: String,
    /// A URI containing this subdomain is treated as a local connection
    #[serde(default)]
    pub local_subdomain: Option<String>,
}

impl DeviceConfig {
    pub fn auth_serial(&self) -> &str {
        match self.spare_serial_number.as_deref() {
            Some(spare) if !spare.trim().is_empty() => spare,
            _ => &self.serial_number,
        }
    }

    pub fn is_local_uri(&self, uri: &str) -> bool {
        match self.local_subdomain.as_deref() {
            Some(sub) if !sub.is_empty() => uri.contains(sub),
            _ => false,
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct MqttSettings {
    pub enabled: bool,
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub client_id: String,
    pub prefix: String,
    pub topic: String,
    pub keep_alive: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            server: "localhost".to_string(),
            port: 1883,
            username: String::new(),
            password: String::new(),
            client_id: "solmate_mqtt".to_string(),
            prefix: "eet".to_string(),
            topic: "solmate".to_string(),
            keep_alive: 30,
        }
    }
}

/// Named waits, all in seconds.
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct TimerConfig {
    pub offline: u64,
    pub conn_err: u64,
    pub reboot: u64,
    pub min: u64,
    pub live: u64,
    /// Consecutive unclassified failures before a forced reconnect
    pub attempt_restart: u32,
    pub request_timeout: u64,
    pub max_redirects: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            offline: 600,
            conn_err: 10,
            reboot: 160,
            min: 1,
            live: 30,
            attempt_restart: 3,
            request_timeout: 30,
            max_redirects: 5,
        }
    }
}

impl TimerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

/// Inclusive bounds of one writable field.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Bounds {
    pub min: i64,
    pub max: i64,
}

impl Bounds {
    pub const fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: i64) -> bool {
        self.min <= value && value <= self.max
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct LimitConfig {
    pub boost_wattage: Bounds,
    pub boost_time: Bounds,
    pub user_minimum_injection: Bounds,
    pub user_maximum_injection: Bounds,
    pub user_minimum_battery_percentage: Bounds,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            boost_wattage: Bounds::new(0, 500),
            boost_time: Bounds::new(60, 7200),
            user_minimum_injection: Bounds::new(0, 800),
            user_maximum_injection: Bounds::new(0, 800),
            user_minimum_battery_percentage: Bounds::new(2, 100),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct GeneralConfig {
    pub print_response: bool,
    pub api_info: bool,
    /// Local wall-clock time of the daily info read, `HH:MM`
    pub daily_info_at: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            print_response: false,
            api_info: false,
            daily_info_at: "23:45".to_string(),
        }
    }
}

impl GeneralConfig {
    pub fn daily_info_time(&self) -> Result<chrono::NaiveTime, ConfigError> {
        chrono::NaiveTime::parse_from_str(&self.daily_info_at, "%H:%M").map_err(|e| {
            ConfigError::Invalid(format!("general.daily_info_at '{}': {}", self.daily_info_at, e))
        })
    }
}

impl BridgeConfig {
    /// Resolves the config path: explicit argument first, then the home directory default.
    pub fn resolve_path(arg: Option<String>) -> PathBuf {
        if let Some(path) = arg {
            return PathBuf::from(path);
        }
        let mut base_path = get_home_dir();
        base_path.push(CONFIG_DIR);
        base_path.push(CONFIG_FILE);
        base_path
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        debug!("Configuration loaded: {:?}", config.timers);
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig =
            toml::from_str(content).map_err(|source| ConfigError::Parse {
                path: PathBuf::new(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.server_uri.trim().is_empty() {
            return Err(ConfigError::Invalid("device.server_uri is empty".into()));
        }
        if self.timers.live == 0 {
            return Err(ConfigError::Invalid("timers.live must be > 0".into()));
        }
        if self.timers.max_redirects == 0 {
            return Err(ConfigError::Invalid(
                "timers.max_redirects must be > 0".into(),
            ));
        }
        let limits = [
            ("boost_wattage", self.limits.boost_wattage),
            ("boost_time", self.limits.boost_time),
            ("user_minimum_injection", self.limits.user_minimum_injection),
            ("user_maximum_injection", self.limits.user_maximum_injection),
            (
                "user_minimum_battery_percentage",
                self.limits.user_minimum_battery_percentage,
            ),
        ];
        for (name, bounds) in limits {
            if bounds.min > bounds.max {
                return Err(ConfigError::Invalid(format!(
                    "limits.{} has min {} > max {}",
                    name, bounds.min, bounds.max
                )));
            }
        }
        self.general.daily_info_time()?;
        Ok(())
    }
}

fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        tracing::warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [device]
        server_uri = "ws://sun2plug.local:9124/"
        serial_number = "S1"
        password = "secret"
        device_id = "bridge"
        local_subdomain = "sun2plug"
    "#;

    #[test]
    fn minimal_file_gets_defaults() {
        let config = BridgeConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.timers.attempt_restart, 3);
        assert_eq!(config.timers.max_redirects, 5);
        assert_eq!(config.mqtt.prefix, "eet");
        assert_eq!(config.limits.boost_time, Bounds::new(60, 7200));
        assert!(config.device.is_local_uri(&config.device.server_uri));
    }

    #[test]
    fn spare_serial_wins_when_not_blank() {
        let mut device = BridgeConfig::from_toml(MINIMAL).unwrap().device;
        assert_eq!(device.auth_serial(), "S1");
        device.spare_serial_number = Some("  ".into());
        assert_eq!(device.auth_serial(), "S1");
        device.spare_serial_number = Some("S2".into());
        assert_eq!(device.auth_serial(), "S2");
    }

    #[test]
    fn inverted_bounds_are_rejected() {
        let text = format!("{}\n[limits]\nboost_time = {{ min = 10, max = 5 }}\n", MINIMAL);
        assert!(matches!(
            BridgeConfig::from_toml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn bad_daily_time_is_rejected() {
        let text = format!("{}\n[general]\ndaily_info_at = \"25:99\"\n", MINIMAL);
        assert!(BridgeConfig::from_toml(&text).is_err());
    }
}
