//! Application configuration
//!
//! Loaded from TOML. Every section and field has a default, so an empty
//! file (or a partial one) is valid.
//!
//! ```toml
//! [csms]
//! host = "csms.example.com:9000"
//! path = "ocpp"
//!
//! [station]
//! id = "CS001"
//!
//! [evse]
//! addresses = ["127.0.0.1:7001", "127.0.0.1:7002"]
//! password_file = "/etc/ocpp-station/evse.password"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::application::charging::{StationIdentity, StationSettings};
use crate::application::transport::TransportConfig;
use crate::infrastructure::evse::PollOptions;
use crate::support::errors::BootstrapError;

/// Environment variable that overrides the default config path.
pub const CONFIG_PATH_ENV: &str = "OCPP_STATION_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub csms: CsmsConfig,
    pub station: StationConfig,
    pub evse: EvseConfig,
    pub display: DisplayConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CsmsConfig {
    /// `ws` or `wss`
    pub scheme: String,
    /// Host and optional port
    pub host: String,
    /// Path prefix; the station id is appended
    pub path: String,
    pub response_timeout_secs: u64,
    pub sweep_interval_ms: u64,
    pub outbound_queue_capacity: usize,
    pub inbound_queue_capacity: usize,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            scheme: "ws".to_string(),
            host: "localhost:9000".to_string(),
            path: "ocpp".to_string(),
            response_timeout_secs: 10,
            sweep_interval_ms: 500,
            outbound_queue_capacity: 100,
            inbound_queue_capacity: 100,
        }
    }
}

impl CsmsConfig {
    /// `scheme://host/path/<station_id>`
    pub fn url(&self, station_id: &str) -> String {
        let path = self.path.trim_matches('/');
        if path.is_empty() {
            format!("{}://{}/{}", self.scheme, self.host, station_id)
        } else {
            format!("{}://{}/{}/{}", self.scheme, self.host, path, station_id)
        }
    }
}

impl From<&CsmsConfig> for TransportConfig {
    fn from(config: &CsmsConfig) -> Self {
        Self {
            response_timeout: Duration::from_secs(config.response_timeout_secs),
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            outbound_capacity: config.outbound_queue_capacity,
            inbound_capacity: config.inbound_queue_capacity,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StationConfig {
    pub id: String,
    pub vendor: String,
    pub model: String,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub heartbeat_interval_secs: u64,
    pub tx_update_interval_secs: u64,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            id: "CS001".to_string(),
            vendor: "WattsUp".to_string(),
            model: "super-charger-6000".to_string(),
            serial_number: None,
            firmware_version: None,
            heartbeat_interval_secs: 10,
            tx_update_interval_secs: 5,
        }
    }
}

impl From<&StationConfig> for StationSettings {
    fn from(config: &StationConfig) -> Self {
        Self {
            identity: StationIdentity {
                station_id: config.id.clone(),
                vendor: config.vendor.clone(),
                model: config.model.clone(),
                serial_number: config.serial_number.clone(),
                firmware_version: config.firmware_version.clone(),
            },
            heartbeat_interval: Duration::from_secs(config.heartbeat_interval_secs),
            tx_update_interval: Duration::from_secs(config.tx_update_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvseConfig {
    /// One `host:port` per EVSE controller
    pub addresses: Vec<String>,
    /// Id of the first EVSE; the rest follow in order. OCPP reserves 0 for
    /// the station itself.
    pub first_id: i32,
    /// First line of this file is sent to each EVSE controller on connect
    pub password_file: Option<PathBuf>,
    pub poll_interval_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for EvseConfig {
    fn default() -> Self {
        Self {
            addresses: Vec::new(),
            first_id: 1,
            password_file: None,
            poll_interval_ms: 300,
            request_timeout_ms: 2000,
        }
    }
}

impl EvseConfig {
    /// `(evse_id, address)` pairs in configuration order.
    pub fn assignments(&self) -> Vec<(i32, String)> {
        (self.first_id..)
            .zip(self.addresses.iter().cloned())
            .collect()
    }

    pub fn poll_options(&self) -> PollOptions {
        PollOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    /// Read the EVSE password, if one is configured.
    pub fn load_password(&self) -> Result<Option<String>, BootstrapError> {
        let Some(path) = &self.password_file else {
            return Ok(None);
        };
        let contents =
            std::fs::read_to_string(path).map_err(|source| BootstrapError::Credential {
                path: path.clone(),
                source,
            })?;
        Ok(contents.lines().next().map(|line| line.trim().to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayConfig {
    pub host: String,
    pub port: u16,
    /// Seconds to wait for tasks to stop on shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8090,
            shutdown_timeout_secs: 5,
        }
    }
}

impl DisplayConfig {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error (or any EnvFilter directive)
    pub level: String,
    /// `plain` or `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "plain".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, BootstrapError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, BootstrapError> {
        toml::from_str(contents).map_err(|e| BootstrapError::Config(e.to_string()))
    }

    /// Write the configuration as TOML, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<(), BootstrapError> {
        let contents =
            toml::to_string_pretty(self).map_err(|e| BootstrapError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BootstrapError::Config(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(path, contents).map_err(|e| {
            BootstrapError::Config(format!("cannot write {}: {}", path.display(), e))
        })
    }

    /// Reject settings the station cannot run with.
    pub fn validate(&self) -> Result<(), BootstrapError> {
        if self.evse.addresses.is_empty() {
            return Err(BootstrapError::NoEvses);
        }
        if self.station.id.trim().is_empty() {
            return Err(BootstrapError::Config("station.id must not be empty".into()));
        }
        if !matches!(self.csms.scheme.as_str(), "ws" | "wss") {
            return Err(BootstrapError::Config(format!(
                "csms.scheme must be ws or wss, got {:?}",
                self.csms.scheme
            )));
        }
        if self.evse.first_id < 0 {
            return Err(BootstrapError::Config("evse.first_id must not be negative".into()));
        }

        let positive = [
            ("csms.response_timeout_secs", self.csms.response_timeout_secs),
            ("csms.sweep_interval_ms", self.csms.sweep_interval_ms),
            ("csms.outbound_queue_capacity", self.csms.outbound_queue_capacity as u64),
            ("csms.inbound_queue_capacity", self.csms.inbound_queue_capacity as u64),
            ("station.heartbeat_interval_secs", self.station.heartbeat_interval_secs),
            ("station.tx_update_interval_secs", self.station.tx_update_interval_secs),
            ("evse.poll_interval_ms", self.evse.poll_interval_ms),
            ("evse.request_timeout_ms", self.evse.request_timeout_ms),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(BootstrapError::Config(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }

    pub fn csms_url(&self) -> String {
        self.csms.url(&self.station.id)
    }
}

/// `$OCPP_STATION_CONFIG`, else `<config dir>/ocpp-station/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV) {
        return PathBuf::from(path);
    }
    dirs_next::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ocpp-station")
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let config = AppConfig::from_toml(
            r#"
            [csms]
            host = "csms.example.com"

            [evse]
            addresses = ["10.0.0.5:7001", "10.0.0.6:7001"]
            "#,
        )
        .unwrap();

        assert_eq!(config.csms.host, "csms.example.com");
        assert_eq!(config.csms.response_timeout_secs, 10);
        assert_eq!(config.station.id, "CS001");
        assert_eq!(config.display.port, 8090);
        assert_eq!(
            config.evse.assignments(),
            vec![(1, "10.0.0.5:7001".to_string()), (2, "10.0.0.6:7001".to_string())]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn url_joins_host_path_and_station_id() {
        let mut config = AppConfig::default();
        config.csms.host = "csms.example.com:9000".into();
        config.csms.path = "/ocpp/".into();
        assert_eq!(config.csms_url(), "ws://csms.example.com:9000/ocpp/CS001");

        config.csms.path = String::new();
        config.station.id = "CS042".into();
        assert_eq!(config.csms_url(), "ws://csms.example.com:9000/CS042");
    }

    #[test]
    fn validation_rejects_unusable_settings() {
        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(BootstrapError::NoEvses)));

        let mut config = AppConfig::default();
        config.evse.addresses = vec!["127.0.0.1:7001".into()];
        config.csms.response_timeout_secs = 0;
        match config.validate() {
            Err(BootstrapError::Config(msg)) => assert!(msg.contains("response_timeout_secs")),
            other => panic!("Expected config error, got {:?}", other),
        }

        config.csms.response_timeout_secs = 10;
        config.csms.scheme = "http".into();
        assert!(matches!(config.validate(), Err(BootstrapError::Config(_))));
    }

    #[test]
    fn save_then_load_preserves_settings() {
        let dir = std::env::temp_dir().join(format!("ocpp-station-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.station.id = "CS777".into();
        config.evse.addresses = vec!["127.0.0.1:7001".into()];
        config.evse.first_id = 3;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn password_is_first_line_of_file() {
        let dir = std::env::temp_dir().join(format!("ocpp-station-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("evse.password");
        std::fs::write(&path, "s3cret\nignored\n").unwrap();

        let mut evse = EvseConfig::default();
        assert_eq!(evse.load_password().unwrap(), None);
        evse.password_file = Some(path);
        assert_eq!(evse.load_password().unwrap().as_deref(), Some("s3cret"));

        evse.password_file = Some(dir.join("missing"));
        assert!(matches!(
            evse.load_password(),
            Err(BootstrapError::Credential { .. })
        ));
        std::fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn sections_convert_to_runtime_settings() {
        let config = AppConfig::default();
        let transport = TransportConfig::from(&config.csms);
        assert_eq!(transport.response_timeout, Duration::from_secs(10));
        assert_eq!(transport.sweep_interval, Duration::from_millis(500));

        let settings = StationSettings::from(&config.station);
        assert_eq!(settings.identity.model, "super-charger-6000");
        assert_eq!(settings.tx_update_interval, Duration::from_secs(5));
        assert_eq!(config.evse.poll_options().request_timeout, Duration::from_millis(2000));
    }
}
