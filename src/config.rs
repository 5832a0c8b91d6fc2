//! TOML configuration. Every key is optional; missing ones take the defaults
//! below, and a missing file means all defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;


#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sensor: SensorConfig,
    pub server: ServerConfig,
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// Substring the advertised device name must contain
    pub name_filter: String,
    pub scan_timeout_secs: u64,
    pub battery_poll_secs: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            name_filter: "Polar".into(),
            scan_timeout_secs: 10,
            battery_poll_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// A subscriber that takes longer than this to accept a message is dropped
    pub send_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8765,
            send_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Also send battery readings to subscribers, not only heart rate
    pub forward_battery: bool,
}


impl Config {
    pub fn default_path() -> PathBuf {
        PathBuf::from("hrbridge.toml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::parse(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        info!(path = %path.display(), "config loaded");
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl SensorConfig {
    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn battery_poll(&self) -> Duration {
        Duration::from_secs(self.battery_poll_secs.max(1))
    }
}

impl ServerConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_endpoint() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr(), "0.0.0.0:8765");
        assert_eq!(config.sensor.name_filter, "Polar");
        assert_eq!(config.sensor.battery_poll(), Duration::from_secs(5));
        assert!(!config.relay.forward_battery);
    }

    #[test]
    fn partial_file_keeps_defaults_for_the_rest() {
        let config = Config::parse(
            r#"
            [server]
            port = 9000

            [relay]
            forward_battery = true
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sensor, SensorConfig::default());
        assert!(config.relay.forward_battery);
    }

    #[test]
    fn toml_round_trip() {
        let mut config = Config::default();
        config.sensor.name_filter = "COROS".into();
        let text = config.to_toml().unwrap();
        assert_eq!(Config::parse(&text).unwrap(), config);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[server]\nport = \"eighty\"").is_err());
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = Config::load(Path::new("/definitely/not/here/hrbridge.toml")).unwrap();
        assert_eq!(config, Config::default());
    }
}
