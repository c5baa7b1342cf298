//! Service configuration
//!
//! The YAML file is loaded through figment and can be overridden with
//! `COMSRV_` environment variables (`__` separates nested keys, e.g.
//! `COMSRV_LOGGING__LEVEL=debug`). Point tables live in CSV files next to
//! each channel, see [`csv_loader`].

pub mod csv_loader;

use figment::{
    providers::{Env, Format, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;
use voltage_comlink::ChannelConfig;

use crate::error::{ComSrvError, Result};
use crate::runtime::reconnect::ReconnectPolicy;

pub use csv_loader::{load_channel_points, MappingRow, PointRow};

/// Default config file location
pub const DEFAULT_CONFIG_PATH: &str = "config/comsrv.yaml";

/// Root of the comsrv configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComsrvConfig {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

/// Service level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    /// Capacity of the queue between channels and the publisher
    #[serde(default = "default_publish_buffer")]
    pub publish_buffer: usize,

    /// Capacity of each channel's inbound command queue
    #[serde(default = "default_command_buffer")]
    pub command_buffer: usize,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

/// Reconnect backoff, in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// 0 retries forever
    #[serde(default)]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level or full `EnvFilter` directive
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Directory of the daily rolling log file; console only when absent
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// File name prefix of the rolling log
    #[serde(default = "default_service_name")]
    pub file_prefix: String,

    /// Console logging
    #[serde(default = "default_true")]
    pub console: bool,

    /// JSON lines instead of the human readable format
    #[serde(default)]
    pub json: bool,
}

fn default_service_name() -> String {
    "comsrv".to_string()
}

fn default_publish_buffer() -> usize {
    4096
}

fn default_command_buffer() -> usize {
    64
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            publish_buffer: default_publish_buffer(),
            command_buffer: default_command_buffer(),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_true(),
        }
    }
}

impl ReconnectConfig {
    pub fn policy(&self) -> ReconnectPolicy {
        let mut policy = ReconnectPolicy::from_config(
            self.max_attempts,
            self.initial_delay_ms,
            self.max_delay_ms,
            self.backoff_multiplier,
        );
        policy.jitter = self.jitter;
        policy
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            directory: None,
            file_prefix: default_service_name(),
            console: default_true(),
            json: false,
        }
    }
}

impl ComsrvConfig {
    /// Load from a YAML file merged with `COMSRV_` environment variables
    ///
    /// Relative `points_dir` entries are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ComSrvError::config(format!(
                "config file {} not found",
                path.display()
            )));
        }
        let figment = Figment::new()
            .merge(Yaml::file(path))
            .merge(Env::prefixed("COMSRV_").split("__"));
        let mut config: ComsrvConfig = figment.extract()?;

        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for channel in &mut config.channels {
            if let Some(dir) = channel.points_dir.as_mut() {
                if dir.is_relative() {
                    *dir = base.join(&*dir);
                }
            }
        }
        debug!(
            "Loaded {} with {} channels",
            path.display(),
            config.channels.len()
        );

        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text without environment overrides
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: ComsrvConfig = Figment::new().merge(Yaml::string(yaml)).extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.publish_buffer == 0 || self.service.command_buffer == 0 {
            return Err(ComSrvError::config(
                "service.publish_buffer and service.command_buffer must be > 0",
            ));
        }
        if self.service.reconnect.backoff_multiplier < 1.0 {
            return Err(ComSrvError::config(
                "service.reconnect.backoff_multiplier must be >= 1.0",
            ));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if !ids.insert(channel.id) {
                return Err(ComSrvError::config(format!(
                    "Duplicate channel ID: {}",
                    channel.id
                )));
            }
            if channel.name.trim().is_empty() {
                return Err(ComSrvError::config(format!(
                    "channel {} has an empty name",
                    channel.id
                )));
            }
            if channel.polling_interval_ms == 0 {
                return Err(ComSrvError::config(format!(
                    "channel {}: polling_interval_ms must be > 0",
                    channel.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_channels(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.iter().filter(|c| c.enabled)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use std::time::Duration;
    use voltage_comlink::DeviceRole;

    const SAMPLE: &str = r#"
service:
  name: comsrv-test
  reconnect:
    initial_delay_ms: 200
logging:
  level: debug
channels:
  - id: 1
    name: pcs
    protocol: modbus_tcp
    polling_interval_ms: 500
    parameters:
      host: 192.168.1.10
      port: 502
    points_dir: points/pcs
  - id: 2
    name: meter_slave
    protocol: modbus_rtu
    role: slave
    parameters:
      port: /dev/ttyUSB0
      baud_rate: 9600
"#;

    #[test]
    fn test_parse_yaml() {
        let config = ComsrvConfig::from_yaml_str(SAMPLE).unwrap();
        assert_eq!(config.service.name, "comsrv-test");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channels[0].polling_interval(), Duration::from_millis(500));
        assert_eq!(config.channels[1].role, DeviceRole::Slave);
        assert_eq!(config.channels[1].polling_interval_ms, 1000);

        let policy = config.service.reconnect.policy();
        assert_eq!(policy.initial_delay, Duration::from_millis(200));
        assert_eq!(policy.max_attempts, 0);
    }

    #[test]
    fn test_duplicate_channel_ids_rejected() {
        let yaml = r#"
channels:
  - { id: 7, name: a, protocol: virtual }
  - { id: 7, name: b, protocol: virtual }
"#;
        let err = ComsrvConfig::from_yaml_str(yaml).unwrap_err();
        assert!(err.to_string().contains("Duplicate channel ID"));
    }

    #[test]
    fn test_load_resolves_points_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("comsrv.yaml");
        std::fs::write(&path, SAMPLE).unwrap();

        figment::Jail::expect_with(|jail| {
            jail.set_env("COMSRV_LOGGING__LEVEL", "trace");
            let config = ComsrvConfig::load(&path).map_err(|e| e.to_string())?;
            assert_eq!(config.logging.level, "trace");
            assert_eq!(
                config.channels[0].points_dir.as_deref(),
                Some(dir.path().join("points/pcs").as_path())
            );
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        assert!(ComsrvConfig::load("/nonexistent/comsrv.yaml").is_err());
    }
}
