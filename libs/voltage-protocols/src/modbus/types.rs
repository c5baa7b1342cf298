//! Modbus channel parameters
//!
//! Deserialized from the `parameters` map of a channel configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::transport::SerialSettings;

use super::constants::{MAX_READ_BITS, MAX_READ_REGISTERS};

/// Read batching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusBatchConfig {
    /// Merge adjacent points into one request
    #[serde(default = "default_batching_enabled")]
    pub enabled: bool,

    /// Maximum registers per read request
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u16,

    /// Maximum coils/discrete inputs per read request
    #[serde(default = "default_max_bit_batch_size")]
    pub max_bit_batch_size: u16,

    /// Largest hole (in registers) bridged inside one request; unbounded when absent
    #[serde(default)]
    pub max_gap: Option<u16>,

    /// Per-slave register limits, for devices that cannot serve full bursts
    #[serde(default)]
    pub device_limits: HashMap<u8, DeviceLimit>,
}

/// Register limit of a single slave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceLimit {
    #[serde(default = "default_max_batch_size")]
    pub max_registers_per_read: u16,

    #[serde(default)]
    pub description: Option<String>,
}

fn default_batching_enabled() -> bool {
    true
}

fn default_max_batch_size() -> u16 {
    MAX_READ_REGISTERS
}

fn default_max_bit_batch_size() -> u16 {
    MAX_READ_BITS
}

impl Default for ModbusBatchConfig {
    fn default() -> Self {
        Self {
            enabled: default_batching_enabled(),
            max_batch_size: default_max_batch_size(),
            max_bit_batch_size: default_max_bit_batch_size(),
            max_gap: None,
            device_limits: HashMap::new(),
        }
    }
}

impl ModbusBatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 || self.max_batch_size > MAX_READ_REGISTERS {
            return Err(ComLinkError::config(format!(
                "max_batch_size {} must be within 1..={}",
                self.max_batch_size, MAX_READ_REGISTERS
            )));
        }
        if self.max_bit_batch_size == 0 || self.max_bit_batch_size > MAX_READ_BITS {
            return Err(ComLinkError::config(format!(
                "max_bit_batch_size {} must be within 1..={}",
                self.max_bit_batch_size, MAX_READ_BITS
            )));
        }
        for (slave, limit) in &self.device_limits {
            if limit.max_registers_per_read == 0 {
                return Err(ComLinkError::config(format!(
                    "device limit of slave {} must be > 0",
                    slave
                )));
            }
        }
        Ok(())
    }

    /// Register burst for one slave
    pub fn register_limit(&self, slave_id: u8) -> u16 {
        let limit = self
            .device_limits
            .get(&slave_id)
            .map(|l| l.max_registers_per_read)
            .unwrap_or(self.max_batch_size);
        limit.min(self.max_batch_size).max(1)
    }
}

/// Options used only when the channel acts as a Modbus slave
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaveOptions {
    /// Unit id answered on; 0 is broadcast and never answered
    #[serde(default = "default_unit_id")]
    pub unit_id: u8,

    /// How long one listen cycle waits for the first byte of a request
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,

    /// Entries per table (coils, discrete inputs, holding, input)
    #[serde(default = "default_map_size")]
    pub map_size: u32,
}

fn default_unit_id() -> u8 {
    1
}

fn default_listen_timeout_ms() -> u64 {
    200
}

fn default_map_size() -> u32 {
    u32::from(u16::MAX) + 1
}

impl Default for SlaveOptions {
    fn default() -> Self {
        Self {
            unit_id: default_unit_id(),
            listen_timeout_ms: default_listen_timeout_ms(),
            map_size: default_map_size(),
        }
    }
}

impl SlaveOptions {
    pub fn validate(&self) -> Result<()> {
        if self.unit_id == 0 || self.unit_id > 247 {
            return Err(ComLinkError::config(format!(
                "slave unit_id {} must be within 1..=247",
                self.unit_id
            )));
        }
        if self.map_size == 0 || self.map_size > default_map_size() {
            return Err(ComLinkError::config(format!(
                "map_size {} must be within 1..=65536",
                self.map_size
            )));
        }
        if self.listen_timeout_ms == 0 {
            return Err(ComLinkError::config("listen_timeout_ms must be > 0"));
        }
        Ok(())
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

/// Parameters of `modbus_tcp` channels
///
/// Masters connect to `host:port`; slaves bind there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusTcpParams {
    pub host: String,

    #[serde(default = "default_tcp_port")]
    pub port: u16,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Per-request response deadline
    #[serde(default = "default_response_timeout_ms", alias = "timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default)]
    pub batch: ModbusBatchConfig,

    #[serde(default)]
    pub slave: SlaveOptions,
}

fn default_tcp_port() -> u16 {
    502
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_response_timeout_ms() -> u64 {
    1000
}

impl ModbusTcpParams {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
            response_timeout_ms: default_response_timeout_ms(),
            batch: ModbusBatchConfig::default(),
            slave: SlaveOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(ComLinkError::config("modbus_tcp: host must not be empty"));
        }
        if self.response_timeout_ms == 0 {
            return Err(ComLinkError::config("modbus_tcp: response_timeout_ms must be > 0"));
        }
        self.batch.validate()
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}

/// Parameters of `modbus_rtu` channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModbusRtuParams {
    #[serde(flatten)]
    pub serial: SerialSettings,

    #[serde(default = "default_response_timeout_ms", alias = "timeout_ms")]
    pub response_timeout_ms: u64,

    #[serde(default)]
    pub batch: ModbusBatchConfig,

    #[serde(default)]
    pub slave: SlaveOptions,
}

impl ModbusRtuParams {
    pub fn new(serial: SerialSettings) -> Self {
        Self {
            serial,
            response_timeout_ms: default_response_timeout_ms(),
            batch: ModbusBatchConfig::default(),
            slave: SlaveOptions::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.serial
            .validate()
            .map_err(|e| ComLinkError::config(format!("modbus_rtu: {}", e)))?;
        if self.response_timeout_ms == 0 {
            return Err(ComLinkError::config("modbus_rtu: response_timeout_ms must be > 0"));
        }
        self.batch.validate()
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }
}
