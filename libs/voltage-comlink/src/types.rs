//! Protocol-agnostic channel and point model
//!
//! Channels carry four point categories (T/S/C/A). Every point has a common
//! header (type, data type, byte order, scaling) plus a protocol specific
//! address record.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::bytes::ByteOrder;
use crate::error::{ComLinkError, Result};
use crate::traits::ConnectionState;

// ============================================================================
// Enumerations
// ============================================================================

/// The four remote point categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PointType {
    /// Measured analog values (YC)
    #[serde(rename = "T", alias = "telemetry", alias = "YC")]
    Telemetry,
    /// Digital status (YX)
    #[serde(rename = "S", alias = "signal", alias = "YX")]
    Signal,
    /// Digital commands (YK)
    #[serde(rename = "C", alias = "control", alias = "YK")]
    Control,
    /// Analog setpoints (YT)
    #[serde(rename = "A", alias = "adjustment", alias = "YT")]
    Adjustment,
}

impl PointType {
    pub const ALL: [PointType; 4] = [
        PointType::Telemetry,
        PointType::Signal,
        PointType::Control,
        PointType::Adjustment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PointType::Telemetry => "T",
            PointType::Signal => "S",
            PointType::Control => "C",
            PointType::Adjustment => "A",
        }
    }

    /// Digital categories carry on/off state
    pub fn is_digital(&self) -> bool {
        matches!(self, PointType::Signal | PointType::Control)
    }

    /// Categories that accept commands
    pub fn is_command(&self) -> bool {
        matches!(self, PointType::Control | PointType::Adjustment)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "t" | "telemetry" | "yc" => Some(PointType::Telemetry),
            "s" | "signal" | "yx" => Some(PointType::Signal),
            "c" | "control" | "yk" => Some(PointType::Control),
            "a" | "adjustment" | "yt" => Some(PointType::Adjustment),
            _ => None,
        }
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value representation of a point on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    #[serde(alias = "boolean")]
    Bool,
    #[serde(alias = "i16")]
    Int16,
    #[default]
    #[serde(alias = "u16")]
    Uint16,
    #[serde(alias = "i32")]
    Int32,
    #[serde(alias = "u32")]
    Uint32,
    #[serde(alias = "float", alias = "f32")]
    Float32,
}

impl DataType {
    pub const ALL: [DataType; 6] = [
        DataType::Bool,
        DataType::Int16,
        DataType::Uint16,
        DataType::Int32,
        DataType::Uint32,
        DataType::Float32,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(DataType::Bool),
            "int16" | "i16" => Some(DataType::Int16),
            "uint16" | "u16" => Some(DataType::Uint16),
            "int32" | "i32" => Some(DataType::Int32),
            "uint32" | "u32" => Some(DataType::Uint32),
            "float32" | "f32" | "float" => Some(DataType::Float32),
            _ => None,
        }
    }

    /// Registers occupied by one value
    pub fn register_count(&self) -> u16 {
        match self {
            DataType::Bool | DataType::Int16 | DataType::Uint16 => 1,
            DataType::Int32 | DataType::Uint32 | DataType::Float32 => 2,
        }
    }

    /// Raw value range of integer types
    pub fn raw_bounds(&self) -> Option<(f64, f64)> {
        match self {
            DataType::Bool => Some((0.0, 1.0)),
            DataType::Int16 => Some((i16::MIN as f64, i16::MAX as f64)),
            DataType::Uint16 => Some((0.0, u16::MAX as f64)),
            DataType::Int32 => Some((i32::MIN as f64, i32::MAX as f64)),
            DataType::Uint32 => Some((0.0, u32::MAX as f64)),
            DataType::Float32 => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "bool",
            DataType::Int16 => "int16",
            DataType::Uint16 => "uint16",
            DataType::Int32 => "int32",
            DataType::Uint32 => "uint32",
            DataType::Float32 => "float32",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical interface of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InterfaceKind {
    #[default]
    Network,
    Serial,
    Can,
    DryContact,
}

/// Whether the channel polls devices or serves them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeviceRole {
    #[default]
    Master,
    Slave,
}

/// Quality attached to every published value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Good,
    /// Device answered but the value could not be used (exception, CRC, range)
    Invalid,
    /// Link to the device is down
    CommFailure,
    /// Value outside its configured valid range
    Uncertain,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }
}

// ============================================================================
// Channel configuration
// ============================================================================

fn default_polling_interval() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

/// Channel definition as parsed from configuration
///
/// `parameters` is an untyped bag; each protocol constructor converts it
/// into its own parameter struct with [`ChannelConfig::typed_params`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: u32,
    pub name: String,
    /// Protocol identifier, e.g. `modbus_tcp`
    pub protocol: String,
    #[serde(default)]
    pub interface: InterfaceKind,
    #[serde(default)]
    pub role: DeviceRole,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    /// Directory with the channel's point CSV files
    #[serde(default)]
    pub points_dir: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ChannelConfig {
    pub fn new(id: u32, name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            protocol: protocol.into(),
            interface: InterfaceKind::default(),
            role: DeviceRole::default(),
            parameters: serde_json::Map::new(),
            polling_interval_ms: default_polling_interval(),
            points_dir: None,
            enabled: true,
        }
    }

    pub fn with_role(mut self, role: DeviceRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_interface(mut self, interface: InterfaceKind) -> Self {
        self.interface = interface;
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.parameters.insert(key.to_string(), value.into());
        self
    }

    pub fn with_polling_interval(mut self, interval_ms: u64) -> Self {
        self.polling_interval_ms = interval_ms;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    /// Convert the parameter bag into a typed parameter struct
    pub fn typed_params<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.parameters.clone())).map_err(|e| {
            ComLinkError::config(format!(
                "channel {} ({}): invalid {} parameters: {}",
                self.id, self.name, self.protocol, e
            ))
        })
    }
}

// ============================================================================
// Point configuration
// ============================================================================

/// Valid engineering range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
}

impl ValueRange {
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

/// Modbus address of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModbusMapping {
    pub slave_id: u8,
    pub function_code: u8,
    pub register_address: u16,
    /// Bit inside a register for bool points on FC03/FC04
    #[serde(default)]
    pub bit_position: Option<u8>,
    /// Overrides the count implied by the data type
    #[serde(default)]
    pub register_count: Option<u16>,
}

/// IEC 60870-5-104 address of a point
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Iec104Mapping {
    pub common_address: u16,
    pub ioa: u32,
    pub type_id: u8,
}

/// Bit layout of a CAN signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CanBitOrder {
    /// LSB-first
    #[default]
    #[serde(alias = "little_endian")]
    Intel,
    /// MSB-first, DBC start bit is the MSB
    #[serde(alias = "big_endian")]
    Motorola,
}

/// CAN signal location
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanMapping {
    pub can_id: u32,
    #[serde(default)]
    pub extended: bool,
    pub start_bit: u16,
    pub bit_length: u8,
    #[serde(default)]
    pub bit_order: CanBitOrder,
    #[serde(default)]
    pub signed: bool,
}

/// Protocol specific address record
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum ProtocolMapping {
    Modbus(ModbusMapping),
    Iec104(Iec104Mapping),
    Can(CanMapping),
}

/// One configured data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPointConfig {
    pub id: u32,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub point_type: PointType,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub byte_order: ByteOrder,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub range: Option<ValueRange>,
    /// Invert digital values
    #[serde(default)]
    pub reverse: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mapping: Option<ProtocolMapping>,
}

fn default_scale() -> f64 {
    1.0
}

impl DataPointConfig {
    pub fn new(id: u32, name: impl Into<String>, point_type: PointType, data_type: DataType) -> Self {
        Self {
            id,
            name: name.into(),
            display_name: None,
            point_type,
            data_type,
            byte_order: ByteOrder::default(),
            scale: 1.0,
            offset: 0.0,
            unit: None,
            range: None,
            reverse: false,
            enabled: true,
            mapping: None,
        }
    }

    pub fn with_modbus(mut self, slave_id: u8, function_code: u8, register_address: u16) -> Self {
        self.mapping = Some(ProtocolMapping::Modbus(ModbusMapping {
            slave_id,
            function_code,
            register_address,
            bit_position: None,
            register_count: None,
        }));
        self
    }

    pub fn with_can(mut self, mapping: CanMapping) -> Self {
        self.mapping = Some(ProtocolMapping::Can(mapping));
        self
    }

    pub fn with_scaling(mut self, scale: f64, offset: f64) -> Self {
        self.scale = scale;
        self.offset = offset;
        self
    }

    pub fn with_byte_order(mut self, order: ByteOrder) -> Self {
        self.byte_order = order;
        self
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn modbus(&self) -> Option<&ModbusMapping> {
        match &self.mapping {
            Some(ProtocolMapping::Modbus(m)) => Some(m),
            _ => None,
        }
    }

    pub fn modbus_mut(&mut self) -> Option<&mut ModbusMapping> {
        match &mut self.mapping {
            Some(ProtocolMapping::Modbus(m)) => Some(m),
            _ => None,
        }
    }

    pub fn can(&self) -> Option<&CanMapping> {
        match &self.mapping {
            Some(ProtocolMapping::Can(m)) => Some(m),
            _ => None,
        }
    }

    /// Raw device value → engineering value
    pub fn to_engineering(&self, raw: f64) -> f64 {
        raw * self.scale + self.offset
    }

    /// Engineering value → raw device value
    pub fn to_raw(&self, value: f64) -> f64 {
        if self.scale == 0.0 {
            value - self.offset
        } else {
            (value - self.offset) / self.scale
        }
    }

    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

/// Validated set of points of one channel, keyed by id
#[derive(Debug, Clone, Default)]
pub struct PointTable {
    points: BTreeMap<u32, DataPointConfig>,
}

impl PointTable {
    /// Build a table, rejecting duplicate ids
    pub fn new(points: impl IntoIterator<Item = DataPointConfig>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for point in points {
            let id = point.id;
            if map.insert(id, point).is_some() {
                return Err(ComLinkError::config(format!("duplicate point id {}", id)));
            }
        }
        Ok(Self { points: map })
    }

    pub fn get(&self, id: u32) -> Option<&DataPointConfig> {
        self.points.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataPointConfig> {
        self.points.values()
    }

    pub fn by_type(&self, point_type: PointType) -> impl Iterator<Item = &DataPointConfig> {
        self.points
            .values()
            .filter(move |p| p.point_type == point_type)
    }

    /// Enabled points read during polling (T and S)
    pub fn pollable(&self) -> impl Iterator<Item = &DataPointConfig> {
        self.points
            .values()
            .filter(|p| p.enabled && !p.point_type.is_command())
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

// ============================================================================
// Runtime values
// ============================================================================

/// Digital point value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigitalValue {
    pub state: bool,
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub quality: Quality,
}

/// Analog point value in engineering units
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalogValue {
    pub value: f64,
    pub unit: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub valid: bool,
    pub quality: Quality,
}

/// Current value of one point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PointReading {
    Digital(DigitalValue),
    Analog(AnalogValue),
}

impl PointReading {
    pub fn digital(state: bool) -> Self {
        PointReading::Digital(DigitalValue {
            state,
            timestamp: Utc::now(),
            valid: true,
            quality: Quality::Good,
        })
    }

    pub fn analog(value: f64, unit: Option<String>) -> Self {
        PointReading::Analog(AnalogValue {
            value,
            unit,
            timestamp: Utc::now(),
            valid: true,
            quality: Quality::Good,
        })
    }

    /// Placeholder published when no value could be obtained
    pub fn degraded(point: &DataPointConfig, quality: Quality) -> Self {
        let timestamp = Utc::now();
        if point.point_type.is_digital() || point.data_type == DataType::Bool {
            PointReading::Digital(DigitalValue {
                state: false,
                timestamp,
                valid: false,
                quality,
            })
        } else {
            PointReading::Analog(AnalogValue {
                value: 0.0,
                unit: point.unit.clone(),
                timestamp,
                valid: false,
                quality,
            })
        }
    }

    pub fn quality(&self) -> Quality {
        match self {
            PointReading::Digital(v) => v.quality,
            PointReading::Analog(v) => v.quality,
        }
    }

    pub fn is_valid(&self) -> bool {
        match self {
            PointReading::Digital(v) => v.valid,
            PointReading::Analog(v) => v.valid,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            PointReading::Digital(v) => v.timestamp,
            PointReading::Analog(v) => v.timestamp,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            PointReading::Digital(v) => {
                if v.state {
                    1.0
                } else {
                    0.0
                }
            },
            PointReading::Analog(v) => v.value,
        }
    }

    pub fn with_quality(mut self, quality: Quality) -> Self {
        let valid = matches!(quality, Quality::Good | Quality::Uncertain);
        match &mut self {
            PointReading::Digital(v) => {
                v.quality = quality;
                v.valid = valid;
            },
            PointReading::Analog(v) => {
                v.quality = quality;
                v.valid = valid;
            },
        }
        self
    }
}

/// Value change pushed to the data publisher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointUpdate {
    pub channel_id: u32,
    pub point_id: u32,
    pub point_type: PointType,
    pub reading: PointReading,
}

/// Digital command (YK)
#[derive(Debug, Clone, PartialEq)]
pub struct DigitalCommand {
    pub state: bool,
    pub confirm: bool,
    pub timeout: Duration,
    pub operator: Option<String>,
}

/// Analog setpoint (YT) in engineering units
#[derive(Debug, Clone, PartialEq)]
pub struct AnalogCommand {
    pub value: f64,
    pub confirm: bool,
    pub timeout: Duration,
    pub operator: Option<String>,
}

/// Command addressed to one point
#[derive(Debug, Clone, PartialEq)]
pub enum PointCommand {
    Digital(DigitalCommand),
    Analog(AnalogCommand),
}

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

impl PointCommand {
    /// Command of the right shape for `point_type`
    pub fn for_point(point_type: PointType, value: f64) -> Self {
        if point_type.is_digital() {
            PointCommand::Digital(DigitalCommand {
                state: value != 0.0,
                confirm: false,
                timeout: DEFAULT_COMMAND_TIMEOUT,
                operator: None,
            })
        } else {
            PointCommand::Analog(AnalogCommand {
                value,
                confirm: false,
                timeout: DEFAULT_COMMAND_TIMEOUT,
                operator: None,
            })
        }
    }

    pub fn value(&self) -> f64 {
        match self {
            PointCommand::Digital(c) => {
                if c.state {
                    1.0
                } else {
                    0.0
                }
            },
            PointCommand::Analog(c) => c.value,
        }
    }

    pub fn confirm(&self) -> bool {
        match self {
            PointCommand::Digital(c) => c.confirm,
            PointCommand::Analog(c) => c.confirm,
        }
    }

    pub fn timeout(&self) -> Duration {
        match self {
            PointCommand::Digital(c) => c.timeout,
            PointCommand::Analog(c) => c.timeout,
        }
    }

    pub fn operator(&self) -> Option<&str> {
        match self {
            PointCommand::Digital(c) => c.operator.as_deref(),
            PointCommand::Analog(c) => c.operator.as_deref(),
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        match &mut self {
            PointCommand::Digital(c) => c.confirm = confirm,
            PointCommand::Analog(c) => c.confirm = confirm,
        }
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        match &mut self {
            PointCommand::Digital(c) => c.timeout = timeout,
            PointCommand::Analog(c) => c.timeout = timeout,
        }
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        let operator = Some(operator.into());
        match &mut self {
            PointCommand::Digital(c) => c.operator = operator,
            PointCommand::Analog(c) => c.operator = operator,
        }
        self
    }
}

/// Result of a command reported back to its originator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum CommandOutcome {
    Accepted,
    Rejected(String),
}

impl CommandOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, CommandOutcome::Accepted)
    }
}

/// Batch of updates produced by one poll or listen cycle
#[derive(Debug, Clone, Default)]
pub struct TelemetryBatch {
    pub channel_id: u32,
    pub updates: Vec<PointUpdate>,
}

/// Health snapshot of a channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub channel_id: u32,
    pub name: String,
    pub protocol: String,
    pub state: ConnectionState,
    pub connected: bool,
    pub running: bool,
    pub last_response_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_update: Option<DateTime<Utc>>,
    pub protocol_errors: u64,
    pub transport_errors: u64,
    pub command_errors: u64,
    pub poll_cycles: u64,
    pub reconnect_attempts: u64,
}

impl ChannelStatus {
    pub fn new(channel_id: u32, name: impl Into<String>, protocol: impl Into<String>) -> Self {
        Self {
            channel_id,
            name: name.into(),
            protocol: protocol.into(),
            state: ConnectionState::default(),
            connected: false,
            running: false,
            last_response_time: None,
            last_error: None,
            last_update: None,
            protocol_errors: 0,
            transport_errors: 0,
            command_errors: 0,
            poll_cycles: 0,
            reconnect_attempts: 0,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_point_type_serde_aliases() {
        let t: PointType = serde_json::from_str("\"T\"").unwrap();
        assert_eq!(t, PointType::Telemetry);
        let a: PointType = serde_json::from_str("\"YT\"").unwrap();
        assert_eq!(a, PointType::Adjustment);
        assert_eq!(serde_json::to_string(&PointType::Signal).unwrap(), "\"S\"");
        assert_eq!(PointType::parse("control"), Some(PointType::Control));
    }

    #[test]
    fn test_data_type_registers() {
        assert_eq!(DataType::Float32.register_count(), 2);
        assert_eq!(DataType::Int16.register_count(), 1);
        assert_eq!(DataType::parse("FLOAT"), Some(DataType::Float32));
        assert_eq!(DataType::parse("int64"), None);
    }

    #[test]
    fn test_scaling_inverse() {
        let point = DataPointConfig::new(1, "voltage", PointType::Telemetry, DataType::Uint16)
            .with_scaling(0.1, -40.0);
        assert!((point.to_engineering(650.0) - 25.0).abs() < 1e-9);
        assert!((point.to_raw(25.0) - 650.0).abs() < 1e-9);
    }

    #[test]
    fn test_point_table_rejects_duplicates() {
        let a = DataPointConfig::new(1, "a", PointType::Telemetry, DataType::Uint16);
        let b = DataPointConfig::new(1, "b", PointType::Signal, DataType::Bool);
        let err = PointTable::new(vec![a.clone(), b]).unwrap_err();
        assert!(matches!(err, ComLinkError::Config(_)));

        let c = DataPointConfig::new(2, "c", PointType::Control, DataType::Bool);
        let table = PointTable::new(vec![a, c]).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.by_type(PointType::Control).count(), 1);
        assert_eq!(table.pollable().count(), 1);
    }

    #[test]
    fn test_typed_params() {
        #[derive(Debug, Deserialize)]
        struct Params {
            host: String,
            port: u16,
        }

        let config = ChannelConfig::new(1, "pcs", "modbus_tcp")
            .with_param("host", "10.0.0.1")
            .with_param("port", 502);
        let params: Params = config.typed_params().unwrap();
        assert_eq!(params.host, "10.0.0.1");
        assert_eq!(params.port, 502);

        let bad = ChannelConfig::new(1, "pcs", "modbus_tcp").with_param("port", 70000);
        assert!(matches!(
            bad.typed_params::<Params>(),
            Err(ComLinkError::Config(_))
        ));
    }

    #[test]
    fn test_command_shape() {
        let cmd = PointCommand::for_point(PointType::Control, 1.0).with_confirm(true);
        assert!(matches!(cmd, PointCommand::Digital(DigitalCommand { state: true, .. })));
        assert!(cmd.confirm());
        let cmd = PointCommand::for_point(PointType::Adjustment, 12.5).with_operator("ops");
        assert_eq!(cmd.value(), 12.5);
        assert_eq!(cmd.operator(), Some("ops"));
    }

    #[test]
    fn test_degraded_reading() {
        let point = DataPointConfig::new(7, "p", PointType::Telemetry, DataType::Float32);
        let reading = PointReading::degraded(&point, Quality::CommFailure);
        assert!(!reading.is_valid());
        assert_eq!(reading.quality(), Quality::CommFailure);
    }
}
