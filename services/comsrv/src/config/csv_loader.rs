//! CSV point table loader
//!
//! Layout of a channel's `points_dir`:
//!
//! ```text
//! telemetry.csv  signal.csv  control.csv  adjustment.csv
//! mapping/telemetry_mapping.csv  mapping/signal_mapping.csv
//! mapping/control_mapping.csv    mapping/adjustment_mapping.csv
//! ```
//!
//! Category files carry the protocol independent definition, mapping files
//! the protocol address. Missing files count as empty tables.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};
use voltage_comlink::{
    ByteOrder, CanBitOrder, CanMapping, ChannelConfig, DataPointConfig, DataType, Iec104Mapping,
    ModbusMapping, PointTable, PointType, ProtocolMapping, ValueRange,
};

use crate::error::{ComSrvError, Result};

/// One row of a category file
#[derive(Debug, Clone, Deserialize)]
pub struct PointRow {
    pub point_id: u32,
    pub signal_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
    #[serde(default)]
    pub offset: Option<f64>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub reverse: Option<String>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub enabled: Option<String>,
}

/// One row of a mapping file; which columns are required depends on the protocol
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MappingRow {
    pub point_id: u32,
    // Modbus
    #[serde(default)]
    pub slave_id: Option<u8>,
    #[serde(default)]
    pub function_code: Option<u8>,
    #[serde(default)]
    pub register_address: Option<u16>,
    #[serde(default)]
    pub byte_order: Option<String>,
    #[serde(default)]
    pub bit_position: Option<u8>,
    #[serde(default)]
    pub register_count: Option<u16>,
    // IEC 60870-5-104
    #[serde(default)]
    pub common_address: Option<u16>,
    #[serde(default)]
    pub ioa: Option<u32>,
    #[serde(default)]
    pub type_id: Option<u8>,
    // CAN
    #[serde(default)]
    pub can_id: Option<String>,
    #[serde(default)]
    pub extended: Option<String>,
    #[serde(default)]
    pub start_bit: Option<u16>,
    #[serde(default)]
    pub bit_length: Option<u8>,
    #[serde(default)]
    pub bit_order: Option<String>,
    #[serde(default)]
    pub signed: Option<String>,
}

/// Which mapping columns a protocol reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MappingFamily {
    Modbus,
    Iec104,
    Can,
    None,
}

impl MappingFamily {
    fn for_protocol(protocol: &str) -> Self {
        match crate::registry::normalize_protocol_name(protocol).as_str() {
            "modbus_tcp" | "modbus_rtu" => MappingFamily::Modbus,
            "iec104" => MappingFamily::Iec104,
            "can" => MappingFamily::Can,
            _ => MappingFamily::None,
        }
    }
}

fn category_name(point_type: PointType) -> &'static str {
    match point_type {
        PointType::Telemetry => "telemetry",
        PointType::Signal => "signal",
        PointType::Control => "control",
        PointType::Adjustment => "adjustment",
    }
}

fn parse_flag(value: Option<&str>, default: bool) -> std::result::Result<bool, String> {
    match value.map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(v) if v.is_empty() => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "y" => Ok(true),
            "0" | "false" | "no" | "n" => Ok(false),
            other => Err(format!("invalid flag '{}'", other)),
        },
    }
}

fn parse_u32(value: &str) -> std::result::Result<u32, String> {
    let value = value.trim();
    let parsed = match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => value.parse(),
    };
    parsed.map_err(|e| format!("invalid number '{}': {}", value, e))
}

/// Read every record of a CSV file; `None` when the file does not exist
pub fn read_rows<T>(path: &Path) -> Result<Option<Vec<T>>>
where
    T: for<'de> Deserialize<'de>,
{
    if !path.exists() {
        return Ok(None);
    }
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| {
            ComSrvError::config(format!("Failed to open CSV file {}: {}", path.display(), e))
        })?;

    let mut records = Vec::new();
    for (line_num, result) in reader.deserialize().enumerate() {
        let record: T = result.map_err(|e| {
            ComSrvError::config(format!(
                "Failed to parse CSV record at line {} in {}: {}",
                line_num + 2,
                path.display(),
                e
            ))
        })?;
        records.push(record);
    }
    Ok(Some(records))
}

fn point_from_row(row: PointRow, point_type: PointType, file: &Path) -> Result<DataPointConfig> {
    let bad = |msg: String| {
        ComSrvError::config(format!("{}: point {}: {}", file.display(), row.point_id, msg))
    };

    let data_type = match row.data_type.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => DataType::parse(s).ok_or_else(|| bad(format!("unknown data type '{}'", s)))?,
        None if point_type.is_digital() => DataType::Bool,
        None => DataType::default(),
    };

    let mut point = DataPointConfig::new(row.point_id, row.signal_name.clone(), point_type, data_type)
        .with_scaling(row.scale.unwrap_or(1.0), row.offset.unwrap_or(0.0));
    point.display_name = row.display_name.clone().filter(|s| !s.is_empty());
    point.unit = row.unit.clone().filter(|s| !s.is_empty());
    point.reverse = parse_flag(row.reverse.as_deref(), false).map_err(bad)?;
    point.enabled = parse_flag(row.enabled.as_deref(), true).map_err(bad)?;
    point.range = match (row.min, row.max) {
        (Some(min), Some(max)) if min <= max => Some(ValueRange { min, max }),
        (Some(_), Some(_)) => return Err(bad("min is greater than max".into())),
        (None, None) => None,
        _ => return Err(bad("min and max must be given together".into())),
    };
    Ok(point)
}

fn apply_mapping(point: &mut DataPointConfig, row: &MappingRow, family: MappingFamily, file: &Path) -> Result<()> {
    let bad = |msg: &str| {
        ComSrvError::config(format!("{}: point {}: {}", file.display(), row.point_id, msg))
    };

    if let Some(order) = row.byte_order.as_deref().filter(|s| !s.is_empty()) {
        point.byte_order =
            ByteOrder::parse(order).ok_or_else(|| bad(&format!("unknown byte order '{}'", order)))?;
    }

    point.mapping = match family {
        MappingFamily::Modbus => Some(ProtocolMapping::Modbus(ModbusMapping {
            slave_id: row.slave_id.ok_or_else(|| bad("slave_id is required"))?,
            function_code: row.function_code.ok_or_else(|| bad("function_code is required"))?,
            register_address: row
                .register_address
                .ok_or_else(|| bad("register_address is required"))?,
            bit_position: row.bit_position,
            register_count: row.register_count,
        })),
        MappingFamily::Iec104 => Some(ProtocolMapping::Iec104(Iec104Mapping {
            common_address: row.common_address.ok_or_else(|| bad("common_address is required"))?,
            ioa: row.ioa.ok_or_else(|| bad("ioa is required"))?,
            type_id: row.type_id.ok_or_else(|| bad("type_id is required"))?,
        })),
        MappingFamily::Can => {
            let can_id = row.can_id.as_deref().ok_or_else(|| bad("can_id is required"))?;
            let bit_order = match row.bit_order.as_deref().map(|s| s.trim().to_ascii_lowercase()) {
                None => CanBitOrder::Intel,
                Some(s) => match s.as_str() {
                    "" | "intel" | "little_endian" => CanBitOrder::Intel,
                    "motorola" | "big_endian" => CanBitOrder::Motorola,
                    other => return Err(bad(&format!("unknown bit order '{}'", other))),
                },
            };
            Some(ProtocolMapping::Can(CanMapping {
                can_id: parse_u32(can_id).map_err(|e| bad(&e))?,
                extended: parse_flag(row.extended.as_deref(), false).map_err(|e| bad(&e))?,
                start_bit: row.start_bit.ok_or_else(|| bad("start_bit is required"))?,
                bit_length: row.bit_length.ok_or_else(|| bad("bit_length is required"))?,
                bit_order,
                signed: parse_flag(row.signed.as_deref(), false).map_err(|e| bad(&e))?,
            }))
        },
        MappingFamily::None => None,
    };
    Ok(())
}

/// Load the four category tables and their mappings from `dir`
pub fn load_point_tables(dir: &Path, protocol: &str) -> Result<PointTable> {
    let family = MappingFamily::for_protocol(protocol);
    let mapping_dir = dir.join("mapping");
    let mut points = Vec::new();

    for point_type in PointType::ALL {
        let name = category_name(point_type);
        let file = dir.join(format!("{name}.csv"));
        let Some(rows) = read_rows::<PointRow>(&file)? else {
            debug!("{} not found, no {} points", file.display(), name);
            continue;
        };
        let mut by_id: HashMap<u32, DataPointConfig> = HashMap::with_capacity(rows.len());
        let mut order = Vec::with_capacity(rows.len());
        for row in rows {
            let point = point_from_row(row, point_type, &file)?;
            let id = point.id;
            if by_id.insert(id, point).is_some() {
                return Err(ComSrvError::config(format!(
                    "{}: duplicate point id {}",
                    file.display(),
                    id
                )));
            }
            order.push(id);
        }

        let map_file = mapping_dir.join(format!("{name}_mapping.csv"));
        for row in read_rows::<MappingRow>(&map_file)?.unwrap_or_default() {
            match by_id.get_mut(&row.point_id) {
                Some(point) => apply_mapping(point, &row, family, &map_file)?,
                None => warn!(
                    "{}: mapping for unknown point {} ignored",
                    map_file.display(),
                    row.point_id
                ),
            }
        }

        for id in order {
            if let Some(point) = by_id.remove(&id) {
                if family != MappingFamily::None && point.mapping.is_none() {
                    return Err(ComSrvError::config(format!(
                        "{} point {} ({}) has no entry in {}",
                        name,
                        point.id,
                        point.name,
                        map_file.display()
                    )));
                }
                points.push(point);
            }
        }
    }

    Ok(PointTable::new(points)?)
}

/// Point table of a channel; empty when it has no `points_dir`
pub fn load_channel_points(channel: &ChannelConfig) -> Result<PointTable> {
    match channel.points_dir.as_deref() {
        Some(dir) => {
            if !dir.is_dir() {
                return Err(ComSrvError::config(format!(
                    "channel {}: points_dir {} is not a directory",
                    channel.id,
                    dir.display()
                )));
            }
            let table = load_point_tables(dir, &channel.protocol)?;
            debug!(
                "Ch{}: T={} S={} C={} A={} pts",
                channel.id,
                table.by_type(PointType::Telemetry).count(),
                table.by_type(PointType::Signal).count(),
                table.by_type(PointType::Control).count(),
                table.by_type(PointType::Adjustment).count()
            );
            Ok(table)
        },
        None => Ok(PointTable::default()),
    }
}
