//! Point value codec: registers ↔ typed values ↔ engineering values

use voltage_comlink::bytes::{
    f32_to_regs, i32_to_regs, reg_to_i16, reg_to_u16, register_bit, regs_to_f32, regs_to_i32,
    regs_to_u32, u16_to_reg, u32_to_regs, with_register_bit,
};
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::{
    ByteOrder, DataPointConfig, DataType, ModbusMapping, PointCommand, PointReading,
    ProtocolValue, Quality,
};

use super::constants::*;
use super::pdu::ModbusRequest;

/// Decode raw registers into a typed value
///
/// `raw` must hold at least `data_type.register_count()` registers.
pub fn value_from_registers(raw: &[u16], data_type: DataType, order: ByteOrder) -> Result<ProtocolValue> {
    let needed = data_type.register_count() as usize;
    if raw.len() < needed {
        return Err(ComLinkError::conversion(format!(
            "{} needs {} registers, got {}",
            data_type,
            needed,
            raw.len()
        )));
    }
    let value = match data_type {
        DataType::Bool => match reg_to_u16(raw[0], order) {
            0 => ProtocolValue::Bool(false),
            1 => ProtocolValue::Bool(true),
            // non-canonical truthy word, kept so it encodes back unchanged
            word => ProtocolValue::from(word),
        },
        DataType::Uint16 => ProtocolValue::from(reg_to_u16(raw[0], order)),
        DataType::Int16 => ProtocolValue::from(reg_to_i16(raw[0], order)),
        DataType::Uint32 => ProtocolValue::from(regs_to_u32([raw[0], raw[1]], order)),
        DataType::Int32 => ProtocolValue::from(regs_to_i32([raw[0], raw[1]], order)),
        DataType::Float32 => ProtocolValue::from(regs_to_f32([raw[0], raw[1]], order)),
    };
    Ok(value)
}

/// Encode a typed value into registers, inverse of [`value_from_registers`]
///
/// Out-of-range integers are clamped to the data type. Float32 keeps the
/// bit pattern of NaN and infinite values.
pub fn registers_from_value(value: &ProtocolValue, data_type: DataType, order: ByteOrder) -> Result<Vec<u16>> {
    let number = value
        .as_f64()
        .ok_or_else(|| ComLinkError::conversion(format!("{:?} is not numeric", value)))?;

    let regs = match data_type {
        DataType::Bool => {
            let word = match value {
                ProtocolValue::Integer(i) if (1..=i64::from(u16::MAX)).contains(i) => *i as u16,
                _ => u16::from(number != 0.0),
            };
            vec![u16_to_reg(word, order)]
        },
        DataType::Uint16 => vec![u16_to_reg(clamp_to_data_type(number, data_type) as u16, order)],
        DataType::Int16 => {
            vec![u16_to_reg(clamp_to_data_type(number, data_type) as i16 as u16, order)]
        },
        DataType::Uint32 => u32_to_regs(clamp_to_data_type(number, data_type) as u32, order).to_vec(),
        DataType::Int32 => i32_to_regs(clamp_to_data_type(number, data_type) as i32, order).to_vec(),
        DataType::Float32 => f32_to_regs(number as f32, order).to_vec(),
    };
    Ok(regs)
}

/// Round integer types and clamp to the representable range
pub fn clamp_to_data_type(value: f64, data_type: DataType) -> f64 {
    match data_type.raw_bounds() {
        Some((min, max)) if data_type != DataType::Float32 => value.round().clamp(min, max),
        _ => value,
    }
}

/// Registers a point occupies
pub fn register_span(point: &DataPointConfig, mapping: &ModbusMapping) -> u16 {
    if is_bit_function(mapping.function_code) {
        return 1;
    }
    if point.data_type == DataType::Bool {
        return 1;
    }
    mapping
        .register_count
        .unwrap_or_else(|| point.data_type.register_count())
        .max(point.data_type.register_count())
}

/// Build a reading for a point from raw register data
pub fn reading_from_registers(point: &DataPointConfig, mapping: &ModbusMapping, raw: &[u16]) -> Result<PointReading> {
    if point.data_type == DataType::Bool || point.point_type.is_digital() {
        let first = *raw
            .first()
            .ok_or_else(|| ComLinkError::conversion("no register data"))?;
        let word = reg_to_u16(first, point.byte_order);
        let state = match mapping.bit_position {
            Some(bit) => register_bit(word, bit),
            None => word != 0,
        };
        return Ok(PointReading::digital(state ^ point.reverse));
    }

    let raw_value = value_from_registers(raw, point.data_type, point.byte_order)?;
    let number = raw_value
        .as_f64()
        .ok_or_else(|| ComLinkError::conversion("non numeric register value"))?;
    Ok(analog_reading(point, point.to_engineering(number)))
}

/// Build a reading for a coil/discrete input point
pub fn reading_from_bit(point: &DataPointConfig, bit: bool) -> PointReading {
    if point.point_type.is_digital() || point.data_type == DataType::Bool {
        PointReading::digital(bit ^ point.reverse)
    } else {
        analog_reading(point, point.to_engineering(if bit { 1.0 } else { 0.0 }))
    }
}

fn analog_reading(point: &DataPointConfig, value: f64) -> PointReading {
    let reading = PointReading::analog(value, point.unit.clone());
    match point.range {
        Some(range) if !range.contains(value) => reading.with_quality(Quality::Uncertain),
        _ => reading,
    }
}

/// Raw register payload for writing `command` to `point`
pub fn command_registers(point: &DataPointConfig, command: &PointCommand) -> Result<Vec<u16>> {
    let engineering = finite_command_value(point, command)?;
    if let Some(range) = point.range {
        if !range.contains(engineering) {
            return Err(ComLinkError::rejected(format!(
                "value {} outside range [{}, {}] of point {}",
                engineering, range.min, range.max, point.id
            )));
        }
    }
    if point.point_type.is_digital() || point.data_type == DataType::Bool {
        let state = (engineering != 0.0) ^ point.reverse;
        return Ok(vec![u16_to_reg(u16::from(state), point.byte_order)]);
    }
    registers_from_value(
        &ProtocolValue::Float(point.to_raw(engineering)),
        point.data_type,
        point.byte_order,
    )
}

fn finite_command_value(point: &DataPointConfig, command: &PointCommand) -> Result<f64> {
    let value = command.value();
    if !value.is_finite() {
        return Err(ComLinkError::rejected(format!(
            "value {} cannot be written to point {}",
            value, point.id
        )));
    }
    Ok(value)
}

/// Translate a command into the write request for the point's mapping
///
/// Coil points use FC05, single-register points FC06, wider points FC16.
/// Bit points inside a holding register need the current register value
/// (`current_word`) to preserve the other bits.
pub fn build_write_request(
    point: &DataPointConfig,
    mapping: &ModbusMapping,
    command: &PointCommand,
    current_word: Option<u16>,
) -> Result<ModbusRequest> {
    finite_command_value(point, command)?;
    let address = mapping.register_address;
    match mapping.function_code {
        FC_READ_COILS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => {
            let state = (command.value() != 0.0) ^ point.reverse;
            Ok(ModbusRequest::WriteSingleCoil {
                address,
                value: state,
            })
        },
        FC_READ_HOLDING_REGISTERS | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => {
            if let Some(bit) = mapping.bit_position {
                let word = current_word.ok_or_else(|| {
                    ComLinkError::internal("bit write needs the current register value")
                })?;
                let state = (command.value() != 0.0) ^ point.reverse;
                let updated = with_register_bit(reg_to_u16(word, point.byte_order), bit, state);
                return Ok(ModbusRequest::WriteSingleRegister {
                    address,
                    value: u16_to_reg(updated, point.byte_order),
                });
            }
            let values = command_registers(point, command)?;
            if values.len() == 1 && mapping.function_code != FC_WRITE_MULTIPLE_REGISTERS {
                Ok(ModbusRequest::WriteSingleRegister {
                    address,
                    value: values[0],
                })
            } else {
                Ok(ModbusRequest::WriteMultipleRegisters { address, values })
            }
        },
        fc => Err(ComLinkError::rejected(format!(
            "point {} mapped to read-only FC{:02}",
            point.id, fc
        ))),
    }
}

/// Function code used to read a command point back
pub fn read_back_function(mapping: &ModbusMapping) -> Option<u8> {
    match mapping.function_code {
        FC_READ_COILS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => Some(FC_READ_COILS),
        FC_READ_HOLDING_REGISTERS | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => {
            Some(FC_READ_HOLDING_REGISTERS)
        },
        FC_READ_DISCRETE_INPUTS | FC_READ_INPUT_REGISTERS => Some(mapping.function_code),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use voltage_comlink::{ErrorKind, PointType, ValueRange};

    fn holding(id: u32, data_type: DataType, address: u16) -> DataPointConfig {
        DataPointConfig::new(id, format!("p{id}"), PointType::Telemetry, data_type)
            .with_modbus(1, FC_READ_HOLDING_REGISTERS, address)
    }

    #[test]
    fn test_round_trip_all_types_and_orders() {
        let samples: [(DataType, f64); 6] = [
            (DataType::Bool, 1.0),
            (DataType::Int16, -1234.0),
            (DataType::Uint16, 65535.0),
            (DataType::Int32, -2_000_000_000.0),
            (DataType::Uint32, 4_000_000_000.0),
            (DataType::Float32, 1234.5),
        ];
        for order in ByteOrder::ALL {
            for (data_type, value) in samples {
                let regs = registers_from_value(&ProtocolValue::Float(value), data_type, order).unwrap();
                assert_eq!(regs.len(), data_type.register_count() as usize);
                let back = value_from_registers(&regs, data_type, order).unwrap();
                assert_eq!(back.as_f64(), Some(value), "{data_type} {order}");
            }
        }
    }

    #[test]
    fn test_raw_registers_survive_decode_encode() {
        // ordinary float, quiet NaN with payload, +inf
        let samples = [[0xC2F6, 0xE979], [0x7FC0, 0x0001], [0x7F80, 0x0000]];
        for raw in samples {
            for order in ByteOrder::ALL {
                for data_type in [DataType::Int32, DataType::Uint32, DataType::Float32] {
                    let value = value_from_registers(&raw, data_type, order).unwrap();
                    let regs = registers_from_value(&value, data_type, order).unwrap();
                    assert_eq!(regs, raw.to_vec(), "{data_type} {order} {raw:04X?}");
                }
            }
        }

        for word in [0x0000, 0x0001, 0x0002, 0x8000, 0xFFFF] {
            for order in ByteOrder::ALL {
                for data_type in [DataType::Bool, DataType::Uint16, DataType::Int16] {
                    let value = value_from_registers(&[word], data_type, order).unwrap();
                    let regs = registers_from_value(&value, data_type, order).unwrap();
                    assert_eq!(regs, vec![word], "{data_type} {order} {word:04X}");
                }
            }
        }
    }

    #[test]
    fn test_non_finite_commands_are_rejected() {
        let point = holding(1, DataType::Float32, 10);
        let mapping = point.modbus().unwrap().clone();
        for value in [f64::NAN, f64::INFINITY] {
            let command = PointCommand::for_point(PointType::Adjustment, value);
            assert!(command_registers(&point, &command).is_err());
            let err = build_write_request(&point, &mapping, &command, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Command);
        }
    }

    #[test]
    fn test_short_input_is_an_error() {
        assert!(value_from_registers(&[1], DataType::Float32, ByteOrder::BigEndian).is_err());
    }

    #[test]
    fn test_clamp_on_write() {
        let regs =
            registers_from_value(&ProtocolValue::Float(70000.0), DataType::Uint16, ByteOrder::BigEndian).unwrap();
        assert_eq!(regs, vec![0xFFFF]);
        let regs =
            registers_from_value(&ProtocolValue::Float(-40000.0), DataType::Int16, ByteOrder::BigEndian).unwrap();
        assert_eq!(regs, vec![0x8000]);
        assert_eq!(clamp_to_data_type(12.6, DataType::Uint16), 13.0);
        assert_eq!(clamp_to_data_type(12.6, DataType::Float32), 12.6);
    }

    #[test]
    fn test_scaled_reading() {
        let point = holding(1, DataType::Uint16, 100).with_scaling(0.1, 0.0);
        let mapping = *point.modbus().unwrap();
        let reading = reading_from_registers(&point, &mapping, &[2345]).unwrap();
        assert!((reading.as_f64() - 234.5).abs() < 1e-9);
        assert!(reading.quality().is_good());
    }

    #[test]
    fn test_out_of_range_reading_is_uncertain() {
        let mut point = holding(1, DataType::Int16, 0);
        point.range = Some(ValueRange {
            min: 0.0,
            max: 100.0,
        });
        let mapping = *point.modbus().unwrap();
        let reading = reading_from_registers(&point, &mapping, &[150]).unwrap();
        assert_eq!(reading.quality(), Quality::Uncertain);
    }

    #[test]
    fn test_bit_in_register() {
        let mut point = DataPointConfig::new(2, "alarm", PointType::Signal, DataType::Bool)
            .with_modbus(1, FC_READ_HOLDING_REGISTERS, 10);
        point.modbus_mut().unwrap().bit_position = Some(3);
        let mapping = *point.modbus().unwrap();
        assert_eq!(reading_from_registers(&point, &mapping, &[0b1000]).unwrap().as_f64(), 1.0);
        assert_eq!(reading_from_registers(&point, &mapping, &[0b0100]).unwrap().as_f64(), 0.0);

        point.reverse = true;
        assert_eq!(reading_from_registers(&point, &mapping, &[0b1000]).unwrap().as_f64(), 0.0);
    }

    #[test]
    fn test_write_requests() {
        let point = DataPointConfig::new(3, "setpoint", PointType::Adjustment, DataType::Float32)
            .with_modbus(1, FC_READ_HOLDING_REGISTERS, 200);
        let mapping = *point.modbus().unwrap();
        let cmd = PointCommand::for_point(PointType::Adjustment, 25.0);
        let req = build_write_request(&point, &mapping, &cmd, None).unwrap();
        assert_eq!(
            req,
            ModbusRequest::WriteMultipleRegisters {
                address: 200,
                values: vec![0x41C8, 0x0000]
            }
        );

        let coil = DataPointConfig::new(4, "breaker", PointType::Control, DataType::Bool)
            .with_modbus(1, FC_WRITE_SINGLE_COIL, 5);
        let mapping = *coil.modbus().unwrap();
        let cmd = PointCommand::for_point(PointType::Control, 1.0);
        assert_eq!(
            build_write_request(&coil, &mapping, &cmd, None).unwrap(),
            ModbusRequest::WriteSingleCoil {
                address: 5,
                value: true
            }
        );

        let input = DataPointConfig::new(5, "ro", PointType::Adjustment, DataType::Uint16)
            .with_modbus(1, FC_READ_INPUT_REGISTERS, 5);
        let mapping = *input.modbus().unwrap();
        assert!(matches!(
            build_write_request(&input, &mapping, &cmd, None),
            Err(ComLinkError::CommandRejected(_))
        ));
    }

    #[test]
    fn test_bit_write_preserves_other_bits() {
        let mut point = DataPointConfig::new(6, "flag", PointType::Control, DataType::Bool)
            .with_modbus(1, FC_READ_HOLDING_REGISTERS, 7);
        point.modbus_mut().unwrap().bit_position = Some(0);
        let mapping = *point.modbus().unwrap();
        let cmd = PointCommand::for_point(PointType::Control, 1.0);
        let req = build_write_request(&point, &mapping, &cmd, Some(0xF0F0)).unwrap();
        assert_eq!(
            req,
            ModbusRequest::WriteSingleRegister {
                address: 7,
                value: 0xF0F1
            }
        );
    }

    #[test]
    fn test_command_outside_range_rejected() {
        let mut point = holding(9, DataType::Uint16, 0);
        point.point_type = PointType::Adjustment;
        point.range = Some(ValueRange { min: 0.0, max: 10.0 });
        let cmd = PointCommand::for_point(PointType::Adjustment, 11.0);
        assert!(command_registers(&point, &cmd).is_err());
    }
}
