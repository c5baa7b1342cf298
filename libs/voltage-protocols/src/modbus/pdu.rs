//! Modbus PDU encoding and decoding
//!
//! Requests and responses are modelled as enums; the byte representation uses
//! a fixed-size stack buffer.

use std::fmt;
use tracing::debug;
use voltage_comlink::bytes::{bytes_to_registers, pack_bits, registers_to_bytes, unpack_bits};
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::*;

/// PDU with stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl ModbusPdu {
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PDU_SIZE {
            return Err(ComLinkError::malformed(format!(
                "PDU too large: {} bytes (max {})",
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.len >= MAX_PDU_SIZE {
            return Err(ComLinkError::malformed("PDU buffer full"));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<()> {
        self.extend(&value.to_be_bytes())
    }

    pub fn extend(&mut self, data: &[u8]) -> Result<()> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(ComLinkError::malformed(format!(
                "PDU would exceed max size: {} + {} > {}",
                self.len,
                data.len(),
                MAX_PDU_SIZE
            )));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModbusPdu({:02X?})", self.as_slice())
    }
}

/// Exception codes a slave may answer with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionCode {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Other(u8),
}

impl ExceptionCode {
    pub fn code(&self) -> u8 {
        match self {
            ExceptionCode::IllegalFunction => 0x01,
            ExceptionCode::IllegalDataAddress => 0x02,
            ExceptionCode::IllegalDataValue => 0x03,
            ExceptionCode::SlaveDeviceFailure => 0x04,
            ExceptionCode::Other(code) => *code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ExceptionCode::IllegalFunction,
            0x02 => ExceptionCode::IllegalDataAddress,
            0x03 => ExceptionCode::IllegalDataValue,
            0x04 => ExceptionCode::SlaveDeviceFailure,
            other => ExceptionCode::Other(other),
        }
    }

    pub fn description(&self) -> &'static str {
        match self.code() {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Slave Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Slave Device Busy",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
    }
}

/// Request PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusRequest {
    ReadCoils { address: u16, quantity: u16 },
    ReadDiscreteInputs { address: u16, quantity: u16 },
    ReadHoldingRegisters { address: u16, quantity: u16 },
    ReadInputRegisters { address: u16, quantity: u16 },
    WriteSingleCoil { address: u16, value: bool },
    WriteSingleRegister { address: u16, value: u16 },
    WriteMultipleCoils { address: u16, values: Vec<bool> },
    WriteMultipleRegisters { address: u16, values: Vec<u16> },
}

impl ModbusRequest {
    /// Read request for a function code 1-4
    pub fn read(function_code: u8, address: u16, quantity: u16) -> Result<Self> {
        if quantity == 0 || quantity > max_read_quantity(function_code) {
            return Err(ComLinkError::config(format!(
                "FC{:02} quantity {} out of range",
                function_code, quantity
            )));
        }
        match function_code {
            FC_READ_COILS => Ok(ModbusRequest::ReadCoils { address, quantity }),
            FC_READ_DISCRETE_INPUTS => Ok(ModbusRequest::ReadDiscreteInputs { address, quantity }),
            FC_READ_HOLDING_REGISTERS => {
                Ok(ModbusRequest::ReadHoldingRegisters { address, quantity })
            },
            FC_READ_INPUT_REGISTERS => Ok(ModbusRequest::ReadInputRegisters { address, quantity }),
            other => Err(ComLinkError::config(format!(
                "FC{:02} is not a read function",
                other
            ))),
        }
    }

    pub fn function_code(&self) -> u8 {
        match self {
            ModbusRequest::ReadCoils { .. } => FC_READ_COILS,
            ModbusRequest::ReadDiscreteInputs { .. } => FC_READ_DISCRETE_INPUTS,
            ModbusRequest::ReadHoldingRegisters { .. } => FC_READ_HOLDING_REGISTERS,
            ModbusRequest::ReadInputRegisters { .. } => FC_READ_INPUT_REGISTERS,
            ModbusRequest::WriteSingleCoil { .. } => FC_WRITE_SINGLE_COIL,
            ModbusRequest::WriteSingleRegister { .. } => FC_WRITE_SINGLE_REGISTER,
            ModbusRequest::WriteMultipleCoils { .. } => FC_WRITE_MULTIPLE_COILS,
            ModbusRequest::WriteMultipleRegisters { .. } => FC_WRITE_MULTIPLE_REGISTERS,
        }
    }

    pub fn is_write(&self) -> bool {
        self.function_code() >= FC_WRITE_SINGLE_COIL
    }

    /// Quantity of bits/registers a read expects back
    pub fn read_quantity(&self) -> Option<u16> {
        match self {
            ModbusRequest::ReadCoils { quantity, .. }
            | ModbusRequest::ReadDiscreteInputs { quantity, .. }
            | ModbusRequest::ReadHoldingRegisters { quantity, .. }
            | ModbusRequest::ReadInputRegisters { quantity, .. } => Some(*quantity),
            _ => None,
        }
    }

    pub fn encode(&self) -> Result<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        pdu.push(self.function_code())?;
        match self {
            ModbusRequest::ReadCoils { address, quantity }
            | ModbusRequest::ReadDiscreteInputs { address, quantity }
            | ModbusRequest::ReadHoldingRegisters { address, quantity }
            | ModbusRequest::ReadInputRegisters { address, quantity } => {
                pdu.push_u16(*address)?;
                pdu.push_u16(*quantity)?;
            },
            ModbusRequest::WriteSingleCoil { address, value } => {
                pdu.push_u16(*address)?;
                pdu.push_u16(if *value { COIL_ON } else { COIL_OFF })?;
            },
            ModbusRequest::WriteSingleRegister { address, value } => {
                pdu.push_u16(*address)?;
                pdu.push_u16(*value)?;
            },
            ModbusRequest::WriteMultipleCoils { address, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_COILS as usize {
                    return Err(ComLinkError::rejected(format!(
                        "FC15 coil count {} out of range",
                        values.len()
                    )));
                }
                let packed = pack_bits(values);
                pdu.push_u16(*address)?;
                pdu.push_u16(values.len() as u16)?;
                pdu.push(packed.len() as u8)?;
                pdu.extend(&packed)?;
            },
            ModbusRequest::WriteMultipleRegisters { address, values } => {
                if values.is_empty() || values.len() > MAX_WRITE_REGISTERS as usize {
                    return Err(ComLinkError::rejected(format!(
                        "FC16 register count {} out of range",
                        values.len()
                    )));
                }
                pdu.push_u16(*address)?;
                pdu.push_u16(values.len() as u16)?;
                pdu.push((values.len() * 2) as u8)?;
                pdu.extend(&registers_to_bytes(values))?;
            },
        }
        Ok(pdu)
    }

    /// Parse a request PDU (slave side). Failures map to the exception to answer with.
    pub fn parse(pdu: &[u8]) -> std::result::Result<Self, ExceptionCode> {
        let (&fc, body) = pdu.split_first().ok_or(ExceptionCode::IllegalFunction)?;
        let u16_at = |i: usize| -> std::result::Result<u16, ExceptionCode> {
            body.get(i..i + 2)
                .map(|b| u16::from_be_bytes([b[0], b[1]]))
                .ok_or(ExceptionCode::IllegalDataValue)
        };

        match fc {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS | FC_READ_HOLDING_REGISTERS
            | FC_READ_INPUT_REGISTERS => {
                let address = u16_at(0)?;
                let quantity = u16_at(2)?;
                if quantity == 0 || quantity > max_read_quantity(fc) {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                ModbusRequest::read(fc, address, quantity)
                    .map_err(|_| ExceptionCode::IllegalDataValue)
            },
            FC_WRITE_SINGLE_COIL => {
                let address = u16_at(0)?;
                let value = match u16_at(2)? {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ExceptionCode::IllegalDataValue),
                };
                Ok(ModbusRequest::WriteSingleCoil { address, value })
            },
            FC_WRITE_SINGLE_REGISTER => Ok(ModbusRequest::WriteSingleRegister {
                address: u16_at(0)?,
                value: u16_at(2)?,
            }),
            FC_WRITE_MULTIPLE_COILS => {
                let address = u16_at(0)?;
                let quantity = u16_at(2)?;
                let byte_count = *body.get(4).ok_or(ExceptionCode::IllegalDataValue)? as usize;
                if quantity == 0
                    || quantity > MAX_WRITE_COILS
                    || byte_count != (quantity as usize).div_ceil(8)
                    || body.len() < 5 + byte_count
                {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let values = unpack_bits(&body[5..5 + byte_count], quantity as usize);
                Ok(ModbusRequest::WriteMultipleCoils { address, values })
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let address = u16_at(0)?;
                let quantity = u16_at(2)?;
                let byte_count = *body.get(4).ok_or(ExceptionCode::IllegalDataValue)? as usize;
                if quantity == 0
                    || quantity > MAX_WRITE_REGISTERS
                    || byte_count != quantity as usize * 2
                    || body.len() < 5 + byte_count
                {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                let values = bytes_to_registers(&body[5..5 + byte_count]);
                Ok(ModbusRequest::WriteMultipleRegisters { address, values })
            },
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }
}

/// Decoded response PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModbusResponse {
    /// FC01/FC02 payload, truncated to the requested quantity
    Bits(Vec<bool>),
    /// FC03/FC04 payload
    Registers(Vec<u16>),
    /// Echo of FC05/06/15/16: address and value (single) or quantity (multiple)
    WriteAck { address: u16, value: u16 },
    /// Exception response; a valid frame, failed at the protocol level
    Exception { function: u8, code: ExceptionCode },
}

impl ModbusResponse {
    /// Turn an exception value into an error for callers that need data
    pub fn into_result(self) -> Result<Self> {
        match self {
            ModbusResponse::Exception { function, code } => Err(ComLinkError::Exception {
                function,
                code: code.code(),
            }),
            other => Ok(other),
        }
    }

    /// Build the response PDU (slave side)
    pub fn encode(&self, function_code: u8) -> Result<ModbusPdu> {
        let mut pdu = ModbusPdu::new();
        match self {
            ModbusResponse::Bits(bits) => {
                let packed = pack_bits(bits);
                pdu.push(function_code)?;
                pdu.push(packed.len() as u8)?;
                pdu.extend(&packed)?;
            },
            ModbusResponse::Registers(regs) => {
                pdu.push(function_code)?;
                pdu.push((regs.len() * 2) as u8)?;
                pdu.extend(&registers_to_bytes(regs))?;
            },
            ModbusResponse::WriteAck { address, value } => {
                pdu.push(function_code)?;
                pdu.push_u16(*address)?;
                pdu.push_u16(*value)?;
            },
            ModbusResponse::Exception { function, code } => {
                pdu.push(function | EXCEPTION_FLAG)?;
                pdu.push(code.code())?;
            },
        }
        Ok(pdu)
    }
}

/// Decode a response PDU for `request`
///
/// Exception responses are returned as [`ModbusResponse::Exception`], never as
/// an error. Errors mean the frame itself is malformed.
pub fn decode_response(pdu: &[u8], request: &ModbusRequest) -> Result<ModbusResponse> {
    let expected_fc = request.function_code();
    let (&fc, body) = pdu
        .split_first()
        .ok_or_else(|| ComLinkError::malformed("empty response PDU"))?;

    if fc & EXCEPTION_FLAG != 0 {
        let function = fc & !EXCEPTION_FLAG;
        if function != expected_fc {
            return Err(ComLinkError::malformed(format!(
                "exception for FC{:02X}, expected FC{:02X}",
                function, expected_fc
            )));
        }
        let code = *body
            .first()
            .ok_or_else(|| ComLinkError::malformed("exception response without code"))?;
        let code = ExceptionCode::from_code(code);
        debug!("Exception FC{:02X}: {}", function, code.description());
        return Ok(ModbusResponse::Exception { function, code });
    }

    if fc != expected_fc {
        return Err(ComLinkError::malformed(format!(
            "function code mismatch: expected {:02X}, got {:02X}",
            expected_fc, fc
        )));
    }

    if let Some(quantity) = request.read_quantity() {
        let byte_count = *body
            .first()
            .ok_or_else(|| ComLinkError::malformed("read response without byte count"))?
            as usize;
        let data = body.get(1..1 + byte_count).ok_or_else(|| {
            ComLinkError::malformed(format!(
                "byte count {} exceeds payload {}",
                byte_count,
                body.len().saturating_sub(1)
            ))
        })?;

        return if is_bit_function(fc) {
            let expected = (quantity as usize).div_ceil(8);
            if byte_count != expected {
                return Err(ComLinkError::malformed(format!(
                    "FC{:02X} byte count {} != {}",
                    fc, byte_count, expected
                )));
            }
            Ok(ModbusResponse::Bits(unpack_bits(data, quantity as usize)))
        } else {
            let expected = quantity as usize * 2;
            if byte_count != expected {
                return Err(ComLinkError::malformed(format!(
                    "FC{:02X} byte count {} != {}",
                    fc, byte_count, expected
                )));
            }
            Ok(ModbusResponse::Registers(bytes_to_registers(data)))
        };
    }

    if body.len() < 4 {
        return Err(ComLinkError::malformed("write response too short"));
    }
    let address = u16::from_be_bytes([body[0], body[1]]);
    let value = u16::from_be_bytes([body[2], body[3]]);
    Ok(ModbusResponse::WriteAck { address, value })
}

/// Expected response PDU length for `request`, once the first two PDU bytes are known
///
/// Used by RTU where frames have no length field.
pub fn expected_response_pdu_len(request: &ModbusRequest, head: [u8; 2]) -> usize {
    if head[0] & EXCEPTION_FLAG != 0 {
        return 2;
    }
    if request.read_quantity().is_some() {
        2 + head[1] as usize
    } else {
        5
    }
}
