//! Modbus protocol constants
//!
//! Limits follow from the 253 byte PDU inherited from the RS485 ADU
//! (256 bytes - slave address - CRC).

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP header: transaction id(2) + protocol id(2) + length(2) + unit id(1)
pub const MBAP_HEADER_LEN: usize = 7;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (unit id + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

/// Smallest RTU frame: address + function + exception code + CRC
pub const MIN_RTU_FRAME_LEN: usize = 5;

/// Unit id addressing every slave on a line, writes only, never answered
pub const BROADCAST_UNIT_ID: u8 = 0;

// ============================================================================
// Operation Limits
// ============================================================================

/// FC03/FC04: 1 + 1 + 2N <= 253
pub const MAX_READ_REGISTERS: u16 = 125;

/// FC01/FC02: 1 + 1 + ceil(N/8) <= 253, capped by the standard at 2000
pub const MAX_READ_BITS: u16 = 2000;

/// FC16: 1 + 2 + 2 + 1 + 2N <= 253
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// FC15: 1 + 2 + 2 + 1 + ceil(N/8) <= 253
pub const MAX_WRITE_COILS: u16 = 1968;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Exception flag on the function code
pub const EXCEPTION_FLAG: u8 = 0x80;

/// FC05 payload for ON
pub const COIL_ON: u16 = 0xFF00;
pub const COIL_OFF: u16 = 0x0000;

/// Read function codes operate on single bits
pub fn is_bit_function(fc: u8) -> bool {
    matches!(fc, FC_READ_COILS | FC_READ_DISCRETE_INPUTS)
}

pub fn is_read_function(fc: u8) -> bool {
    matches!(fc, 0x01..=0x04)
}

/// Largest read burst for a function code
pub fn max_read_quantity(fc: u8) -> u16 {
    if is_bit_function(fc) {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    }
}
