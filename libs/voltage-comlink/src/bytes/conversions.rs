//! Register ↔ numeric conversions with byte order support
//!
//! All functions are total: 16-bit orders used with 32-bit values widen to
//! their 32-bit form instead of failing.

use super::ByteOrder;

// ============================================================================
// 16-bit
// ============================================================================

/// Register as received → logical 16-bit value
#[inline]
pub fn reg_to_u16(reg: u16, order: ByteOrder) -> u16 {
    if order.swaps_bytes() {
        reg.swap_bytes()
    } else {
        reg
    }
}

/// Logical 16-bit value → register to transmit
#[inline]
pub fn u16_to_reg(value: u16, order: ByteOrder) -> u16 {
    // byte swapping is its own inverse
    reg_to_u16(value, order)
}

#[inline]
pub fn reg_to_i16(reg: u16, order: ByteOrder) -> i16 {
    reg_to_u16(reg, order) as i16
}

// ============================================================================
// 32-bit
// ============================================================================

/// Two registers → the value's bytes in ABCD (big-endian) order
pub fn regs_to_bytes_4(regs: [u16; 2], order: ByteOrder) -> [u8; 4] {
    let order = order.widen();
    let mut words = regs.map(|r| reg_to_u16(r, order));
    if order.swaps_words() {
        words.swap(0, 1);
    }
    let [a, b] = words[0].to_be_bytes();
    let [c, d] = words[1].to_be_bytes();
    [a, b, c, d]
}

/// Value bytes in ABCD order → two registers to transmit
pub fn bytes_4_to_regs(bytes: [u8; 4], order: ByteOrder) -> [u16; 2] {
    let order = order.widen();
    let mut words = [
        u16::from_be_bytes([bytes[0], bytes[1]]),
        u16::from_be_bytes([bytes[2], bytes[3]]),
    ];
    if order.swaps_words() {
        words.swap(0, 1);
    }
    words.map(|w| u16_to_reg(w, order))
}

pub fn regs_to_u32(regs: [u16; 2], order: ByteOrder) -> u32 {
    u32::from_be_bytes(regs_to_bytes_4(regs, order))
}

pub fn regs_to_i32(regs: [u16; 2], order: ByteOrder) -> i32 {
    i32::from_be_bytes(regs_to_bytes_4(regs, order))
}

pub fn regs_to_f32(regs: [u16; 2], order: ByteOrder) -> f32 {
    f32::from_be_bytes(regs_to_bytes_4(regs, order))
}

pub fn u32_to_regs(value: u32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

pub fn i32_to_regs(value: i32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

pub fn f32_to_regs(value: f32, order: ByteOrder) -> [u16; 2] {
    bytes_4_to_regs(value.to_be_bytes(), order)
}

// ============================================================================
// Wire helpers
// ============================================================================

/// Big-endian register bytes as they appear in a Modbus PDU
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

pub fn registers_to_bytes(regs: &[u16]) -> Vec<u8> {
    regs.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Unpack LSB-first packed bits (coil/discrete input payload)
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<bool> {
    (0..count)
        .map(|i| {
            bytes
                .get(i / 8)
                .map(|b| (b >> (i % 8)) & 0x01 == 1)
                .unwrap_or(false)
        })
        .collect()
}

/// Pack bits LSB-first into `ceil(n / 8)` bytes
pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
    let mut out = vec![0u8; bits.len().div_ceil(8)];
    for (i, bit) in bits.iter().enumerate() {
        if *bit {
            out[i / 8] |= 1 << (i % 8);
        }
    }
    out
}
