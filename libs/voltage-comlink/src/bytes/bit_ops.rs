//! Bit-level helpers for CAN signals and bit points inside registers

/// Test one bit of a register
#[inline]
pub fn register_bit(value: u16, bit: u8) -> bool {
    bit < 16 && (value >> bit) & 0x01 == 1
}

/// Set or clear one bit of a register
#[inline]
pub fn with_register_bit(value: u16, bit: u8, on: bool) -> u16 {
    if bit >= 16 {
        return value;
    }
    if on {
        value | (1 << bit)
    } else {
        value & !(1 << bit)
    }
}

/// Extract `bit_length` bits starting at `start_bit`, LSB-first (Intel layout)
///
/// Bits beyond the end of `bytes` read as zero.
pub fn extract_bits(bytes: &[u8], start_bit: u16, bit_length: u8) -> u64 {
    let mut result = 0u64;
    for i in 0..bit_length.min(64) {
        let pos = start_bit as usize + i as usize;
        if let Some(byte) = bytes.get(pos / 8) {
            result |= u64::from((byte >> (pos % 8)) & 0x01) << i;
        }
    }
    result
}

/// Extract a big-endian (Motorola) signal
///
/// `start_bit` names the most significant bit in DBC numbering; following
/// bits walk towards bit 0 of a byte and then continue at bit 7 of the next
/// byte.
pub fn extract_bits_motorola(bytes: &[u8], start_bit: u16, bit_length: u8) -> u64 {
    let mut result = 0u64;
    let mut pos = start_bit as usize;
    for _ in 0..bit_length.min(64) {
        let bit = bytes
            .get(pos / 8)
            .map(|b| u64::from((b >> (pos % 8)) & 0x01))
            .unwrap_or(0);
        result = (result << 1) | bit;
        pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
    }
    result
}

/// Sign-extend the low `bit_length` bits of `raw`
pub fn sign_extend(raw: u64, bit_length: u8) -> i64 {
    if bit_length == 0 || bit_length >= 64 {
        return raw as i64;
    }
    let shift = 64 - u32::from(bit_length);
    ((raw << shift) as i64) >> shift
}

/// Write the low `bit_length` bits of `value` at `start_bit`, LSB-first
pub fn insert_bits(bytes: &mut [u8], start_bit: u16, bit_length: u8, value: u64) {
    for i in 0..bit_length.min(64) {
        let pos = start_bit as usize + i as usize;
        if let Some(byte) = bytes.get_mut(pos / 8) {
            let mask = 1u8 << (pos % 8);
            if (value >> i) & 0x01 == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
    }
}

/// Write a Motorola signal, inverse of [`extract_bits_motorola`]
pub fn insert_bits_motorola(bytes: &mut [u8], start_bit: u16, bit_length: u8, value: u64) {
    let len = bit_length.min(64);
    let mut pos = start_bit as usize;
    for i in (0..len).rev() {
        if let Some(byte) = bytes.get_mut(pos / 8) {
            let mask = 1u8 << (pos % 8);
            if (value >> i) & 0x01 == 1 {
                *byte |= mask;
            } else {
                *byte &= !mask;
            }
        }
        pos = if pos % 8 == 0 { pos + 15 } else { pos - 1 };
    }
}
