//! Modbus ADU framing: MBAP header for TCP, address + CRC16 for RTU

use bytes::{BufMut, BytesMut};
use voltage_comlink::error::{ComLinkError, Result};

use super::constants::{MAX_MBAP_LENGTH, MBAP_HEADER_LEN, MIN_RTU_FRAME_LEN};

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    /// Always 0 for Modbus
    pub protocol_id: u16,
    /// Bytes following the length field (unit id + PDU)
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
            unit_id: bytes[6],
        };
        if header.protocol_id != 0 {
            return Err(ComLinkError::malformed(format!(
                "invalid protocol id {}",
                header.protocol_id
            )));
        }
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(ComLinkError::malformed(format!(
                "invalid MBAP length {}",
                header.length
            )));
        }
        Ok(header)
    }

    /// PDU bytes following the header
    pub fn pdu_len(&self) -> usize {
        self.length as usize - 1
    }
}

/// Build a TCP ADU
pub fn encode_tcp(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + pdu.len());
    frame.put_u16(transaction_id);
    frame.put_u16(0);
    frame.put_u16((pdu.len() + 1) as u16);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    frame.to_vec()
}

/// CRC16/MODBUS: polynomial 0xA001 (reflected 0x8005), init 0xFFFF
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Build an RTU ADU; the CRC is appended low byte first
pub fn encode_rtu(unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::with_capacity(pdu.len() + 3);
    frame.put_u8(unit_id);
    frame.put_slice(pdu);
    let crc = crc16(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// Validate an RTU ADU and split it into unit id and PDU
pub fn decode_rtu(frame: &[u8]) -> Result<(u8, &[u8])> {
    if frame.len() < MIN_RTU_FRAME_LEN - 1 {
        return Err(ComLinkError::malformed(format!(
            "RTU frame too short: {} bytes",
            frame.len()
        )));
    }
    let (body, crc_bytes) = frame.split_at(frame.len() - 2);
    let actual = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected = crc16(body);
    if actual != expected {
        return Err(ComLinkError::Crc { expected, actual });
    }
    Ok((body[0], &body[1..]))
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_reference_vector() {
        // CRC-16/MODBUS check value over ASCII "123456789"
        assert_eq!(crc16(b"123456789"), 0x4B37);
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01]), 0x0A84);
    }

    #[test]
    fn test_rtu_frame_layout() {
        let frame = encode_rtu(0x01, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
        let (unit, pdu) = decode_rtu(&frame).unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu, &[0x03, 0x00, 0x00, 0x00, 0x01]);
    }

    #[test]
    fn test_rtu_crc_mismatch() {
        let mut frame = encode_rtu(0x11, &[0x03, 0x02, 0x00, 0x2A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        assert!(matches!(decode_rtu(&frame), Err(ComLinkError::Crc { .. })));
        assert!(decode_rtu(&[0x01, 0x02]).is_err());
    }

    #[test]
    fn test_tcp_frame_layout() {
        let frame = encode_tcp(0x0102, 0x11, &[0x03, 0x00, 0x6B, 0x00, 0x03]);
        assert_eq!(
            frame,
            vec![0x01, 0x02, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );

        let mut head = [0u8; MBAP_HEADER_LEN];
        head.copy_from_slice(&frame[..MBAP_HEADER_LEN]);
        let header = MbapHeader::parse(&head).unwrap();
        assert_eq!(header.transaction_id, 0x0102);
        assert_eq!(header.unit_id, 0x11);
        assert_eq!(header.pdu_len(), 5);
    }

    #[test]
    fn test_mbap_rejects_bad_headers() {
        assert!(MbapHeader::parse(&[0, 1, 0, 1, 0, 6, 1]).is_err());
        assert!(MbapHeader::parse(&[0, 1, 0, 0, 0x01, 0x00, 1]).is_err());
        assert!(MbapHeader::parse(&[0, 1, 0, 0, 0, 1, 1]).is_err());
    }
}
