//! Byte and word ordering for multi-register values
//!
//! Uses ABCD notation, A being the most significant byte. For the 32-bit
//! value `0x12345678` transmitted in two registers:
//!
//! | order | register 0 | register 1 |
//! |-------|------------|------------|
//! | ABCD  | `0x1234`   | `0x5678`   |
//! | DCBA  | `0x7856`   | `0x3412`   |
//! | CDAB  | `0x5678`   | `0x1234`   |
//! | BADC  | `0x3412`   | `0x7856`   |

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Byte/word order of a point value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ByteOrder {
    /// ABCD, big-endian
    #[default]
    BigEndian,
    /// DCBA, little-endian
    LittleEndian,
    /// CDAB, big-endian bytes with swapped words (common on PLCs)
    BigEndianSwap,
    /// BADC, swapped bytes inside big-endian word order
    LittleEndianSwap,
    /// AB, 16-bit big-endian
    BigEndian16,
    /// BA, 16-bit with swapped bytes
    LittleEndian16,
}

impl ByteOrder {
    /// Every supported order
    pub const ALL: [ByteOrder; 6] = [
        ByteOrder::BigEndian,
        ByteOrder::LittleEndian,
        ByteOrder::BigEndianSwap,
        ByteOrder::LittleEndianSwap,
        ByteOrder::BigEndian16,
        ByteOrder::LittleEndian16,
    ];

    /// Parse common spellings ("ABCD", "AB-CD", "BE", "big_endian", ...)
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_uppercase().replace('-', "");
        match normalized.as_str() {
            "ABCD" | "BE" | "BIG_ENDIAN" | "BIGENDIAN" => Some(Self::BigEndian),
            "DCBA" | "LE" | "LITTLE_ENDIAN" | "LITTLEENDIAN" => Some(Self::LittleEndian),
            "CDAB" | "BIG_ENDIAN_SWAP" | "BIGENDIANSWAP" => Some(Self::BigEndianSwap),
            "BADC" | "LITTLE_ENDIAN_SWAP" | "LITTLEENDIANSWAP" => Some(Self::LittleEndianSwap),
            "AB" => Some(Self::BigEndian16),
            "BA" => Some(Self::LittleEndian16),
            _ => None,
        }
    }

    /// Canonical ABCD code
    pub fn code(&self) -> &'static str {
        match self {
            Self::BigEndian => "ABCD",
            Self::LittleEndian => "DCBA",
            Self::BigEndianSwap => "CDAB",
            Self::LittleEndianSwap => "BADC",
            Self::BigEndian16 => "AB",
            Self::LittleEndian16 => "BA",
        }
    }

    pub fn is_16bit_only(&self) -> bool {
        matches!(self, Self::BigEndian16 | Self::LittleEndian16)
    }

    /// Bytes inside each 16-bit word are swapped
    pub fn swaps_bytes(&self) -> bool {
        matches!(
            self,
            Self::LittleEndian | Self::LittleEndianSwap | Self::LittleEndian16
        )
    }

    /// Word order of 32-bit values is reversed
    pub fn swaps_words(&self) -> bool {
        matches!(self, Self::LittleEndian | Self::BigEndianSwap)
    }

    /// Order to use for a 32-bit value; 16-bit orders widen to their 32-bit form
    pub fn widen(&self) -> Self {
        match self {
            Self::BigEndian16 => Self::BigEndian,
            Self::LittleEndian16 => Self::LittleEndianSwap,
            other => *other,
        }
    }
}

impl fmt::Display for ByteOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for ByteOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown byte order '{s}'"))
    }
}

impl Serialize for ByteOrder {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for ByteOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spellings() {
        assert_eq!(ByteOrder::parse("ABCD"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::parse("ab-cd"), Some(ByteOrder::BigEndian));
        assert_eq!(ByteOrder::parse("LE"), Some(ByteOrder::LittleEndian));
        assert_eq!(ByteOrder::parse("CDAB"), Some(ByteOrder::BigEndianSwap));
        assert_eq!(ByteOrder::parse("BADC"), Some(ByteOrder::LittleEndianSwap));
        assert_eq!(ByteOrder::parse("BA"), Some(ByteOrder::LittleEndian16));
        assert_eq!(ByteOrder::parse("XYZW"), None);
        assert_eq!(ByteOrder::parse(""), None);
    }

    #[test]
    fn test_code_parses_back() {
        for order in ByteOrder::ALL {
            assert_eq!(ByteOrder::parse(order.code()), Some(order));
        }
    }

    #[test]
    fn test_serde_as_code() {
        let json = serde_json::to_string(&ByteOrder::BigEndianSwap).unwrap();
        assert_eq!(json, "\"CDAB\"");
        let back: ByteOrder = serde_json::from_str("\"dcba\"").unwrap();
        assert_eq!(back, ByteOrder::LittleEndian);
        assert!(serde_json::from_str::<ByteOrder>("\"nope\"").is_err());
    }

    #[test]
    fn test_flags() {
        assert!(ByteOrder::LittleEndian.swaps_bytes());
        assert!(ByteOrder::LittleEndian.swaps_words());
        assert!(ByteOrder::BigEndianSwap.swaps_words());
        assert!(!ByteOrder::BigEndianSwap.swaps_bytes());
        assert!(ByteOrder::LittleEndianSwap.swaps_bytes());
        assert!(!ByteOrder::LittleEndianSwap.swaps_words());
        assert_eq!(ByteOrder::LittleEndian16.widen(), ByteOrder::LittleEndianSwap);
    }
}
