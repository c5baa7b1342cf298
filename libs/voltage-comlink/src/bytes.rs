//! Binary data processing utilities
//!
//! Protocol-agnostic byte order handling, bit extraction and register
//! conversions shared by the Modbus and CAN engines.

pub mod bit_ops;
pub mod byte_order;
pub mod conversions;

pub use bit_ops::*;
pub use byte_order::ByteOrder;
pub use conversions::*;
