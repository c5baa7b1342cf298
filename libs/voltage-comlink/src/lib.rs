//! Voltage Communication Link Library
//!
//! Protocol-agnostic building blocks for the communication service.
//!
//! # Architecture
//!
//! - **Types**: channel/point configuration, runtime values, commands, status
//! - **Core Traits**: [`ProtocolEngine`] implemented by every protocol
//! - **Transport**: TCP client/listener, serial line, SocketCAN, mock
//! - **Bytes Utilities**: byte order handling, bit operations, register conversions
//!
//! # Features
//!
//! - `can-linux` - SocketCAN support (Linux only)
//! - `test-utils` - exports `MockTransport` for downstream tests

pub mod bytes;
pub mod error;
pub mod traits;
pub mod transport;
pub mod types;

// Re-export core types
pub use bytes::ByteOrder;
pub use error::{ComLinkError, ErrorKind, Result};
pub use traits::{ChannelLogger, ConnectionState, CycleOutput, ProtocolEngine, ProtocolValue};
pub use transport::{Transport, TransportError, TransportKind};
pub use types::{
    AnalogCommand, AnalogValue, CanBitOrder, CanMapping, ChannelConfig, ChannelStatus,
    CommandOutcome, DataPointConfig, DataType, DeviceRole, DigitalCommand, DigitalValue,
    Iec104Mapping, InterfaceKind, ModbusMapping, PointCommand, PointReading, PointTable,
    PointType, PointUpdate, ProtocolMapping, Quality, TelemetryBatch, ValueRange,
};
