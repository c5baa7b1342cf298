//! Modbus Protocol Implementation
//!
//! Master and slave engines for Modbus TCP and RTU.
//!
//! # Architecture
//!
//! ```text
//! voltage-protocols/modbus
//!     ├── constants (function codes, protocol limits)
//!     ├── pdu       (request/response PDUs, exception codes)
//!     ├── frame     (MBAP header, RTU address + CRC16)
//!     ├── codec     (registers <-> typed values, write requests)
//!     ├── planner   (points -> merged read ranges)
//!     ├── master    (ModbusMaster: poll cycles, commands)
//!     ├── slave     (ModbusSlave: register map server)
//!     └── types     (channel parameters, batching)
//! ```

pub mod codec;
pub mod constants;
pub mod frame;
pub mod master;
pub mod pdu;
pub mod planner;
pub mod slave;
pub mod types;

pub use codec::{build_write_request, clamp_to_data_type, registers_from_value, value_from_registers};
pub use frame::{crc16, decode_rtu, encode_rtu, encode_tcp, MbapHeader};
pub use master::{Framing, ModbusMaster};
pub use pdu::{ExceptionCode, ModbusPdu, ModbusRequest, ModbusResponse};
pub use planner::{plan_reads, AddressRange};
pub use slave::{ModbusSlave, RegisterMap, RegisterTable, SharedRegisterMap};
pub use types::{
    DeviceLimit, ModbusBatchConfig, ModbusRtuParams, ModbusTcpParams, SlaveOptions,
};
