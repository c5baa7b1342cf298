//! VoltageEMS Protocol Implementations
//!
//! Protocol engines for the communication service. Protocols are
//! feature-gated for selective compilation.
//!
//! # Features
//!
//! - `modbus` - Modbus TCP/RTU master and slave
//! - `can` - CAN signal listener and command sender
//! - `virt` - Virtual protocol for testing
//!
//! # Architecture
//!
//! Every engine implements [`ProtocolEngine`] from `voltage-comlink` and owns
//! its transport. Each provides a constructor taking the channel
//! configuration and its typed parameter struct.

#[cfg(feature = "can")]
pub mod can;

#[cfg(feature = "modbus")]
pub mod modbus;

#[cfg(feature = "virt")]
pub mod virt;

// Re-export common types for convenience
pub use voltage_comlink::{
    ChannelConfig, ChannelLogger, ComLinkError, ConnectionState, CycleOutput, DataPointConfig,
    PointCommand, PointTable, PointUpdate, ProtocolEngine, ProtocolValue, Result,
};
