//! Communication Link Error Types
//!
//! Errors are grouped into four families that drive channel behaviour:
//! configuration (fatal at creation), transport (reconnect with backoff),
//! protocol (points of the affected range go invalid for the cycle) and
//! command (reported to the originator only).

use thiserror::Error;

use crate::transport::TransportError;

/// Result type for voltage-comlink operations
pub type Result<T> = std::result::Result<T, ComLinkError>;

/// Error family, used by the channel loop to decide how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    Transport,
    Protocol,
    Command,
    Internal,
}

/// Communication link errors
#[derive(Debug, Error, Clone)]
pub enum ComLinkError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Transport level failure (connect, read, write, timeout)
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Engine used before connect
    #[error("Not connected")]
    NotConnected,

    /// RTU frame with a bad checksum
    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// Frame that cannot be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// TCP response carrying the wrong transaction id
    #[error("Unexpected transaction id: expected {expected}, got {actual}")]
    TransactionMismatch { expected: u16, actual: u16 },

    /// Device answered with an exception response
    #[error("Exception response: function {function:#04X}, code {code:#04X}")]
    Exception { function: u8, code: u8 },

    /// Data conversion errors
    #[error("Data conversion error: {0}")]
    DataConversion(String),

    /// Command refused before reaching the device
    #[error("Command rejected: {0}")]
    CommandRejected(String),

    /// Command did not complete in time
    #[error("Command timeout: {0}")]
    CommandTimeout(String),

    /// Read-back after a confirmed write returned another value
    #[error("Command confirmation failed for point {point_id}: wrote {expected}, read {actual}")]
    ConfirmMismatch {
        point_id: u32,
        expected: f64,
        actual: f64,
    },

    /// Point not found
    #[error("Point not found: {0}")]
    PointNotFound(u32),

    /// Not supported
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for ComLinkError {
    fn from(err: std::io::Error) -> Self {
        ComLinkError::Transport(TransportError::from(err))
    }
}

impl From<serde_json::Error> for ComLinkError {
    fn from(err: serde_json::Error) -> Self {
        ComLinkError::Config(format!("invalid parameters: {}", err))
    }
}

// Helper methods for creating errors
impl ComLinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        ComLinkError::Config(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        ComLinkError::MalformedFrame(msg.into())
    }

    pub fn conversion(msg: impl Into<String>) -> Self {
        ComLinkError::DataConversion(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        ComLinkError::CommandRejected(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ComLinkError::Internal(msg.into())
    }

    /// Error family of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComLinkError::Config(_) => ErrorKind::Configuration,
            ComLinkError::Transport(_) | ComLinkError::NotConnected => ErrorKind::Transport,
            ComLinkError::Crc { .. }
            | ComLinkError::MalformedFrame(_)
            | ComLinkError::TransactionMismatch { .. }
            | ComLinkError::Exception { .. }
            | ComLinkError::DataConversion(_) => ErrorKind::Protocol,
            ComLinkError::CommandRejected(_)
            | ComLinkError::CommandTimeout(_)
            | ComLinkError::ConfirmMismatch { .. }
            | ComLinkError::PointNotFound(_) => ErrorKind::Command,
            ComLinkError::NotSupported(_) | ComLinkError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_transport(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    pub fn is_protocol(&self) -> bool {
        self.kind() == ErrorKind::Protocol
    }

    /// Check if this error indicates a need for reconnection
    pub fn needs_reconnect(&self) -> bool {
        match self {
            ComLinkError::Transport(err) => err.is_fatal(),
            ComLinkError::NotConnected => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ComLinkError::config("missing host").kind(),
            ErrorKind::Configuration
        );
        assert!(ComLinkError::Exception {
            function: 3,
            code: 2
        }
        .is_protocol());
        assert!(ComLinkError::Crc {
            expected: 1,
            actual: 2
        }
        .is_protocol());
        assert!(ComLinkError::NotConnected.is_transport());
        assert_eq!(
            ComLinkError::rejected("read-only point").kind(),
            ErrorKind::Command
        );
    }

    #[test]
    fn test_needs_reconnect() {
        let lost = ComLinkError::from(TransportError::ConnectionLost("reset".into()));
        assert!(lost.needs_reconnect());
        assert!(ComLinkError::NotConnected.needs_reconnect());
        assert!(!ComLinkError::malformed("short").needs_reconnect());
    }

    #[test]
    fn test_io_error_maps_to_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        let err = ComLinkError::from(io);
        assert!(err.is_transport());
        assert!(err.needs_reconnect());
    }
}
