//! Byte transports used by protocol engines
//!
//! A transport only knows how to open, read an exact number of bytes within a
//! deadline, write, and close. Framing belongs to the engines.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub mod can;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;
pub mod serial;
pub mod tcp;

pub use can::{CanFrameRecord, CanTransport, CAN_RECORD_LEN};
#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockHandle, MockTransport};
pub use serial::{SerialSettings, SerialTransport};
pub use tcp::{TcpClientTransport, TcpServerTransport};

/// Transport error types
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Transport not open")]
    NotOpen,

    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl TransportError {
    /// Whether the link is unusable and must be reopened
    pub fn is_fatal(&self) -> bool {
        !matches!(self, TransportError::Timeout(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::UnexpectedEof
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted => TransportError::ConnectionLost(err.to_string()),
            ErrorKind::ConnectionRefused | ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                TransportError::ConnectionFailed(err.to_string())
            },
            ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Physical link family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    TcpClient,
    TcpServer,
    Serial,
    Can,
    Mock,
}

/// Byte transport used by every protocol engine
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Human readable endpoint, e.g. `192.168.1.10:502` or `/dev/ttyUSB0@9600`
    fn describe(&self) -> String;

    /// Open the link. Opening an already open transport is a no-op.
    async fn open(&mut self) -> TransportResult<()>;

    /// Fill `buf` completely or fail once `timeout` elapses
    async fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> TransportResult<()>;

    async fn write(&mut self, data: &[u8]) -> TransportResult<()>;

    async fn close(&mut self) -> TransportResult<()>;

    fn is_open(&self) -> bool;

    /// Drop whatever is pending on the input side (used to resync RTU lines)
    async fn discard_input(&mut self) {
        let mut byte = [0u8; 1];
        for _ in 0..512 {
            if self
                .read_exact(&mut byte, Duration::from_millis(20))
                .await
                .is_err()
            {
                break;
            }
        }
    }
}
