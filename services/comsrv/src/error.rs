//! Error handling for Communication Service
//!
//! Link level failures stay as [`ComLinkError`] so their classification
//! (transport, protocol, command) survives up to the channel manager.

use thiserror::Error;
use voltage_comlink::{ComLinkError, ErrorKind};

/// Communication Service Error Type
#[derive(Error, Debug, Clone)]
pub enum ComSrvError {
    /// Configuration-related errors (YAML, CSV, parameters)
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Input/Output operation errors
    #[error("IO error: {0}")]
    IoError(String),

    /// Errors raised by a protocol engine or its transport
    #[error(transparent)]
    Link(#[from] ComLinkError),

    /// Channel errors (not found, exists, not running)
    #[error("Channel error: {0}")]
    ChannelError(String),

    /// Point errors (not found, wrong type)
    #[error("Point error: {0}")]
    PointError(String),

    /// Publisher or command queue closed
    #[error("Publish error: {0}")]
    PublishError(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for Communication Service
pub type Result<T> = std::result::Result<T, ComSrvError>;

impl ComSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        ComSrvError::ConfigError(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ComSrvError::IoError(msg.into())
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        ComSrvError::ChannelError(msg.into())
    }

    pub fn point(msg: impl Into<String>) -> Self {
        ComSrvError::PointError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        ComSrvError::InternalError(msg.into())
    }

    pub fn channel_not_found(id: impl std::fmt::Display) -> Self {
        ComSrvError::ChannelError(format!("Channel not found: {}", id))
    }

    pub fn channel_exists(id: u32) -> Self {
        ComSrvError::ChannelError(format!("Channel already exists: {}", id))
    }

    pub fn point_not_found(id: impl std::fmt::Display) -> Self {
        ComSrvError::PointError(format!("Point not found: {}", id))
    }

    /// Error family, mirroring the link level classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            ComSrvError::ConfigError(_) => ErrorKind::Configuration,
            ComSrvError::Link(e) => e.kind(),
            ComSrvError::PointError(_) => ErrorKind::Command,
            ComSrvError::IoError(_)
            | ComSrvError::ChannelError(_)
            | ComSrvError::PublishError(_)
            | ComSrvError::InternalError(_) => ErrorKind::Internal,
        }
    }

    pub fn is_config(&self) -> bool {
        self.kind() == ErrorKind::Configuration
    }
}

impl From<std::io::Error> for ComSrvError {
    fn from(err: std::io::Error) -> Self {
        ComSrvError::IoError(err.to_string())
    }
}

impl From<figment::Error> for ComSrvError {
    fn from(err: figment::Error) -> Self {
        ComSrvError::ConfigError(err.to_string())
    }
}

impl From<csv::Error> for ComSrvError {
    fn from(err: csv::Error) -> Self {
        ComSrvError::ConfigError(format!("CSV: {err}"))
    }
}

impl From<serde_json::Error> for ComSrvError {
    fn from(err: serde_json::Error) -> Self {
        ComSrvError::ConfigError(format!("JSON: {err}"))
    }
}

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn io_error(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ComSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn io_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| ComSrvError::IoError(format!("{msg}: {e}")))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_link_errors_keep_their_kind() {
        let err: ComSrvError = ComLinkError::rejected("read-only").into();
        assert_eq!(err.kind(), ErrorKind::Command);

        let err: ComSrvError = ComLinkError::config("missing host").into();
        assert!(err.is_config());
        assert!(err.to_string().contains("missing host"));
    }

    #[test]
    fn test_context_helpers() {
        let res: std::result::Result<(), &str> = Err("boom");
        let err = res.config_error("loading telemetry.csv").unwrap_err();
        assert!(matches!(err, ComSrvError::ConfigError(ref m) if m.contains("telemetry.csv")));
    }
}
