//! Core Communication Traits
//!
//! Every protocol (Modbus master/slave, CAN, virtual) implements
//! [`ProtocolEngine`]; channels drive engines only through this trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ComLinkError, Result};
use crate::types::{DataPointConfig, DeviceRole, PointCommand, PointReading, PointTable, PointUpdate};

// ============================================================================
// Connection State
// ============================================================================

/// Lifecycle state of a channel loop
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionState {
    /// Not started
    #[default]
    Idle,
    /// Opening the transport
    Connecting,
    /// Master: running poll cycles
    Polling,
    /// Slave: waiting for requests
    Listening,
    /// Slave: processing a request
    Handling,
    /// Waiting out backoff after a failure
    Reconnecting,
    /// Stop requested, loop winding down
    Stopping,
    /// Loop exited
    Stopped,
}

impl ConnectionState {
    /// Check if state represents an active connection
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            ConnectionState::Polling | ConnectionState::Listening | ConnectionState::Handling
        )
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Idle => write!(f, "IDLE"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Polling => write!(f, "POLLING"),
            ConnectionState::Listening => write!(f, "LISTENING"),
            ConnectionState::Handling => write!(f, "HANDLING"),
            ConnectionState::Reconnecting => write!(f, "RECONNECTING"),
            ConnectionState::Stopping => write!(f, "STOPPING"),
            ConnectionState::Stopped => write!(f, "STOPPED"),
        }
    }
}

// ============================================================================
// Protocol Value
// ============================================================================

/// Decoded raw value before scaling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProtocolValue {
    String(Cow<'static, str>),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Null,
}

impl From<f64> for ProtocolValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for ProtocolValue {
    fn from(v: f32) -> Self {
        Self::Float(v as f64)
    }
}

impl From<i64> for ProtocolValue {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<i32> for ProtocolValue {
    fn from(v: i32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<i16> for ProtocolValue {
    fn from(v: i16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u16> for ProtocolValue {
    fn from(v: u16) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<u32> for ProtocolValue {
    fn from(v: u32) -> Self {
        Self::Integer(v as i64)
    }
}

impl From<bool> for ProtocolValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<&str> for ProtocolValue {
    fn from(v: &str) -> Self {
        Self::String(Cow::Owned(v.to_string()))
    }
}

impl ProtocolValue {
    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Integer(i) => Some(*i as f64),
            Self::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            Self::String(s) => s.parse().ok(),
            Self::Null => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Float(f) => Some(f.round() as i64),
            Self::Bool(b) => Some(i64::from(*b)),
            Self::String(s) => s.parse().ok(),
            Self::Null => None,
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Float(f) => Some(*f != 0.0),
            Self::String(s) => match s.to_lowercase().as_str() {
                "true" | "1" | "on" => Some(true),
                "false" | "0" | "off" => Some(false),
                _ => None,
            },
            Self::Null => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

// ============================================================================
// Protocol Engine
// ============================================================================

/// Result of one poll or listen cycle
#[derive(Debug, Default)]
pub struct CycleOutput {
    /// Values (good or degraded) to publish
    pub updates: Vec<PointUpdate>,
    /// Protocol errors seen during the cycle (CRC, exception, malformed)
    pub protocol_errors: u32,
    /// Exchanges that timed out without taking the link down
    pub transport_errors: u32,
    /// Request/response exchanges that completed
    pub transactions: u32,
    /// Last protocol error message, if any
    pub last_error: Option<String>,
}

impl CycleOutput {
    pub fn record_protocol_error(&mut self, err: &ComLinkError) {
        self.protocol_errors += 1;
        self.last_error = Some(err.to_string());
    }

    pub fn record_transport_error(&mut self, err: &ComLinkError) {
        self.transport_errors += 1;
        self.last_error = Some(err.to_string());
    }
}

/// Protocol implementation driven by a channel
///
/// Engines own their transport. A channel calls `prepare` whenever the point
/// table changes, then alternates `connect` and `run_cycle`, and always
/// calls `disconnect` before its loop exits.
#[async_trait]
pub trait ProtocolEngine: Send + Sync {
    /// Protocol identifier, e.g. `modbus_tcp`
    fn protocol(&self) -> &str;

    fn role(&self) -> DeviceRole;

    /// Remote or local endpoint, for logs
    fn target(&self) -> String;

    /// Validate the point table and build read plans
    fn prepare(&mut self, points: &PointTable) -> Result<()>;

    async fn connect(&mut self) -> Result<()>;

    async fn disconnect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Master: poll every planned range once. Slave: serve at most one request.
    ///
    /// Protocol errors are absorbed into the output; transport errors abort
    /// the cycle. `cancel` is checked between exchanges.
    async fn run_cycle(
        &mut self,
        points: &PointTable,
        cancel: &CancellationToken,
    ) -> Result<CycleOutput>;

    /// Write a command value to one C/A point
    async fn write_point(&mut self, point: &DataPointConfig, command: &PointCommand) -> Result<()>;

    /// Read a single point outside the poll schedule
    async fn read_point(&mut self, point: &DataPointConfig) -> Result<PointReading> {
        Err(ComLinkError::NotSupported(format!(
            "{}: single point read of {}",
            self.protocol(),
            point.id
        )))
    }

    /// Pause between cycles. Listening engines return zero.
    fn cycle_interval(&self, configured: Duration) -> Duration {
        configured
    }
}

// ============================================================================
// Channel Logger
// ============================================================================

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Lightweight logger for channel-specific logging
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    pub channel_id: u32,
    pub channel_name: String,
}

impl ChannelLogger {
    pub fn new(channel_id: u32, channel_name: impl Into<String>) -> Self {
        Self {
            channel_id,
            channel_name: channel_name.into(),
        }
    }

    pub fn log_init(&self, protocol: &str, message: &str) {
        tracing::info!(
            channel = self.channel_id,
            name = %self.channel_name,
            "[INIT] {} - {}",
            protocol,
            message
        );
    }

    pub fn log_connect(&self, protocol: &str, target: &str, details: &str) {
        tracing::info!(
            channel = self.channel_id,
            name = %self.channel_name,
            "[CONNECT] {} to {} - {}",
            protocol,
            target,
            details
        );
    }

    pub fn log_status(&self, old_state: ConnectionState, new_state: ConnectionState, reason: &str) {
        if old_state == new_state {
            return;
        }
        tracing::info!(
            channel = self.channel_id,
            "[STATUS] {} -> {} - {}",
            old_state,
            new_state,
            reason
        );
    }

    pub fn log_retry(&self, attempt: u64, delay: Duration, reason: &str) {
        tracing::warn!(
            channel = self.channel_id,
            name = %self.channel_name,
            "[RETRY] Attempt {}, delay {}ms - {}",
            attempt,
            delay.as_millis(),
            reason
        );
    }

    /// Raw frame at TRACE level
    pub fn log_raw_frame(&self, direction: &str, data: &[u8]) {
        tracing::trace!(channel = self.channel_id, "[{}] {}", direction, hex(data));
    }

    /// Decoded Modbus frame header at DEBUG level
    pub fn log_frame(&self, direction: &str, unit: u8, function: u8, data: &[u8]) {
        tracing::debug!(
            channel = self.channel_id,
            "[{}] Slave={} FC={:02X} Frame:[{}]",
            direction,
            unit,
            function,
            hex(data)
        );
    }

    pub fn log_poll(&self, slave_id: u8, func: u8, start: u16, count: u16) {
        tracing::debug!(
            channel = self.channel_id,
            "[poll] s{}f{} @{} x{}",
            slave_id,
            func,
            start,
            count
        );
    }

    /// Failures escalate to WARN
    pub fn log_poll_result(&self, slave_id: u8, func: u8, ok: usize, err: usize) {
        if err > 0 {
            tracing::warn!(
                channel = self.channel_id,
                "[poll] s{}f{} ok={} err={}",
                slave_id,
                func,
                ok,
                err
            );
        } else {
            tracing::debug!(channel = self.channel_id, "[poll] s{}f{} ok={}", slave_id, func, ok);
        }
    }

    pub fn log_command(&self, point_id: u32, value: f64, outcome: &str) {
        tracing::info!(
            channel = self.channel_id,
            "[CMD] point {} value {} - {}",
            point_id,
            value,
            outcome
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_protocol_value_conversions() {
        let v = ProtocolValue::from(42i64);
        assert_eq!(v.as_i64(), Some(42));
        assert_eq!(v.as_f64(), Some(42.0));

        let v = ProtocolValue::from(2.5f64);
        assert_eq!(v.as_f64(), Some(2.5));
        assert_eq!(v.as_i64(), Some(3));

        let v = ProtocolValue::from(true);
        assert_eq!(v.as_bool(), Some(true));
        assert_eq!(v.as_i64(), Some(1));

        assert_eq!(ProtocolValue::Null.as_f64(), None);
    }

    #[test]
    fn test_connection_state() {
        assert!(ConnectionState::Polling.is_connected());
        assert!(ConnectionState::Listening.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
        assert_eq!(ConnectionState::Reconnecting.to_string(), "RECONNECTING");
    }

    #[traced_test]
    #[test]
    fn test_channel_logger_formats_frames() {
        let logger = ChannelLogger::new(7, "pcs");
        logger.log_frame("TX", 1, 0x03, &[0x01, 0x03, 0x00, 0x0A]);
        assert!(logs_contain("Slave=1 FC=03 Frame:[01 03 00 0A]"));

        logger.log_poll_result(1, 3, 4, 1);
        assert!(logs_contain("ok=4 err=1"));
    }
}
