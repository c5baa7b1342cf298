//! Channel-facing value types

use serde::Serialize;
use tokio::sync::oneshot;
use voltage_comlink::{CommandOutcome, DataPointConfig, PointReading};

/// Command delivered to a running channel through its queue
#[derive(Debug)]
pub struct ChannelCommand {
    pub point_id: u32,
    /// Engineering value; digital points treat non-zero as on
    pub value: f64,
    /// Receives the outcome once the engine has handled the write
    pub reply: Option<oneshot::Sender<CommandOutcome>>,
}

impl ChannelCommand {
    pub fn new(point_id: u32, value: f64) -> Self {
        Self {
            point_id,
            value,
            reply: None,
        }
    }

    /// Command plus the receiver of its outcome
    pub fn with_reply(point_id: u32, value: f64) -> (Self, oneshot::Receiver<CommandOutcome>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                point_id,
                value,
                reply: Some(tx),
            },
            rx,
        )
    }
}

/// Point definition with its last known value
#[derive(Debug, Clone, Serialize)]
pub struct PointSnapshot {
    pub point: DataPointConfig,
    pub reading: Option<PointReading>,
}
