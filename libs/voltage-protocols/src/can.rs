//! CAN protocol engine
//!
//! Listens on a CAN interface and decodes signals of received frames into
//! telemetry/signal points. Control/adjustment points encode their signal into
//! a frame and transmit it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voltage_comlink::bytes::{
    extract_bits, extract_bits_motorola, insert_bits, insert_bits_motorola, sign_extend,
};
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::transport::{CanFrameRecord, CanTransport, Transport, TransportError, CAN_RECORD_LEN};
use voltage_comlink::{
    CanBitOrder, CanMapping, ChannelConfig, ChannelLogger, CycleOutput, DataPointConfig,
    DataType, DeviceRole, PointCommand, PointReading, PointTable, PointUpdate, ProtocolEngine,
    Quality,
};

/// Parameters of `can` channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanParams {
    /// SocketCAN interface, e.g. `can0`
    pub interface: String,

    /// Wait for the first frame of a cycle
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,

    /// Frames drained per cycle once traffic is flowing
    #[serde(default = "default_max_frames_per_cycle")]
    pub max_frames_per_cycle: usize,
}

fn default_listen_timeout_ms() -> u64 {
    100
}

fn default_max_frames_per_cycle() -> usize {
    64
}

impl CanParams {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            listen_timeout_ms: default_listen_timeout_ms(),
            max_frames_per_cycle: default_max_frames_per_cycle(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            return Err(ComLinkError::config("can: interface must not be empty"));
        }
        if self.listen_timeout_ms == 0 || self.max_frames_per_cycle == 0 {
            return Err(ComLinkError::config(
                "can: listen_timeout_ms and max_frames_per_cycle must be > 0",
            ));
        }
        Ok(())
    }
}

/// Pause between frames after the first one of a cycle
const DRAIN_TIMEOUT: Duration = Duration::from_millis(1);

fn check_signal(point: &DataPointConfig, mapping: &CanMapping) -> Result<()> {
    let end = u32::from(mapping.start_bit) + u32::from(mapping.bit_length);
    if mapping.bit_length == 0 || mapping.bit_length > 64 || end > 64 {
        return Err(ComLinkError::config(format!(
            "point {}: signal {}+{} does not fit a CAN frame",
            point.id, mapping.start_bit, mapping.bit_length
        )));
    }
    if point.data_type == DataType::Float32 && mapping.bit_length != 32 {
        return Err(ComLinkError::config(format!(
            "point {}: float32 signals must be 32 bits",
            point.id
        )));
    }
    Ok(())
}

/// Decode the raw value of a signal
pub fn decode_signal(data: &[u8], mapping: &CanMapping, data_type: DataType) -> f64 {
    let mut padded = [0u8; 8];
    let len = data.len().min(8);
    padded[..len].copy_from_slice(&data[..len]);

    let raw = match mapping.bit_order {
        CanBitOrder::Intel => extract_bits(&padded, mapping.start_bit, mapping.bit_length),
        CanBitOrder::Motorola => {
            extract_bits_motorola(&padded, mapping.start_bit, mapping.bit_length)
        },
    };
    if data_type == DataType::Float32 {
        return f64::from(f32::from_bits(raw as u32));
    }
    if mapping.signed {
        sign_extend(raw, mapping.bit_length) as f64
    } else {
        raw as f64
    }
}

/// Encode a raw value into the signal bits of `data`
pub fn encode_signal(data: &mut [u8; 8], mapping: &CanMapping, data_type: DataType, raw: f64) {
    let bits = if data_type == DataType::Float32 {
        u64::from((raw as f32).to_bits())
    } else if mapping.signed {
        let max = (1i128 << (mapping.bit_length - 1)) - 1;
        let min = -(1i128 << (mapping.bit_length - 1));
        (raw.round() as i128).clamp(min, max) as u64
    } else {
        let max = if mapping.bit_length >= 64 {
            u64::MAX
        } else {
            (1u64 << mapping.bit_length) - 1
        };
        (raw.round().max(0.0) as u64).min(max)
    };
    match mapping.bit_order {
        CanBitOrder::Intel => insert_bits(data, mapping.start_bit, mapping.bit_length, bits),
        CanBitOrder::Motorola => {
            insert_bits_motorola(data, mapping.start_bit, mapping.bit_length, bits)
        },
    }
}

fn reading_for(point: &DataPointConfig, raw: f64) -> PointReading {
    if point.point_type.is_digital() || point.data_type == DataType::Bool {
        return PointReading::digital((raw != 0.0) ^ point.reverse);
    }
    let value = point.to_engineering(raw);
    let reading = PointReading::analog(value, point.unit.clone());
    match point.range {
        Some(range) if !range.contains(value) => reading.with_quality(Quality::Uncertain),
        _ => reading,
    }
}

/// CAN listener and command sender
pub struct CanEngine {
    transport: Box<dyn Transport>,
    listen_timeout: Duration,
    max_frames_per_cycle: usize,
    /// (can id, extended) -> points carried by that frame
    by_frame: HashMap<(u32, bool), Vec<DataPointConfig>>,
    logger: ChannelLogger,
}

impl CanEngine {
    pub fn new(logger: ChannelLogger, transport: Box<dyn Transport>, params: &CanParams) -> Self {
        Self {
            transport,
            listen_timeout: Duration::from_millis(params.listen_timeout_ms),
            max_frames_per_cycle: params.max_frames_per_cycle,
            by_frame: HashMap::new(),
            logger,
        }
    }

    pub fn from_channel(channel: &ChannelConfig, params: CanParams) -> Result<Self> {
        params.validate()?;
        let transport = CanTransport::new(params.interface.clone());
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            Box::new(transport),
            &params,
        ))
    }

    async fn next_frame(&mut self, timeout: Duration) -> Result<Option<CanFrameRecord>> {
        let mut record = [0u8; CAN_RECORD_LEN];
        match self.transport.read_exact(&mut record, timeout).await {
            Ok(()) => {
                self.logger.log_raw_frame("RX", &record);
                CanFrameRecord::decode(&record)
                    .map(Some)
                    .map_err(|e| ComLinkError::malformed(e.to_string()))
            },
            Err(TransportError::Timeout(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn decode_frame(&self, frame: &CanFrameRecord, out: &mut CycleOutput) {
        let Some(points) = self.by_frame.get(&(frame.id, frame.extended)) else {
            debug!("Unmapped CAN frame {:#X}", frame.id);
            return;
        };
        for point in points {
            let Some(mapping) = point.can() else {
                continue;
            };
            let needed = (usize::from(mapping.start_bit) + usize::from(mapping.bit_length)).div_ceil(8);
            let reading = if frame.data.len() < needed {
                out.record_protocol_error(&ComLinkError::malformed(format!(
                    "frame {:#X} too short for point {}",
                    frame.id, point.id
                )));
                PointReading::degraded(point, Quality::Invalid)
            } else {
                reading_for(point, decode_signal(&frame.data, mapping, point.data_type))
            };
            out.updates.push(PointUpdate {
                channel_id: self.logger.channel_id,
                point_id: point.id,
                point_type: point.point_type,
                reading,
            });
        }
    }
}

#[async_trait]
impl ProtocolEngine for CanEngine {
    fn protocol(&self) -> &str {
        "can"
    }

    fn role(&self) -> DeviceRole {
        DeviceRole::Master
    }

    fn target(&self) -> String {
        self.transport.describe()
    }

    fn prepare(&mut self, points: &PointTable) -> Result<()> {
        let mut by_frame: HashMap<(u32, bool), Vec<DataPointConfig>> = HashMap::new();
        for point in points.iter().filter(|p| p.enabled) {
            let mapping = point.can().ok_or_else(|| {
                ComLinkError::config(format!("point {} has no CAN mapping", point.id))
            })?;
            check_signal(point, mapping)?;
            if !point.point_type.is_command() {
                by_frame
                    .entry((mapping.can_id, mapping.extended))
                    .or_default()
                    .push(point.clone());
            }
        }
        self.logger.log_init(
            "can",
            &format!("{} frame ids mapped", by_frame.len()),
        );
        self.by_frame = by_frame;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.open().await?;
        self.logger
            .log_connect("can", &self.transport.describe(), "interface up");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    async fn run_cycle(&mut self, _points: &PointTable, cancel: &CancellationToken) -> Result<CycleOutput> {
        let mut out = CycleOutput::default();
        let mut timeout = self.listen_timeout;
        for _ in 0..self.max_frames_per_cycle {
            if cancel.is_cancelled() {
                break;
            }
            match self.next_frame(timeout).await {
                Ok(Some(frame)) => {
                    out.transactions += 1;
                    self.decode_frame(&frame, &mut out);
                },
                Ok(None) => break,
                Err(e) if e.is_protocol() => out.record_protocol_error(&e),
                Err(e) => return Err(e),
            }
            timeout = DRAIN_TIMEOUT;
        }
        Ok(out)
    }

    async fn write_point(&mut self, point: &DataPointConfig, command: &PointCommand) -> Result<()> {
        if !point.point_type.is_command() {
            return Err(ComLinkError::rejected(format!(
                "point {} is {}, not a command point",
                point.id, point.point_type
            )));
        }
        let mapping = *point
            .can()
            .ok_or_else(|| ComLinkError::rejected(format!("point {} has no CAN mapping", point.id)))?;
        let value = command.value();
        if let Some(range) = point.range {
            if !range.contains(value) {
                return Err(ComLinkError::rejected(format!(
                    "value {} outside range [{}, {}] of point {}",
                    value, range.min, range.max, point.id
                )));
            }
        }

        let raw = if point.point_type.is_digital() || point.data_type == DataType::Bool {
            f64::from(u8::from((value != 0.0) ^ point.reverse))
        } else {
            point.to_raw(value)
        };
        let mut data = [0u8; 8];
        encode_signal(&mut data, &mapping, point.data_type, raw);

        let frame = CanFrameRecord::new(mapping.can_id, mapping.extended, &data)
            .map_err(|e| ComLinkError::rejected(e.to_string()))?;
        let record = frame.encode();
        self.logger.log_raw_frame("TX", &record);
        self.transport.write(&record).await?;
        self.logger.log_command(point.id, value, "frame sent");
        Ok(())
    }

    fn cycle_interval(&self, _configured: Duration) -> Duration {
        Duration::ZERO
    }
}
