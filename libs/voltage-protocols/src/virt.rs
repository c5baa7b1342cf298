//! Virtual protocol
//!
//! Simulated device without a transport. Telemetry ramps, signals toggle and
//! commands are echoed back on the next cycle.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tokio_util::sync::CancellationToken;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::{
    ChannelConfig, ChannelLogger, ConnectionState, CycleOutput, DataPointConfig, DeviceRole,
    PointCommand, PointReading, PointTable, PointUpdate, ProtocolEngine,
};

/// Parameters of `virtual` channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VirtualParams {
    /// Telemetry increment per cycle, engineering units
    #[serde(default = "default_ramp_step")]
    pub ramp_step: f64,

    /// Upper bound of the ramp for points without a range
    #[serde(default = "default_ramp_limit")]
    pub ramp_limit: f64,

    /// Signals flip every this many cycles; 0 keeps them static
    #[serde(default = "default_toggle_every")]
    pub toggle_every: u32,

    /// Uniform noise amplitude added to telemetry
    #[serde(default)]
    pub noise: f64,

    /// Fixed seed for reproducible noise
    #[serde(default)]
    pub seed: Option<u64>,
}

fn default_ramp_step() -> f64 {
    1.0
}

fn default_ramp_limit() -> f64 {
    100.0
}

fn default_toggle_every() -> u32 {
    10
}

impl Default for VirtualParams {
    fn default() -> Self {
        Self {
            ramp_step: default_ramp_step(),
            ramp_limit: default_ramp_limit(),
            toggle_every: default_toggle_every(),
            noise: 0.0,
            seed: None,
        }
    }
}

impl VirtualParams {
    pub fn validate(&self) -> Result<()> {
        if !self.ramp_step.is_finite() || !self.ramp_limit.is_finite() || self.ramp_limit <= 0.0 {
            return Err(ComLinkError::config(
                "virtual: ramp_step must be finite and ramp_limit > 0",
            ));
        }
        if !self.noise.is_finite() || self.noise < 0.0 {
            return Err(ComLinkError::config("virtual: noise must be >= 0"));
        }
        Ok(())
    }
}

/// Simulated device
pub struct VirtualEngine {
    params: VirtualParams,
    rng: StdRng,
    connected: bool,
    cycle: u64,
    /// Engineering value per point id (signals stored as 0/1)
    values: HashMap<u32, f64>,
    /// Command points written since the last cycle
    pending_echo: BTreeSet<u32>,
    logger: ChannelLogger,
}

impl VirtualEngine {
    pub fn new(logger: ChannelLogger, params: VirtualParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            rng,
            connected: false,
            cycle: 0,
            values: HashMap::new(),
            pending_echo: BTreeSet::new(),
            logger,
        }
    }

    pub fn from_channel(channel: &ChannelConfig, params: VirtualParams) -> Result<Self> {
        params.validate()?;
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            params,
        ))
    }

    fn reading(&self, point: &DataPointConfig) -> PointReading {
        let value = self.values.get(&point.id).copied().unwrap_or(0.0);
        if point.point_type.is_digital() {
            PointReading::digital(value != 0.0)
        } else {
            PointReading::analog(value, point.unit.clone())
        }
    }

    fn step_telemetry(&mut self, point: &DataPointConfig) -> f64 {
        let (low, high) = match point.range {
            Some(range) => (range.min, range.max),
            None => (0.0, self.params.ramp_limit),
        };
        let current = self.values.get(&point.id).copied().unwrap_or(low);
        let mut next = current + self.params.ramp_step;
        if next > high {
            next = low;
        }
        self.values.insert(point.id, next);

        if self.params.noise > 0.0 {
            let noise = self.rng.gen_range(-self.params.noise..=self.params.noise);
            (next + noise).clamp(low, high)
        } else {
            next
        }
    }

    fn step_signal(&mut self, point: &DataPointConfig) -> f64 {
        let current = self.values.get(&point.id).copied().unwrap_or(0.0);
        let every = u64::from(self.params.toggle_every);
        let next = if every > 0 && self.cycle % every == 0 {
            if current == 0.0 {
                1.0
            } else {
                0.0
            }
        } else {
            current
        };
        self.values.insert(point.id, next);
        next
    }
}

#[async_trait]
impl ProtocolEngine for VirtualEngine {
    fn protocol(&self) -> &str {
        "virtual"
    }

    fn role(&self) -> DeviceRole {
        DeviceRole::Master
    }

    fn target(&self) -> String {
        "simulation".to_string()
    }

    fn prepare(&mut self, points: &PointTable) -> Result<()> {
        self.values.retain(|id, _| points.get(*id).is_some());
        self.pending_echo.retain(|id| points.get(*id).is_some());
        for point in points.iter() {
            let initial = match point.range {
                Some(range) if !point.point_type.is_digital() => range.min,
                _ => 0.0,
            };
            self.values.entry(point.id).or_insert(initial);
        }
        self.logger.log_init(
            "Virtual",
            &format!("{} simulated points", points.len()),
        );
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        if !self.connected {
            self.connected = true;
            self.logger
                .log_connect("Virtual", "simulation", "virtual device active");
            self.logger.log_status(
                ConnectionState::Connecting,
                ConnectionState::Polling,
                "virtual connection established",
            );
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn run_cycle(&mut self, points: &PointTable, cancel: &CancellationToken) -> Result<CycleOutput> {
        if !self.connected {
            return Err(ComLinkError::NotConnected);
        }
        let mut out = CycleOutput::default();
        if cancel.is_cancelled() {
            return Ok(out);
        }
        self.cycle += 1;

        for point in points.pollable() {
            let value = if point.point_type.is_digital() {
                self.step_signal(point)
            } else {
                self.step_telemetry(point)
            };
            let reading = if point.point_type.is_digital() {
                PointReading::digital((value != 0.0) ^ point.reverse)
            } else {
                PointReading::analog(value, point.unit.clone())
            };
            out.updates.push(PointUpdate {
                channel_id: self.logger.channel_id,
                point_id: point.id,
                point_type: point.point_type,
                reading,
            });
        }

        for id in std::mem::take(&mut self.pending_echo) {
            if let Some(point) = points.get(id) {
                out.updates.push(PointUpdate {
                    channel_id: self.logger.channel_id,
                    point_id: id,
                    point_type: point.point_type,
                    reading: self.reading(point),
                });
            }
        }

        out.transactions = 1;
        Ok(out)
    }

    async fn write_point(&mut self, point: &DataPointConfig, command: &PointCommand) -> Result<()> {
        if !point.point_type.is_command() {
            return Err(ComLinkError::rejected(format!(
                "point {} is {}, not a command point",
                point.id, point.point_type
            )));
        }
        let value = command.value();
        if let Some(range) = point.range {
            if !range.contains(value) {
                return Err(ComLinkError::rejected(format!(
                    "value {} outside range [{}, {}] of point {}",
                    value, range.min, range.max, point.id
                )));
            }
        }
        self.values.insert(point.id, value);
        self.pending_echo.insert(point.id);
        self.logger.log_command(point.id, value, "stored");
        Ok(())
    }

    async fn read_point(&mut self, point: &DataPointConfig) -> Result<PointReading> {
        if !self.values.contains_key(&point.id) {
            return Err(ComLinkError::PointNotFound(point.id));
        }
        Ok(self.reading(point))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use voltage_comlink::{DataType, PointType, ValueRange};

    fn points() -> PointTable {
        let mut bounded = DataPointConfig::new(2, "soc", PointType::Telemetry, DataType::Float32);
        bounded.range = Some(ValueRange {
            min: 10.0,
            max: 12.0,
        });
        PointTable::new([
            DataPointConfig::new(1, "power", PointType::Telemetry, DataType::Float32),
            bounded,
            DataPointConfig::new(3, "breaker", PointType::Signal, DataType::Bool),
            DataPointConfig::new(4, "start", PointType::Control, DataType::Bool),
            DataPointConfig::new(5, "setpoint", PointType::Adjustment, DataType::Float32),
        ])
        .unwrap()
    }

    async fn engine(params: VirtualParams) -> VirtualEngine {
        let mut engine = VirtualEngine::new(ChannelLogger::new(9, "sim"), params);
        engine.prepare(&points()).unwrap();
        engine.connect().await.unwrap();
        engine
    }

    fn value_of(out: &CycleOutput, id: u32) -> Option<f64> {
        out.updates
            .iter()
            .find(|u| u.point_id == id)
            .map(|u| u.reading.as_f64())
    }

    #[tokio::test]
    async fn test_telemetry_ramps_and_wraps() {
        let mut engine = engine(VirtualParams::default()).await;
        let points = points();
        let cancel = CancellationToken::new();

        let first = engine.run_cycle(&points, &cancel).await.unwrap();
        assert_eq!(value_of(&first, 1), Some(1.0));
        assert_eq!(value_of(&first, 2), Some(11.0));

        let second = engine.run_cycle(&points, &cancel).await.unwrap();
        assert_eq!(value_of(&second, 1), Some(2.0));
        assert_eq!(value_of(&second, 2), Some(12.0));

        let third = engine.run_cycle(&points, &cancel).await.unwrap();
        assert_eq!(value_of(&third, 2), Some(10.0));
        assert!(value_of(&third, 4).is_none());
    }

    #[tokio::test]
    async fn test_signals_toggle() {
        let params = VirtualParams {
            toggle_every: 2,
            ..Default::default()
        };
        let mut engine = engine(params).await;
        let points = points();
        let cancel = CancellationToken::new();

        let states: Vec<f64> = {
            let mut v = Vec::new();
            for _ in 0..4 {
                let out = engine.run_cycle(&points, &cancel).await.unwrap();
                v.push(value_of(&out, 3).unwrap());
            }
            v
        };
        assert_eq!(states, vec![0.0, 1.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_commands_echo() {
        let mut engine = engine(VirtualParams::default()).await;
        let points = points();
        let setpoint = points.get(5).unwrap();

        engine
            .write_point(setpoint, &PointCommand::for_point(PointType::Adjustment, 42.5))
            .await
            .unwrap();
        assert_eq!(engine.read_point(setpoint).await.unwrap().as_f64(), 42.5);

        let out = engine
            .run_cycle(&points, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(value_of(&out, 5), Some(42.5));

        let out = engine
            .run_cycle(&points, &CancellationToken::new())
            .await
            .unwrap();
        assert!(value_of(&out, 5).is_none());

        let telemetry = points.get(1).unwrap();
        assert!(engine
            .write_point(telemetry, &PointCommand::for_point(PointType::Adjustment, 1.0))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_noise_stays_in_range() {
        let params = VirtualParams {
            noise: 5.0,
            seed: Some(7),
            ..Default::default()
        };
        let mut engine = engine(params).await;
        let points = points();
        for _ in 0..20 {
            let out = engine
                .run_cycle(&points, &CancellationToken::new())
                .await
                .unwrap();
            let soc = value_of(&out, 2).unwrap();
            assert!((10.0..=12.0).contains(&soc));
        }
    }

    #[test]
    fn test_params_validation() {
        assert!(VirtualParams::default().validate().is_ok());
        let bad = VirtualParams {
            noise: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }
}
