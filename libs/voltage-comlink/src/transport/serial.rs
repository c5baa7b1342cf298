//! Serial line transport (Modbus RTU)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info};

use super::{Transport, TransportError, TransportKind, TransportResult};

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialSettings {
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "None".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialSettings {
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
        }
    }

    /// Reject settings the serial driver cannot express
    pub fn validate(&self) -> TransportResult<()> {
        if self.port.trim().is_empty() {
            return Err(TransportError::Config("serial port must not be empty".into()));
        }
        if self.baud_rate == 0 {
            return Err(TransportError::Config("baud_rate must be > 0".into()));
        }
        self.parity()?;
        self.data_bits()?;
        self.stop_bits()?;
        Ok(())
    }

    fn parity(&self) -> TransportResult<tokio_serial::Parity> {
        match self.parity.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(tokio_serial::Parity::None),
            "even" | "e" => Ok(tokio_serial::Parity::Even),
            "odd" | "o" => Ok(tokio_serial::Parity::Odd),
            other => Err(TransportError::Config(format!("invalid parity '{other}'"))),
        }
    }

    fn data_bits(&self) -> TransportResult<tokio_serial::DataBits> {
        match self.data_bits {
            5 => Ok(tokio_serial::DataBits::Five),
            6 => Ok(tokio_serial::DataBits::Six),
            7 => Ok(tokio_serial::DataBits::Seven),
            8 => Ok(tokio_serial::DataBits::Eight),
            other => Err(TransportError::Config(format!("invalid data_bits {other}"))),
        }
    }

    fn stop_bits(&self) -> TransportResult<tokio_serial::StopBits> {
        match self.stop_bits {
            1 => Ok(tokio_serial::StopBits::One),
            2 => Ok(tokio_serial::StopBits::Two),
            other => Err(TransportError::Config(format!("invalid stop_bits {other}"))),
        }
    }

    /// Time of one character on the wire (start + data + parity + stop bits)
    pub fn char_time(&self) -> Duration {
        let parity_bits = u32::from(
            self.parity()
                .map(|p| p != tokio_serial::Parity::None)
                .unwrap_or(false),
        );
        let bits = 1 + u32::from(self.data_bits) + parity_bits + u32::from(self.stop_bits);
        Duration::from_micros(u64::from(bits) * 1_000_000 / u64::from(self.baud_rate.max(1)))
    }
}

/// Serial port transport
pub struct SerialTransport {
    settings: SerialSettings,
    stream: Option<SerialStream>,
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            stream: None,
        }
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.settings.port, self.settings.baud_rate)
    }

    async fn open(&mut self) -> TransportResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        debug!("RTU: {} @{}baud", self.settings.port, self.settings.baud_rate);

        let builder = tokio_serial::new(&self.settings.port, self.settings.baud_rate)
            .data_bits(self.settings.data_bits()?)
            .parity(self.settings.parity()?)
            .stop_bits(self.settings.stop_bits()?);

        match builder.open_native_async() {
            Ok(stream) => {
                info!("RTU opened: {}", self.settings.port);
                self.stream = Some(stream);
                Ok(())
            },
            Err(e) => {
                error!("RTU err: {} - {}", self.settings.port, e);
                Err(TransportError::ConnectionFailed(format!(
                    "failed to open serial port {}: {}",
                    self.settings.port, e
                )))
            },
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        match timeout(deadline, stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.stream = None;
                Err(TransportError::from(e))
            },
            Err(_) => Err(TransportError::Timeout(deadline)),
        }
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        let stream = self.stream.as_mut().ok_or(TransportError::NotOpen)?;
        let result = async {
            stream.write_all(data).await?;
            stream.flush().await
        }
        .await;
        if let Err(e) = result {
            self.stream = None;
            return Err(TransportError::from(e));
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.stream.take().is_some() {
            debug!("RTU closed: {}", self.settings.port);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}
