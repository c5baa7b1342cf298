//! SocketCAN transport
//!
//! CAN frames travel through the byte-oriented [`Transport`] interface as
//! fixed 13-byte records: 4 bytes identifier (big-endian, bit 31 set for
//! extended ids), 1 byte DLC, 8 bytes payload (zero padded).

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
#[cfg(all(target_os = "linux", feature = "can-linux"))]
use tracing::info;

use super::{Transport, TransportError, TransportKind, TransportResult};

/// Size of one serialized CAN frame
pub const CAN_RECORD_LEN: usize = 13;

const EXTENDED_FLAG: u32 = 0x8000_0000;

/// One classic CAN frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrameRecord {
    pub id: u32,
    pub extended: bool,
    pub data: Vec<u8>,
}

impl CanFrameRecord {
    pub fn new(id: u32, extended: bool, data: &[u8]) -> TransportResult<Self> {
        if data.len() > 8 {
            return Err(TransportError::Config(format!(
                "CAN payload too long: {} bytes",
                data.len()
            )));
        }
        let max_id = if extended { 0x1FFF_FFFF } else { 0x7FF };
        if id > max_id {
            return Err(TransportError::Config(format!("CAN id {id:#X} out of range")));
        }
        Ok(Self {
            id,
            extended,
            data: data.to_vec(),
        })
    }

    pub fn encode(&self) -> [u8; CAN_RECORD_LEN] {
        let mut out = [0u8; CAN_RECORD_LEN];
        let raw_id = if self.extended {
            self.id | EXTENDED_FLAG
        } else {
            self.id
        };
        out[..4].copy_from_slice(&raw_id.to_be_bytes());
        let len = self.data.len().min(8);
        out[4] = len as u8;
        out[5..5 + len].copy_from_slice(&self.data[..len]);
        out
    }

    pub fn decode(bytes: &[u8; CAN_RECORD_LEN]) -> TransportResult<Self> {
        let raw_id = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let dlc = bytes[4] as usize;
        if dlc > 8 {
            return Err(TransportError::Io(format!("invalid CAN DLC {dlc}")));
        }
        Ok(Self {
            id: raw_id & !EXTENDED_FLAG,
            extended: raw_id & EXTENDED_FLAG != 0,
            data: bytes[5..5 + dlc].to_vec(),
        })
    }
}

#[cfg(all(target_os = "linux", feature = "can-linux"))]
type Socket = std::sync::Arc<socketcan::CanSocket>;
#[cfg(not(all(target_os = "linux", feature = "can-linux")))]
type Socket = ();

/// CAN interface transport (e.g. `can0`)
pub struct CanTransport {
    interface: String,
    socket: Option<Socket>,
    // bytes of already received frames not yet consumed by the reader
    pending: VecDeque<u8>,
}

impl CanTransport {
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            socket: None,
            pending: VecDeque::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[cfg(all(target_os = "linux", feature = "can-linux"))]
mod socket_io {
    use super::*;
    use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};

    pub fn open(interface: &str) -> TransportResult<super::Socket> {
        let socket = CanSocket::open(interface)
            .map_err(|e| TransportError::ConnectionFailed(format!("{interface}: {e}")))?;
        Ok(std::sync::Arc::new(socket))
    }

    pub async fn read(
        socket: &super::Socket,
        deadline: Duration,
    ) -> TransportResult<CanFrameRecord> {
        let socket = socket.clone();
        let frame = tokio::task::spawn_blocking(move || {
            socket.set_read_timeout(deadline)?;
            socket.read_frame()
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                TransportError::Timeout(deadline)
            },
            _ => TransportError::from(e),
        })?;

        Ok(CanFrameRecord {
            id: frame.raw_id(),
            extended: frame.is_extended(),
            data: frame.data().to_vec(),
        })
    }

    pub async fn write(socket: &super::Socket, record: CanFrameRecord) -> TransportResult<()> {
        let socket = socket.clone();
        tokio::task::spawn_blocking(move || {
            let frame = if record.extended {
                ExtendedId::new(record.id).and_then(|id| CanFrame::new(id, &record.data))
            } else {
                StandardId::new(record.id as u16).and_then(|id| CanFrame::new(id, &record.data))
            }
            .ok_or_else(|| TransportError::Config(format!("invalid CAN frame {:#X}", record.id)))?;
            socket.write_frame(&frame).map_err(TransportError::from)
        })
        .await
        .map_err(|e| TransportError::Io(e.to_string()))?
    }
}

#[async_trait]
impl Transport for CanTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Can
    }

    fn describe(&self) -> String {
        format!("can:{}", self.interface)
    }

    async fn open(&mut self) -> TransportResult<()> {
        if self.socket.is_some() {
            return Ok(());
        }

        #[cfg(all(target_os = "linux", feature = "can-linux"))]
        {
            self.socket = Some(socket_io::open(&self.interface)?);
            info!("CAN opened: {}", self.interface);
            Ok(())
        }

        #[cfg(not(all(target_os = "linux", feature = "can-linux")))]
        {
            Err(TransportError::Config(format!(
                "SocketCAN support not enabled, cannot open {}",
                self.interface
            )))
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> TransportResult<()> {
        while self.pending.len() < buf.len() {
            #[cfg(all(target_os = "linux", feature = "can-linux"))]
            {
                let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
                let record = socket_io::read(socket, deadline).await?;
                self.pending.extend(record.encode());
            }

            #[cfg(not(all(target_os = "linux", feature = "can-linux")))]
            {
                let _ = deadline;
                return Err(TransportError::NotOpen);
            }
        }

        for slot in buf.iter_mut() {
            *slot = self.pending.pop_front().unwrap_or_default();
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> TransportResult<()> {
        if data.len() % CAN_RECORD_LEN != 0 {
            return Err(TransportError::Io(format!(
                "CAN write must be whole frames, got {} bytes",
                data.len()
            )));
        }

        for chunk in data.chunks_exact(CAN_RECORD_LEN) {
            let mut raw = [0u8; CAN_RECORD_LEN];
            raw.copy_from_slice(chunk);
            let record = CanFrameRecord::decode(&raw)?;
            debug!("CAN tx {:#X} {:02X?}", record.id, record.data);

            #[cfg(all(target_os = "linux", feature = "can-linux"))]
            {
                let socket = self.socket.as_ref().ok_or(TransportError::NotOpen)?;
                socket_io::write(socket, record).await?;
            }

            #[cfg(not(all(target_os = "linux", feature = "can-linux")))]
            {
                let _ = record;
                return Err(TransportError::NotOpen);
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.socket = None;
        self.pending.clear();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.socket.is_some()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let record = CanFrameRecord::new(0x123, false, &[0xAA, 0xBB]).unwrap();
        let bytes = record.encode();
        assert_eq!(&bytes[..5], &[0x00, 0x00, 0x01, 0x23, 0x02]);
        assert_eq!(&bytes[5..7], &[0xAA, 0xBB]);
        assert_eq!(CanFrameRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_extended_flag() {
        let record = CanFrameRecord::new(0x18FF_50E5, true, &[1; 8]).unwrap();
        let bytes = record.encode();
        assert_eq!(bytes[0] & 0x80, 0x80);
        let decoded = CanFrameRecord::decode(&bytes).unwrap();
        assert!(decoded.extended);
        assert_eq!(decoded.id, 0x18FF_50E5);
    }

    #[test]
    fn test_rejects_invalid_frames() {
        assert!(CanFrameRecord::new(0x800, false, &[]).is_err());
        assert!(CanFrameRecord::new(0x10, false, &[0; 9]).is_err());

        let mut bytes = [0u8; CAN_RECORD_LEN];
        bytes[4] = 9;
        assert!(CanFrameRecord::decode(&bytes).is_err());
    }
}
