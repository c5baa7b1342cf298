//! Modbus slave engine (TCP listener and RTU line)
//!
//! Serves a [`RegisterMap`] to an external master. Each cycle handles at most
//! one request; an idle link yields an empty cycle. Writes from the master are
//! turned into point updates for every configured point they touch.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::transport::{SerialTransport, TcpServerTransport, Transport, TransportError};
use voltage_comlink::{
    ChannelConfig, ChannelLogger, CycleOutput, DataPointConfig, DataType, DeviceRole,
    PointCommand, PointReading, PointTable, PointUpdate, ProtocolEngine,
};

use super::codec::{command_registers, reading_from_bit, reading_from_registers, register_span};
use super::constants::*;
use super::frame::{decode_rtu, encode_rtu, encode_tcp, MbapHeader};
use super::master::Framing;
use super::pdu::{ExceptionCode, ModbusPdu, ModbusRequest, ModbusResponse};
use super::types::{ModbusRtuParams, ModbusTcpParams, SlaveOptions};

/// Unit id Modbus TCP devices answer regardless of their own id
const TCP_ANY_UNIT: u8 = 0xFF;

/// The four Modbus data tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterTable {
    Coils,
    DiscreteInputs,
    HoldingRegisters,
    InputRegisters,
}

impl RegisterTable {
    pub fn for_function(function_code: u8) -> Option<Self> {
        match function_code {
            FC_READ_COILS | FC_WRITE_SINGLE_COIL | FC_WRITE_MULTIPLE_COILS => Some(Self::Coils),
            FC_READ_DISCRETE_INPUTS => Some(Self::DiscreteInputs),
            FC_READ_HOLDING_REGISTERS | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS => {
                Some(Self::HoldingRegisters)
            },
            FC_READ_INPUT_REGISTERS => Some(Self::InputRegisters),
            _ => None,
        }
    }

    pub fn is_bit(&self) -> bool {
        matches!(self, Self::Coils | Self::DiscreteInputs)
    }
}

/// In-memory data served by a slave
#[derive(Debug, Clone)]
pub struct RegisterMap {
    coils: Vec<bool>,
    discrete_inputs: Vec<bool>,
    holding: Vec<u16>,
    input: Vec<u16>,
}

pub type SharedRegisterMap = Arc<RwLock<RegisterMap>>;

impl RegisterMap {
    /// `size` entries per table, all zero
    pub fn new(size: usize) -> Self {
        Self {
            coils: vec![false; size],
            discrete_inputs: vec![false; size],
            holding: vec![0; size],
            input: vec![0; size],
        }
    }

    pub fn shared(size: usize) -> SharedRegisterMap {
        Arc::new(RwLock::new(Self::new(size)))
    }

    pub fn size(&self) -> usize {
        self.holding.len()
    }

    fn bits(&self, table: RegisterTable) -> &[bool] {
        match table {
            RegisterTable::Coils => &self.coils,
            _ => &self.discrete_inputs,
        }
    }

    fn bits_mut(&mut self, table: RegisterTable) -> &mut [bool] {
        match table {
            RegisterTable::Coils => &mut self.coils,
            _ => &mut self.discrete_inputs,
        }
    }

    fn words(&self, table: RegisterTable) -> &[u16] {
        match table {
            RegisterTable::InputRegisters => &self.input,
            _ => &self.holding,
        }
    }

    fn words_mut(&mut self, table: RegisterTable) -> &mut [u16] {
        match table {
            RegisterTable::InputRegisters => &mut self.input,
            _ => &mut self.holding,
        }
    }

    fn span(len: usize, address: u16, quantity: usize) -> std::result::Result<std::ops::Range<usize>, ExceptionCode> {
        let start = usize::from(address);
        let end = start + quantity;
        if quantity == 0 || end > len {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(start..end)
    }

    pub fn read_bits(&self, table: RegisterTable, address: u16, quantity: u16) -> std::result::Result<Vec<bool>, ExceptionCode> {
        let bits = self.bits(table);
        let range = Self::span(bits.len(), address, usize::from(quantity))?;
        Ok(bits[range].to_vec())
    }

    pub fn read_registers(&self, table: RegisterTable, address: u16, quantity: u16) -> std::result::Result<Vec<u16>, ExceptionCode> {
        let words = self.words(table);
        let range = Self::span(words.len(), address, usize::from(quantity))?;
        Ok(words[range].to_vec())
    }

    pub fn write_bits(&mut self, table: RegisterTable, address: u16, values: &[bool]) -> std::result::Result<(), ExceptionCode> {
        let bits = self.bits_mut(table);
        let range = Self::span(bits.len(), address, values.len())?;
        bits[range].copy_from_slice(values);
        Ok(())
    }

    pub fn write_registers(&mut self, table: RegisterTable, address: u16, values: &[u16]) -> std::result::Result<(), ExceptionCode> {
        let words = self.words_mut(table);
        let range = Self::span(words.len(), address, values.len())?;
        words[range].copy_from_slice(values);
        Ok(())
    }

    /// Apply a request and build its response
    pub fn execute(&mut self, request: &ModbusRequest) -> ModbusResponse {
        let function = request.function_code();
        let result = match request {
            ModbusRequest::ReadCoils { address, quantity } => self
                .read_bits(RegisterTable::Coils, *address, *quantity)
                .map(ModbusResponse::Bits),
            ModbusRequest::ReadDiscreteInputs { address, quantity } => self
                .read_bits(RegisterTable::DiscreteInputs, *address, *quantity)
                .map(ModbusResponse::Bits),
            ModbusRequest::ReadHoldingRegisters { address, quantity } => self
                .read_registers(RegisterTable::HoldingRegisters, *address, *quantity)
                .map(ModbusResponse::Registers),
            ModbusRequest::ReadInputRegisters { address, quantity } => self
                .read_registers(RegisterTable::InputRegisters, *address, *quantity)
                .map(ModbusResponse::Registers),
            ModbusRequest::WriteSingleCoil { address, value } => self
                .write_bits(RegisterTable::Coils, *address, &[*value])
                .map(|_| ModbusResponse::WriteAck {
                    address: *address,
                    value: if *value { COIL_ON } else { COIL_OFF },
                }),
            ModbusRequest::WriteSingleRegister { address, value } => self
                .write_registers(RegisterTable::HoldingRegisters, *address, &[*value])
                .map(|_| ModbusResponse::WriteAck {
                    address: *address,
                    value: *value,
                }),
            ModbusRequest::WriteMultipleCoils { address, values } => self
                .write_bits(RegisterTable::Coils, *address, values)
                .map(|_| ModbusResponse::WriteAck {
                    address: *address,
                    value: values.len() as u16,
                }),
            ModbusRequest::WriteMultipleRegisters { address, values } => self
                .write_registers(RegisterTable::HoldingRegisters, *address, values)
                .map(|_| ModbusResponse::WriteAck {
                    address: *address,
                    value: values.len() as u16,
                }),
        };
        result.unwrap_or_else(|code| ModbusResponse::Exception { function, code })
    }
}


/// Configured point located in the register map
#[derive(Debug, Clone)]
struct ServedPoint {
    point: DataPointConfig,
    table: RegisterTable,
    address: u16,
    span: u16,
}

impl ServedPoint {
    fn locate(point: &DataPointConfig) -> Result<Self> {
        let mapping = point.modbus().ok_or_else(|| {
            ComLinkError::config(format!("point {} has no Modbus mapping", point.id))
        })?;
        let table = RegisterTable::for_function(mapping.function_code).ok_or_else(|| {
            ComLinkError::config(format!(
                "point {} uses unsupported FC{:02}",
                point.id, mapping.function_code
            ))
        })?;
        Ok(Self {
            point: point.clone(),
            table,
            address: mapping.register_address,
            span: register_span(point, mapping),
        })
    }

    fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.span)
    }

    fn overlaps(&self, table: RegisterTable, address: u16, quantity: u16) -> bool {
        let end = u32::from(address) + u32::from(quantity);
        self.table == table && u32::from(self.address) < end && u32::from(address) < self.end()
    }

    fn read(&self, map: &RegisterMap) -> Result<PointReading> {
        let unavailable = |code: ExceptionCode| {
            ComLinkError::conversion(format!("point {}: {}", self.point.id, code.description()))
        };
        if self.table.is_bit() {
            let bits = map
                .read_bits(self.table, self.address, 1)
                .map_err(unavailable)?;
            return Ok(reading_from_bit(&self.point, bits[0]));
        }
        let regs = map
            .read_registers(self.table, self.address, self.span)
            .map_err(unavailable)?;
        let mapping = self
            .point
            .modbus()
            .ok_or_else(|| ComLinkError::internal("served point lost its mapping"))?;
        reading_from_registers(&self.point, mapping, &regs)
    }

    fn write(&self, map: &mut RegisterMap, command: &PointCommand) -> Result<()> {
        let out_of_map =
            |code: ExceptionCode| ComLinkError::rejected(format!("point {}: {}", self.point.id, code.description()));
        if self.table.is_bit() {
            let state = (command.value() != 0.0) ^ self.point.reverse;
            return map
                .write_bits(self.table, self.address, &[state])
                .map_err(out_of_map);
        }

        let bit_position = self.point.modbus().and_then(|m| m.bit_position);
        let values = match bit_position {
            Some(bit) => {
                let word = map
                    .read_registers(self.table, self.address, 1)
                    .map_err(out_of_map)?[0];
                let order = self.point.byte_order;
                let state = (command.value() != 0.0) ^ self.point.reverse;
                let updated = voltage_comlink::bytes::with_register_bit(
                    voltage_comlink::bytes::reg_to_u16(word, order),
                    bit,
                    state,
                );
                vec![voltage_comlink::bytes::u16_to_reg(updated, order)]
            },
            None => command_registers(&self.point, command)?,
        };
        map.write_registers(self.table, self.address, &values)
            .map_err(out_of_map)
    }
}

/// One request received from the line
struct Incoming {
    unit_id: u8,
    transaction_id: Option<u16>,
    pdu: Vec<u8>,
}

/// Modbus slave serving a shared register map
pub struct ModbusSlave {
    protocol: &'static str,
    framing: Framing,
    transport: Box<dyn Transport>,
    unit_id: u8,
    listen_timeout: Duration,
    frame_timeout: Duration,
    map: SharedRegisterMap,
    served: Vec<ServedPoint>,
    logger: ChannelLogger,
}

impl ModbusSlave {
    pub fn new(
        logger: ChannelLogger,
        framing: Framing,
        transport: Box<dyn Transport>,
        options: &SlaveOptions,
        frame_timeout: Duration,
    ) -> Self {
        let protocol = match framing {
            Framing::Tcp => "modbus_tcp",
            Framing::Rtu { .. } => "modbus_rtu",
        };
        Self {
            protocol,
            framing,
            transport,
            unit_id: options.unit_id,
            listen_timeout: options.listen_timeout(),
            frame_timeout,
            map: RegisterMap::shared(options.map_size as usize),
            served: Vec::new(),
            logger,
        }
    }

    /// Slave listening on `host:port`
    pub fn tcp(channel: &ChannelConfig, params: ModbusTcpParams) -> Result<Self> {
        params.validate()?;
        params.slave.validate()?;
        let transport = TcpServerTransport::new(params.address());
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            Framing::Tcp,
            Box::new(transport),
            &params.slave,
            params.response_timeout(),
        ))
    }

    /// Slave on a serial line
    pub fn rtu(channel: &ChannelConfig, params: ModbusRtuParams) -> Result<Self> {
        params.validate()?;
        params.slave.validate()?;
        let framing = Framing::rtu_for(params.serial.char_time(), params.serial.baud_rate);
        let transport = SerialTransport::new(params.serial.clone());
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            framing,
            Box::new(transport),
            &params.slave,
            params.response_timeout(),
        ))
    }

    /// Handle to the served data, shared with whoever feeds it
    pub fn register_map(&self) -> SharedRegisterMap {
        Arc::clone(&self.map)
    }

    pub fn unit_id(&self) -> u8 {
        self.unit_id
    }

    fn accepts(&self, unit_id: u8) -> bool {
        unit_id == self.unit_id
            || unit_id == BROADCAST_UNIT_ID
            || (self.framing == Framing::Tcp && unit_id == TCP_ANY_UNIT)
    }

    /// First bytes of a request; a timeout or a dropped TCP peer is idle time
    async fn wait_for_request(&mut self, buf: &mut [u8]) -> Result<bool> {
        match self.transport.read_exact(buf, self.listen_timeout).await {
            Ok(()) => Ok(true),
            Err(TransportError::Timeout(_)) => Ok(false),
            Err(TransportError::ConnectionLost(reason)) if self.transport.is_open() => {
                debug!("Master went away: {}", reason);
                Ok(false)
            },
            Err(e) => Err(e.into()),
        }
    }

    async fn receive_tcp(&mut self) -> Result<Option<Incoming>> {
        let mut head = [0u8; MBAP_HEADER_LEN];
        if !self.wait_for_request(&mut head).await? {
            return Ok(None);
        }
        let header = match MbapHeader::parse(&head) {
            Ok(header) => header,
            Err(e) => {
                self.transport.discard_input().await;
                return Err(e);
            },
        };
        let mut pdu = vec![0u8; header.pdu_len()];
        self.transport
            .read_exact(&mut pdu, self.frame_timeout)
            .await?;
        Ok(Some(Incoming {
            unit_id: header.unit_id,
            transaction_id: Some(header.transaction_id),
            pdu,
        }))
    }

    async fn receive_rtu(&mut self) -> Result<Option<Incoming>> {
        let mut address = [0u8; 1];
        if !self.wait_for_request(&mut address).await? {
            return Ok(None);
        }
        let mut function = [0u8; 1];
        self.transport
            .read_exact(&mut function, self.frame_timeout)
            .await?;

        let mut frame = vec![address[0], function[0]];
        match function[0] {
            FC_READ_COILS..=FC_WRITE_SINGLE_REGISTER => {
                // address, quantity/value and CRC
                let mut body = [0u8; 6];
                self.transport
                    .read_exact(&mut body, self.frame_timeout)
                    .await?;
                frame.extend_from_slice(&body);
            },
            FC_WRITE_MULTIPLE_COILS | FC_WRITE_MULTIPLE_REGISTERS => {
                let mut head = [0u8; 5];
                self.transport
                    .read_exact(&mut head, self.frame_timeout)
                    .await?;
                let mut rest = vec![0u8; usize::from(head[4]) + 2];
                self.transport
                    .read_exact(&mut rest, self.frame_timeout)
                    .await?;
                frame.extend_from_slice(&head);
                frame.extend_from_slice(&rest);
            },
            unknown => {
                // frame length unknown, drop the rest and answer from the header
                self.transport.discard_input().await;
                return Ok(Some(Incoming {
                    unit_id: address[0],
                    transaction_id: None,
                    pdu: vec![unknown],
                }));
            },
        }

        self.logger.log_raw_frame("RX", &frame);
        let (unit_id, pdu) = match decode_rtu(&frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.transport.discard_input().await;
                return Err(e);
            },
        };
        Ok(Some(Incoming {
            unit_id,
            transaction_id: None,
            pdu: pdu.to_vec(),
        }))
    }

    /// Execute one request PDU against the map
    fn handle_pdu(&self, pdu: &[u8]) -> Result<(ModbusPdu, Vec<PointUpdate>)> {
        let function = pdu.first().copied().unwrap_or_default();
        let request = match ModbusRequest::parse(pdu) {
            Ok(request) => request,
            Err(code) => {
                let response = ModbusResponse::Exception { function, code };
                return Ok((response.encode(function)?, Vec::new()));
            },
        };

        let response = self.map.write().execute(&request);
        let written = match (&response, &request) {
            (ModbusResponse::WriteAck { .. }, ModbusRequest::WriteSingleCoil { address, .. }) => {
                Some((RegisterTable::Coils, *address, 1))
            },
            (ModbusResponse::WriteAck { .. }, ModbusRequest::WriteMultipleCoils { address, values }) => {
                Some((RegisterTable::Coils, *address, values.len() as u16))
            },
            (ModbusResponse::WriteAck { .. }, ModbusRequest::WriteSingleRegister { address, .. }) => {
                Some((RegisterTable::HoldingRegisters, *address, 1))
            },
            (
                ModbusResponse::WriteAck { .. },
                ModbusRequest::WriteMultipleRegisters { address, values },
            ) => Some((RegisterTable::HoldingRegisters, *address, values.len() as u16)),
            _ => None,
        };
        let updates = written
            .map(|(table, address, quantity)| self.updates_for(table, address, quantity))
            .unwrap_or_default();
        Ok((response.encode(function)?, updates))
    }

    fn updates_for(&self, table: RegisterTable, address: u16, quantity: u16) -> Vec<PointUpdate> {
        let map = self.map.read();
        self.served
            .iter()
            .filter(|served| served.overlaps(table, address, quantity))
            .filter_map(|served| match served.read(&map) {
                Ok(reading) => Some(PointUpdate {
                    channel_id: self.logger.channel_id,
                    point_id: served.point.id,
                    point_type: served.point.point_type,
                    reading,
                }),
                Err(e) => {
                    debug!("Point {} not decodable after write: {}", served.point.id, e);
                    None
                },
            })
            .collect()
    }

    async fn reply(&mut self, incoming: &Incoming, response: &ModbusPdu) -> Result<()> {
        let frame = match incoming.transaction_id {
            Some(tid) => encode_tcp(tid, incoming.unit_id, response.as_slice()),
            None => {
                if let Framing::Rtu { silent_interval } = self.framing {
                    if !silent_interval.is_zero() {
                        tokio::time::sleep(silent_interval).await;
                    }
                }
                encode_rtu(incoming.unit_id, response.as_slice())
            },
        };
        if let Some(fc) = response.function_code() {
            self.logger
                .log_frame("TX", incoming.unit_id, fc, response.as_slice());
        }
        match self.transport.write(&frame).await {
            Ok(()) => Ok(()),
            Err(TransportError::ConnectionLost(reason)) if self.transport.is_open() => {
                debug!("Reply dropped, master went away: {}", reason);
                Ok(())
            },
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl ProtocolEngine for ModbusSlave {
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn role(&self) -> DeviceRole {
        DeviceRole::Slave
    }

    fn target(&self) -> String {
        self.transport.describe()
    }

    fn prepare(&mut self, points: &PointTable) -> Result<()> {
        let size = self.map.read().size() as u32;
        let mut served = Vec::new();
        for point in points.iter().filter(|p| p.enabled) {
            let located = ServedPoint::locate(point)?;
            if located.end() > size {
                return Err(ComLinkError::config(format!(
                    "point {} at address {} is outside the {} entry register map",
                    point.id, located.address, size
                )));
            }
            served.push(located);
        }
        self.logger.log_init(
            self.protocol,
            &format!("serving unit {} with {} points", self.unit_id, served.len()),
        );
        self.served = served;
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.open().await?;
        self.logger
            .log_connect(self.protocol, &self.transport.describe(), "listening");
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
        if cancel.is_cancelled() {
            return Ok(out);
        }

        let received = match self.framing {
            Framing::Tcp => self.receive_tcp().await,
            Framing::Rtu { .. } => self.receive_rtu().await,
        };
        let incoming = match received {
            Ok(Some(incoming)) => incoming,
            Ok(None) => return Ok(out),
            Err(e) if e.is_protocol() => {
                out.record_protocol_error(&e);
                return Ok(out);
            },
            Err(ComLinkError::Transport(TransportError::Timeout(elapsed))) => {
                // request started but never completed
                out.record_transport_error(&ComLinkError::Transport(TransportError::Timeout(elapsed)));
                return Ok(out);
            },
            Err(ComLinkError::Transport(TransportError::ConnectionLost(_))) if self.transport.is_open() => {
                return Ok(out);
            },
            Err(e) => return Err(e),
        };

        if !self.accepts(incoming.unit_id) {
            debug!("Ignoring request for unit {}", incoming.unit_id);
            return Ok(out);
        }
        if let Some(&fc) = incoming.pdu.first() {
            self.logger.log_frame("RX", incoming.unit_id, fc, &incoming.pdu);
        }

        let (response, updates) = self.handle_pdu(&incoming.pdu)?;
        out.transactions += 1;
        out.updates = updates;

        let broadcast = incoming.unit_id == BROADCAST_UNIT_ID && incoming.transaction_id.is_none();
        if !broadcast {
            self.reply(&incoming, &response).await?;
        }
        Ok(out)
    }

    async fn write_point(&mut self, point: &DataPointConfig, command: &PointCommand) -> Result<()> {
        let served = ServedPoint::locate(point)?;
        served.write(&mut self.map.write(), command)?;
        self.logger
            .log_command(point.id, command.value(), "stored in register map");
        Ok(())
    }

    async fn read_point(&mut self, point: &DataPointConfig) -> Result<PointReading> {
        let served = ServedPoint::locate(point)?;
        let map = self.map.read();
        served.read(&map)
    }

    fn cycle_interval(&self, _configured: Duration) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use voltage_comlink::transport::{MockHandle, MockTransport};
    use voltage_comlink::PointType;

    fn rtu_slave(unit_id: u8) -> (ModbusSlave, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let options = SlaveOptions {
            unit_id,
            listen_timeout_ms: 20,
            map_size: 1024,
        };
        let slave = ModbusSlave::new(
            ChannelLogger::new(9, "slave"),
            Framing::Rtu {
                silent_interval: Duration::ZERO,
            },
            Box::new(transport),
            &options,
            Duration::from_millis(20),
        );
        (slave, handle)
    }

    fn tcp_slave() -> (ModbusSlave, MockHandle) {
        let (transport, handle) = MockTransport::new();
        let options = SlaveOptions {
            unit_id: 1,
            listen_timeout_ms: 20,
            map_size: 1024,
        };
        let slave = ModbusSlave::new(
            ChannelLogger::new(9, "slave"),
            Framing::Tcp,
            Box::new(transport),
            &options,
            Duration::from_millis(20),
        );
        (slave, handle)
    }

    fn served_points() -> PointTable {
        PointTable::new([
            DataPointConfig::new(1, "setpoint", PointType::Adjustment, DataType::Uint16)
                .with_modbus(1, FC_WRITE_SINGLE_REGISTER, 10)
                .with_scaling(0.1, 0.0),
            DataPointConfig::new(2, "breaker", PointType::Control, DataType::Bool)
                .with_modbus(1, FC_WRITE_SINGLE_COIL, 3),
            DataPointConfig::new(3, "power", PointType::Telemetry, DataType::Float32)
                .with_modbus(1, FC_READ_INPUT_REGISTERS, 20),
        ])
        .unwrap()
    }

    async fn cycle(slave: &mut ModbusSlave) -> CycleOutput {
        slave
            .run_cycle(&PointTable::default(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_rtu_read_holding_registers() {
        let (mut slave, handle) = rtu_slave(1);
        slave.register_map().write().write_registers(RegisterTable::HoldingRegisters, 0, &[0x1234]).unwrap();
        slave.connect().await.unwrap();

        handle.push_input(&encode_rtu(1, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        let out = cycle(&mut slave).await;
        assert_eq!(out.transactions, 1);
        assert_eq!(handle.written(), vec![encode_rtu(1, &[0x03, 0x02, 0x12, 0x34])]);
    }

    #[tokio::test]
    async fn test_rtu_ignores_other_units_and_bad_crc() {
        let (mut slave, handle) = rtu_slave(1);
        slave.connect().await.unwrap();

        handle.push_input(&encode_rtu(2, &[0x03, 0x00, 0x00, 0x00, 0x01]));
        let out = cycle(&mut slave).await;
        assert_eq!(out.transactions, 0);
        assert!(handle.written().is_empty());

        let mut corrupted = encode_rtu(1, &[0x03, 0x00, 0x00, 0x00, 0x01]);
        corrupted[7] ^= 0xFF;
        handle.push_input(&corrupted);
        let out = cycle(&mut slave).await;
        assert_eq!(out.protocol_errors, 1);
        assert!(handle.written().is_empty());
    }

    #[tokio::test]
    async fn test_rtu_broadcast_write_has_no_reply() {
        let (mut slave, handle) = rtu_slave(1);
        slave.prepare(&served_points()).unwrap();
        slave.connect().await.unwrap();

        handle.push_input(&encode_rtu(0, &[0x06, 0x00, 0x0A, 0x00, 0x64]));
        let out = cycle(&mut slave).await;
        assert_eq!(out.transactions, 1);
        assert!(handle.written().is_empty());
        assert_eq!(
            slave.register_map().read().read_registers(RegisterTable::HoldingRegisters, 10, 1),
            Ok(vec![100])
        );
        assert_eq!(out.updates.len(), 1);
        assert!((out.updates[0].reading.as_f64() - 10.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rtu_unknown_function_gets_exception() {
        let (mut slave, handle) = rtu_slave(1);
        slave.connect().await.unwrap();
        handle.push_input(&encode_rtu(1, &[0x2B, 0x0E, 0x01, 0x00]));
        cycle(&mut slave).await;
        assert_eq!(handle.written(), vec![encode_rtu(1, &[0xAB, 0x01])]);
    }

    #[tokio::test]
    async fn test_tcp_write_produces_updates() {
        let (mut slave, handle) = tcp_slave();
        slave.prepare(&served_points()).unwrap();
        slave.connect().await.unwrap();

        handle.push_input(&encode_tcp(7, 1, &[0x05, 0x00, 0x03, 0xFF, 0x00]));
        let out = cycle(&mut slave).await;
        assert_eq!(handle.written(), vec![encode_tcp(7, 1, &[0x05, 0x00, 0x03, 0xFF, 0x00])]);
        assert_eq!(out.updates.len(), 1);
        assert_eq!(out.updates[0].point_id, 2);
        assert_eq!(out.updates[0].reading.as_f64(), 1.0);
    }

    #[tokio::test]
    async fn test_tcp_exceptions() {
        let (mut slave, handle) = tcp_slave();
        slave.connect().await.unwrap();

        // beyond the 1024 entry map
        handle.push_input(&encode_tcp(1, 1, &[0x03, 0x04, 0x00, 0x00, 0x02]));
        cycle(&mut slave).await;
        // zero quantity
        handle.push_input(&encode_tcp(2, 1, &[0x04, 0x00, 0x00, 0x00, 0x00]));
        cycle(&mut slave).await;

        let written = handle.written();
        assert_eq!(written[0], encode_tcp(1, 1, &[0x83, 0x02]));
        assert_eq!(written[1], encode_tcp(2, 1, &[0x84, 0x03]));
    }

    #[tokio::test]
    async fn test_idle_cycle_is_empty() {
        let (mut slave, handle) = tcp_slave();
        slave.connect().await.unwrap();
        let out = cycle(&mut slave).await;
        assert_eq!(out.transactions, 0);
        assert_eq!(out.protocol_errors, 0);
        assert!(handle.written().is_empty());
        assert_eq!(slave.cycle_interval(Duration::from_secs(1)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_write_point_feeds_register_map() {
        let (mut slave, _handle) = tcp_slave();
        let points = served_points();
        slave.prepare(&points).unwrap();

        let power = points.get(3).unwrap();
        let cmd = PointCommand::for_point(PointType::Adjustment, 12.5);
        slave.write_point(power, &cmd).await.unwrap();
        assert_eq!(
            slave.register_map().read().read_registers(RegisterTable::InputRegisters, 20, 2),
            Ok(vec![0x4148, 0x0000])
        );
        let reading = slave.read_point(power).await.unwrap();
        assert_eq!(reading.as_f64(), 12.5);
    }

    #[test]
    fn test_points_outside_map_rejected() {
        let (mut slave, _handle) = tcp_slave();
        let points = PointTable::new([DataPointConfig::new(1, "far", PointType::Telemetry, DataType::Uint16)
            .with_modbus(1, FC_READ_HOLDING_REGISTERS, 2000)])
        .unwrap();
        assert!(matches!(slave.prepare(&points), Err(ComLinkError::Config(_))));
    }
}
