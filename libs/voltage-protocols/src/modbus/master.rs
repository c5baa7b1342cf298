//! Modbus master engine (TCP and RTU)
//!
//! One request is outstanding at a time. A poll cycle walks the planned
//! address ranges; protocol failures degrade the points of the failing range,
//! timeouts degrade them with `CommFailure`, any other transport failure
//! aborts the cycle so the channel can reconnect.

use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use voltage_comlink::error::{ComLinkError, Result};
use voltage_comlink::transport::{SerialTransport, TcpClientTransport, Transport, TransportError};
use voltage_comlink::{
    ChannelConfig, ChannelLogger, CycleOutput, DataPointConfig, DataType, DeviceRole,
    PointCommand, PointReading, PointTable, PointUpdate, ProtocolEngine, Quality,
};

use super::codec::{
    build_write_request, read_back_function, reading_from_bit, reading_from_registers,
    register_span,
};
use super::constants::*;
use super::frame::{decode_rtu, encode_rtu, encode_tcp, MbapHeader};
use super::pdu::{decode_response, expected_response_pdu_len, ModbusRequest, ModbusResponse};
use super::planner::{plan_reads, AddressRange};
use super::types::{ModbusBatchConfig, ModbusRtuParams, ModbusTcpParams};

/// Responses with a foreign transaction id skipped before giving up
const MAX_STALE_RESPONSES: usize = 3;

/// ADU framing on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Tcp,
    /// `silent_interval` is the 3.5 character gap kept before each request
    Rtu { silent_interval: Duration },
}

impl Framing {
    /// RTU framing with the inter-frame gap derived from the character time
    pub fn rtu_for(char_time: Duration, baud_rate: u32) -> Self {
        // fixed 1.75 ms above 19200 baud
        let silent_interval = if baud_rate > 19_200 {
            Duration::from_micros(1750)
        } else {
            char_time * 7 / 2
        };
        Framing::Rtu { silent_interval }
    }
}

/// Modbus master driving one transport
pub struct ModbusMaster {
    protocol: &'static str,
    framing: Framing,
    transport: Box<dyn Transport>,
    response_timeout: Duration,
    batch: ModbusBatchConfig,
    plan: Vec<AddressRange>,
    next_tid: u16,
    logger: ChannelLogger,
}

impl ModbusMaster {
    pub fn new(
        logger: ChannelLogger,
        framing: Framing,
        transport: Box<dyn Transport>,
        response_timeout: Duration,
        batch: ModbusBatchConfig,
    ) -> Self {
        let protocol = match framing {
            Framing::Tcp => "modbus_tcp",
            Framing::Rtu { .. } => "modbus_rtu",
        };
        Self {
            protocol,
            framing,
            transport,
            response_timeout,
            batch,
            plan: Vec::new(),
            next_tid: 1,
            logger,
        }
    }

    /// Master connecting to `host:port` from the channel parameters
    pub fn tcp(channel: &ChannelConfig, params: ModbusTcpParams) -> Result<Self> {
        params.validate()?;
        let transport =
            TcpClientTransport::new(params.host.clone(), params.port, params.connect_timeout());
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            Framing::Tcp,
            Box::new(transport),
            params.response_timeout(),
            params.batch,
        ))
    }

    /// Master on a serial line
    pub fn rtu(channel: &ChannelConfig, params: ModbusRtuParams) -> Result<Self> {
        params.validate()?;
        let framing = Framing::rtu_for(params.serial.char_time(), params.serial.baud_rate);
        let transport = SerialTransport::new(params.serial.clone());
        Ok(Self::new(
            ChannelLogger::new(channel.id, channel.name.clone()),
            framing,
            Box::new(transport),
            params.response_timeout(),
            params.batch,
        ))
    }

    /// Ranges built by the last `prepare`
    pub fn plan(&self) -> &[AddressRange] {
        &self.plan
    }

    fn allocate_tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    /// Send one request and wait for its response
    ///
    /// Exceptions come back as `Ok(ModbusResponse::Exception)`.
    pub async fn transact(&mut self, unit_id: u8, request: &ModbusRequest) -> Result<ModbusResponse> {
        if !self.transport.is_open() {
            return Err(ComLinkError::NotConnected);
        }
        let pdu = request.encode()?;
        self.logger
            .log_frame("TX", unit_id, request.function_code(), pdu.as_slice());

        match self.framing {
            Framing::Tcp => self.transact_tcp(unit_id, request, pdu.as_slice()).await,
            Framing::Rtu { silent_interval } => {
                if !silent_interval.is_zero() {
                    tokio::time::sleep(silent_interval).await;
                }
                let result = self.transact_rtu(unit_id, request, pdu.as_slice()).await;
                if let Err(e) = &result {
                    if !e.needs_reconnect() {
                        // resync the line before the next request
                        self.transport.discard_input().await;
                    }
                }
                result
            },
        }
    }

    async fn transact_tcp(
        &mut self,
        unit_id: u8,
        request: &ModbusRequest,
        pdu: &[u8],
    ) -> Result<ModbusResponse> {
        let tid = self.allocate_tid();
        let frame = encode_tcp(tid, unit_id, pdu);
        self.logger.log_raw_frame("TX", &frame);
        self.transport.write(&frame).await?;

        let mut last_tid = tid;
        for _ in 0..=MAX_STALE_RESPONSES {
            let mut head = [0u8; MBAP_HEADER_LEN];
            self.transport
                .read_exact(&mut head, self.response_timeout)
                .await?;
            let header = match MbapHeader::parse(&head) {
                Ok(header) => header,
                Err(e) => {
                    // framing lost, the stream cannot be trusted any more
                    let _ = self.transport.close().await;
                    return Err(e);
                },
            };
            let mut body = vec![0u8; header.pdu_len()];
            self.transport
                .read_exact(&mut body, self.response_timeout)
                .await?;
            self.logger.log_raw_frame("RX", &body);

            if header.transaction_id != tid {
                debug!(
                    "Skipping stale response tid={} (waiting for {})",
                    header.transaction_id, tid
                );
                last_tid = header.transaction_id;
                continue;
            }
            if header.unit_id != unit_id {
                return Err(ComLinkError::malformed(format!(
                    "response from unit {}, expected {}",
                    header.unit_id, unit_id
                )));
            }
            if let Some(&fc) = body.first() {
                self.logger.log_frame("RX", unit_id, fc, &body);
            }
            return decode_response(&body, request);
        }

        Err(ComLinkError::TransactionMismatch {
            expected: tid,
            actual: last_tid,
        })
    }

    async fn transact_rtu(
        &mut self,
        unit_id: u8,
        request: &ModbusRequest,
        pdu: &[u8],
    ) -> Result<ModbusResponse> {
        let frame = encode_rtu(unit_id, pdu);
        self.logger.log_raw_frame("TX", &frame);
        self.transport.write(&frame).await?;

        if unit_id == BROADCAST_UNIT_ID {
            // broadcast writes are never answered
            return Ok(write_ack(request));
        }

        let mut head = [0u8; 3];
        self.transport
            .read_exact(&mut head, self.response_timeout)
            .await?;
        let pdu_len = expected_response_pdu_len(request, [head[1], head[2]]);
        // address + PDU + CRC, minus what is already read
        let mut rest = vec![0u8; 1 + pdu_len + 2 - head.len()];
        self.transport
            .read_exact(&mut rest, self.response_timeout)
            .await?;

        let mut adu = Vec::with_capacity(head.len() + rest.len());
        adu.extend_from_slice(&head);
        adu.extend_from_slice(&rest);
        self.logger.log_raw_frame("RX", &adu);

        let (address, body) = decode_rtu(&adu)?;
        if address != unit_id {
            return Err(ComLinkError::malformed(format!(
                "response from unit {}, expected {}",
                address, unit_id
            )));
        }
        self.logger.log_frame("RX", unit_id, head[1], body);
        decode_response(body, request)
    }

    async fn read_registers(&mut self, unit_id: u8, function_code: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        let request = ModbusRequest::read(function_code, address, quantity)?;
        match self.transact(unit_id, &request).await?.into_result()? {
            ModbusResponse::Registers(regs) => Ok(regs),
            other => Err(ComLinkError::malformed(format!(
                "unexpected response {:?}",
                other
            ))),
        }
    }

    async fn read_bits(&mut self, unit_id: u8, function_code: u8, address: u16, quantity: u16) -> Result<Vec<bool>> {
        let request = ModbusRequest::read(function_code, address, quantity)?;
        match self.transact(unit_id, &request).await?.into_result()? {
            ModbusResponse::Bits(bits) => Ok(bits),
            other => Err(ComLinkError::malformed(format!(
                "unexpected response {:?}",
                other
            ))),
        }
    }

    /// FC01
    pub async fn read_coils(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.read_bits(unit_id, FC_READ_COILS, address, quantity).await
    }

    /// FC02
    pub async fn read_discrete_inputs(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<bool>> {
        self.read_bits(unit_id, FC_READ_DISCRETE_INPUTS, address, quantity)
            .await
    }

    /// FC03
    pub async fn read_holding_registers(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.read_registers(unit_id, FC_READ_HOLDING_REGISTERS, address, quantity)
            .await
    }

    /// FC04
    pub async fn read_input_registers(&mut self, unit_id: u8, address: u16, quantity: u16) -> Result<Vec<u16>> {
        self.read_registers(unit_id, FC_READ_INPUT_REGISTERS, address, quantity)
            .await
    }

    /// FC05
    pub async fn write_single_coil(&mut self, unit_id: u8, address: u16, value: bool) -> Result<()> {
        self.write(unit_id, ModbusRequest::WriteSingleCoil { address, value })
            .await
    }

    /// FC06
    pub async fn write_single_register(&mut self, unit_id: u8, address: u16, value: u16) -> Result<()> {
        self.write(unit_id, ModbusRequest::WriteSingleRegister { address, value })
            .await
    }

    /// FC15
    pub async fn write_multiple_coils(&mut self, unit_id: u8, address: u16, values: &[bool]) -> Result<()> {
        self.write(
            unit_id,
            ModbusRequest::WriteMultipleCoils {
                address,
                values: values.to_vec(),
            },
        )
        .await
    }

    /// FC16
    pub async fn write_multiple_registers(&mut self, unit_id: u8, address: u16, values: &[u16]) -> Result<()> {
        self.write(
            unit_id,
            ModbusRequest::WriteMultipleRegisters {
                address,
                values: values.to_vec(),
            },
        )
        .await
    }

    async fn write(&mut self, unit_id: u8, request: ModbusRequest) -> Result<()> {
        let expected = write_ack(&request);
        match self.transact(unit_id, &request).await?.into_result()? {
            ack if ack == expected => Ok(()),
            other => Err(ComLinkError::malformed(format!(
                "write echo {:?} does not match {:?}",
                other, expected
            ))),
        }
    }

    /// Read one planned range and turn it into point updates
    async fn poll_range(
        &mut self,
        range: &AddressRange,
        points: &PointTable,
        out: &mut CycleOutput,
    ) -> Result<()> {
        self.logger
            .log_poll(range.slave_id, range.function_code, range.start, range.quantity);

        let response = match self.fetch_range(range).await {
            Ok(response) => response,
            Err(e) if e.is_protocol() => {
                warn!(
                    "Range s{}f{}@{}x{} failed: {}",
                    range.slave_id, range.function_code, range.start, range.quantity, e
                );
                out.record_protocol_error(&e);
                degrade_range(self.logger.channel_id, range, points, Quality::Invalid, out);
                self.logger
                    .log_poll_result(range.slave_id, range.function_code, 0, range.point_ids.len());
                return Ok(());
            },
            Err(ComLinkError::Transport(TransportError::Timeout(elapsed))) => {
                let e = ComLinkError::Transport(TransportError::Timeout(elapsed));
                warn!(
                    "Range s{}f{}@{}x{} timed out",
                    range.slave_id, range.function_code, range.start, range.quantity
                );
                out.record_transport_error(&e);
                degrade_range(self.logger.channel_id, range, points, Quality::CommFailure, out);
                return Ok(());
            },
            Err(e) => return Err(e),
        };
        out.transactions += 1;

        let mut ok = 0;
        let mut failed = 0;
        for &point_id in &range.point_ids {
            let Some(point) = points.get(point_id) else {
                continue;
            };
            match decode_point(range, point, &response) {
                Ok(reading) => {
                    ok += 1;
                    out.updates.push(update(self.logger.channel_id, point, reading));
                },
                Err(e) => {
                    failed += 1;
                    out.record_protocol_error(&e);
                    out.updates.push(update(
                        self.logger.channel_id,
                        point,
                        PointReading::degraded(point, Quality::Invalid),
                    ));
                },
            }
        }
        self.logger
            .log_poll_result(range.slave_id, range.function_code, ok, failed);
        Ok(())
    }

    async fn fetch_range(&mut self, range: &AddressRange) -> Result<ModbusResponse> {
        let request = ModbusRequest::read(range.function_code, range.start, range.quantity)?;
        self.transact(range.slave_id, &request).await?.into_result()
    }
}

fn update(channel_id: u32, point: &DataPointConfig, reading: PointReading) -> PointUpdate {
    PointUpdate {
        channel_id,
        point_id: point.id,
        point_type: point.point_type,
        reading,
    }
}

fn degrade_range(
    channel_id: u32,
    range: &AddressRange,
    points: &PointTable,
    quality: Quality,
    out: &mut CycleOutput,
) {
    for &point_id in &range.point_ids {
        if let Some(point) = points.get(point_id) {
            out.updates.push(update(
                channel_id,
                point,
                PointReading::degraded(point, quality),
            ));
        }
    }
}

fn decode_point(range: &AddressRange, point: &DataPointConfig, response: &ModbusResponse) -> Result<PointReading> {
    let mapping = point
        .modbus()
        .ok_or_else(|| ComLinkError::config(format!("point {} has no Modbus mapping", point.id)))?;
    let offset = usize::from(mapping.register_address.saturating_sub(range.start));
    match response {
        ModbusResponse::Registers(regs) => {
            let span = usize::from(register_span(point, mapping));
            let raw = regs.get(offset..offset + span).ok_or_else(|| {
                ComLinkError::conversion(format!("point {} outside the response", point.id))
            })?;
            reading_from_registers(point, mapping, raw)
        },
        ModbusResponse::Bits(bits) => {
            let bit = *bits.get(offset).ok_or_else(|| {
                ComLinkError::conversion(format!("point {} outside the response", point.id))
            })?;
            Ok(reading_from_bit(point, bit))
        },
        other => Err(ComLinkError::malformed(format!(
            "unexpected read response {:?}",
            other
        ))),
    }
}

fn write_address(request: &ModbusRequest) -> u16 {
    match request {
        ModbusRequest::WriteSingleCoil { address, .. }
        | ModbusRequest::WriteSingleRegister { address, .. }
        | ModbusRequest::WriteMultipleCoils { address, .. }
        | ModbusRequest::WriteMultipleRegisters { address, .. }
        | ModbusRequest::ReadCoils { address, .. }
        | ModbusRequest::ReadDiscreteInputs { address, .. }
        | ModbusRequest::ReadHoldingRegisters { address, .. }
        | ModbusRequest::ReadInputRegisters { address, .. } => *address,
    }
}

/// Echo a device returns for a write request
fn write_ack(request: &ModbusRequest) -> ModbusResponse {
    let value = match request {
        ModbusRequest::WriteSingleCoil { value, .. } => {
            if *value {
                COIL_ON
            } else {
                COIL_OFF
            }
        },
        ModbusRequest::WriteSingleRegister { value, .. } => *value,
        ModbusRequest::WriteMultipleCoils { values, .. } => values.len() as u16,
        ModbusRequest::WriteMultipleRegisters { values, .. } => values.len() as u16,
        _ => 0,
    };
    ModbusResponse::WriteAck {
        address: write_address(request),
        value,
    }
}

/// Whether a read-back confirms the commanded value
fn confirms(point: &DataPointConfig, expected: f64, actual: f64) -> bool {
    if point.point_type.is_digital() || point.data_type == DataType::Bool {
        return (expected != 0.0) == (actual != 0.0);
    }
    let tolerance = match point.data_type {
        DataType::Float32 => (expected.abs() * 1e-6).max(1e-6),
        // integer registers round to one raw step
        _ => point.scale.abs() * 0.5 + 1e-9,
    };
    (expected - actual).abs() <= tolerance
}

#[async_trait]
impl ProtocolEngine for ModbusMaster {
    fn protocol(&self) -> &str {
        self.protocol
    }

    fn role(&self) -> DeviceRole {
        DeviceRole::Master
    }

    fn target(&self) -> String {
        self.transport.describe()
    }

    fn prepare(&mut self, points: &PointTable) -> Result<()> {
        for point in points.iter().filter(|p| p.enabled) {
            let mapping = point.modbus().ok_or_else(|| {
                ComLinkError::config(format!("point {} has no Modbus mapping", point.id))
            })?;
            if mapping.slave_id == BROADCAST_UNIT_ID && !point.point_type.is_command() {
                return Err(ComLinkError::config(format!(
                    "point {} polls the broadcast unit",
                    point.id
                )));
            }
            if let Some(bit) = mapping.bit_position {
                if bit > 15 {
                    return Err(ComLinkError::config(format!(
                        "point {} bit position {} > 15",
                        point.id, bit
                    )));
                }
            }
        }
        self.plan = plan_reads(points.pollable(), &self.batch)?;
        self.logger.log_init(
            self.protocol,
            &format!(
                "{} points in {} read ranges",
                points.pollable().count(),
                self.plan.len()
            ),
        );
        Ok(())
    }

    async fn connect(&mut self) -> Result<()> {
        self.transport.open().await?;
        self.logger
            .log_connect(self.protocol, &self.transport.describe(), "link open");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.transport.close().await?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.transport.is_open()
    }

    async fn run_cycle(&mut self, points: &PointTable, cancel: &CancellationToken) -> Result<CycleOutput> {
        let mut out = CycleOutput::default();
        let plan = self.plan.clone();
        for range in &plan {
            if cancel.is_cancelled() {
                break;
            }
            self.poll_range(range, points, &mut out).await?;
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
            .modbus()
            .ok_or_else(|| ComLinkError::rejected(format!("point {} has no Modbus mapping", point.id)))?;

        let current_word = match (mapping.bit_position, mapping.function_code) {
            (Some(_), FC_READ_HOLDING_REGISTERS | FC_WRITE_SINGLE_REGISTER | FC_WRITE_MULTIPLE_REGISTERS) => {
                let regs = self
                    .read_holding_registers(mapping.slave_id, mapping.register_address, 1)
                    .await?;
                regs.first().copied()
            },
            _ => None,
        };

        let request = build_write_request(point, &mapping, command, current_word)?;
        self.write(mapping.slave_id, request).await?;
        self.logger
            .log_command(point.id, command.value(), "written");

        if command.confirm() && mapping.slave_id != BROADCAST_UNIT_ID {
            let reading = self.read_point(point).await?;
            let actual = reading.as_f64();
            if !confirms(point, command.value(), actual) {
                return Err(ComLinkError::ConfirmMismatch {
                    point_id: point.id,
                    expected: command.value(),
                    actual,
                });
            }
        }
        Ok(())
    }

    async fn read_point(&mut self, point: &DataPointConfig) -> Result<PointReading> {
        let mapping = *point
            .modbus()
            .ok_or_else(|| ComLinkError::config(format!("point {} has no Modbus mapping", point.id)))?;
        let function_code = read_back_function(&mapping).ok_or_else(|| {
            ComLinkError::NotSupported(format!("FC{:02} cannot be read", mapping.function_code))
        })?;
        let span = register_span(point, &mapping);
        if is_bit_function(function_code) {
            let bits = self
                .read_bits(mapping.slave_id, function_code, mapping.register_address, 1)
                .await?;
            let bit = bits
                .first()
                .copied()
                .ok_or_else(|| ComLinkError::malformed("empty bit response"))?;
            Ok(reading_from_bit(point, bit))
        } else {
            let regs = self
                .read_registers(mapping.slave_id, function_code, mapping.register_address, span)
                .await?;
            reading_from_registers(point, &mapping, &regs)
        }
    }
}
