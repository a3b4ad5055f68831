//! Modbus protocol engine
//!
//! Turns one request frame into at most one response frame:
//!
//! ```text
//! frame ──decode──▶ server id check ──▶ dispatch ──▶ Read | WriteSingle | WriteMultiple
//!   │                    │                  │
//!   └─ DropReason ◀──────┘                  └─ ModbusException ──▶ exception PDU
//! ```
//!
//! Integrity problems (short frame, CRC, length, foreign server id) produce no
//! output at all. Function-level problems always produce an exception
//! response. Nothing is kept between frames.
//!
//! # Example
//!
//! ```rust
//! use voltage_modbus_server::{DataBank, ProtocolEngine, RegisterTable, RtuFraming, FrameOutcome};
//!
//! let mut bank = DataBank::default();
//! bank.holding_registers = RegisterTable::filled(200, 100, 42);
//! let mut engine = ProtocolEngine::new(1, bank);
//!
//! // read 1 holding register at 200
//! let request = [0x01, 0x03, 0x00, 0xC8, 0x00, 0x01, 0x05, 0xF4];
//! match engine.handle_frame(&RtuFraming, &request) {
//!     FrameOutcome::Response(frame) => assert_eq!(&frame[..5], &[0x01, 0x03, 0x02, 0x00, 0x2A]),
//!     FrameOutcome::Dropped(reason) => panic!("dropped: {reason}"),
//! }
//! ```

use tracing::{debug, trace, warn};

use crate::codec::{unpack_bits, unpack_registers, DropReason, Framing};
use crate::constants::{COIL_OFF, COIL_ON};
use crate::databank::DataBank;
use crate::pdu::{ModbusPdu, PduBuilder};
use crate::protocol::{ModbusException, ModbusFunction, SlaveId};

/// Result of handling one received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Encoded response to send back, success or exception
    Response(Vec<u8>),
    /// Frame discarded, nothing is sent
    Dropped(DropReason),
}

impl FrameOutcome {
    pub fn response(&self) -> Option<&[u8]> {
        match self {
            FrameOutcome::Response(frame) => Some(frame),
            FrameOutcome::Dropped(_) => None,
        }
    }
}

/// Address and count/value fields common to all eight function codes
#[derive(Debug, Clone, Copy)]
struct RequestFields {
    address: u16,
    /// Quantity for reads and write-multiple, value for write-single
    value: u16,
}

impl RequestFields {
    fn parse(payload: &[u8]) -> Result<Self, ModbusException> {
        match payload {
            [a0, a1, v0, v1, ..] => Ok(Self {
                address: u16::from_be_bytes([*a0, *a1]),
                value: u16::from_be_bytes([*v0, *v1]),
            }),
            _ => Err(ModbusException::IllegalDataValue),
        }
    }
}

/// Validates and executes requests against a [`DataBank`]
#[derive(Debug, Clone)]
pub struct ProtocolEngine {
    server_id: SlaveId,
    bank: DataBank,
}

impl ProtocolEngine {
    pub fn new(server_id: SlaveId, bank: DataBank) -> Self {
        Self { server_id, bank }
    }

    #[inline]
    pub fn server_id(&self) -> SlaveId {
        self.server_id
    }

    pub fn data_bank(&self) -> &DataBank {
        &self.bank
    }

    /// Direct access for the application side (e.g. refreshing input registers)
    pub fn data_bank_mut(&mut self) -> &mut DataBank {
        &mut self.bank
    }

    /// Decode a raw frame, execute it, and encode the response
    pub fn handle_frame<F: Framing>(&mut self, framing: &F, frame: &[u8]) -> FrameOutcome {
        trace!("[{}] handling {} byte frame", F::NAME, frame.len());

        let request = match framing.decode(frame) {
            Ok(request) => request,
            Err(reason) => {
                warn!("[{}] dropping frame: {}", F::NAME, reason);
                return FrameOutcome::Dropped(reason);
            }
        };

        if request.server_id != self.server_id {
            let reason = DropReason::ServerIdMismatch {
                received: request.server_id,
                expected: self.server_id,
            };
            debug!("[{}] ignoring frame: {}", F::NAME, reason);
            return FrameOutcome::Dropped(reason);
        }

        let response = self.process_pdu(request.pdu);
        FrameOutcome::Response(framing.encode(&request.header, self.server_id, &response))
    }

    /// Execute a request PDU (function code + payload) and return the response PDU
    ///
    /// Always yields a response: failures become exception PDUs.
    pub fn process_pdu(&mut self, pdu: &[u8]) -> ModbusPdu {
        let Some((&fc, payload)) = pdu.split_first() else {
            // decoders never hand out an empty PDU
            return PduBuilder::build_exception_response(0, ModbusException::IllegalFunction);
        };

        match self.execute(fc, payload, pdu) {
            Ok(response) => response,
            Err(exception) => {
                debug!(
                    "FC={:02X} ({}) -> exception {:02X}",
                    fc,
                    ModbusPdu::function_code_description(fc),
                    exception.to_u8()
                );
                PduBuilder::build_exception_response(fc, exception)
            }
        }
    }

    fn execute(
        &mut self,
        fc: u8,
        payload: &[u8],
        request_pdu: &[u8],
    ) -> Result<ModbusPdu, ModbusException> {
        let function =
            ModbusFunction::from_u8(fc).map_err(|_| ModbusException::IllegalFunction)?;
        let fields = RequestFields::parse(payload)?;
        debug!(
            "Dispatch {}: address={}, count/value={:#06X}",
            function, fields.address, fields.value
        );

        match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let count = self.check_range(function, fields.address, fields.value)?;
                let table = self.bank.bits(function.register_kind()).map_err(internal)?;
                let values = table.get(fields.address, count).map_err(internal)?;
                PduBuilder::build_read_bits_response(fc, values).map_err(internal)
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let count = self.check_range(function, fields.address, fields.value)?;
                let table = self.bank.words(function.register_kind()).map_err(internal)?;
                let values = table.get(fields.address, count).map_err(internal)?;
                PduBuilder::build_read_registers_response(fc, values).map_err(internal)
            }
            ModbusFunction::WriteSingleCoil => {
                self.check_single(function, fields.address)?;
                let value = match fields.value {
                    COIL_ON => true,
                    COIL_OFF => false,
                    _ => return Err(ModbusException::IllegalDataValue),
                };
                self.bank
                    .coils
                    .set(fields.address, &[value])
                    .map_err(internal)?;
                ModbusPdu::from_slice(request_pdu).map_err(internal)
            }
            ModbusFunction::WriteSingleRegister => {
                self.check_single(function, fields.address)?;
                self.bank
                    .holding_registers
                    .set(fields.address, &[fields.value])
                    .map_err(internal)?;
                ModbusPdu::from_slice(request_pdu).map_err(internal)
            }
            ModbusFunction::WriteMultipleCoils => {
                let count = self.check_range(function, fields.address, fields.value)?;
                let values = unpack_bits(write_data(payload)?, count)?;
                self.bank
                    .coils
                    .set(fields.address, &values)
                    .map_err(internal)?;
                PduBuilder::build_write_multiple_response(fc, fields.address, fields.value)
                    .map_err(internal)
            }
            ModbusFunction::WriteMultipleRegisters => {
                let count = self.check_range(function, fields.address, fields.value)?;
                let values = unpack_registers(write_data(payload)?, count)?;
                self.bank
                    .holding_registers
                    .set(fields.address, &values)
                    .map_err(internal)?;
                PduBuilder::build_write_multiple_response(fc, fields.address, fields.value)
                    .map_err(internal)
            }
        }
    }

    /// Quantity limit (0x03) then table bounds (0x02)
    fn check_range(
        &self,
        function: ModbusFunction,
        address: u16,
        quantity: u16,
    ) -> Result<usize, ModbusException> {
        let count = quantity as usize;
        if count == 0 || count > function.max_quantity() {
            return Err(ModbusException::IllegalDataValue);
        }
        self.check_single_range(function, address, count)?;
        Ok(count)
    }

    fn check_single(&self, function: ModbusFunction, address: u16) -> Result<(), ModbusException> {
        self.check_single_range(function, address, 1)
    }

    fn check_single_range(
        &self,
        function: ModbusFunction,
        address: u16,
        count: usize,
    ) -> Result<(), ModbusException> {
        if self.bank.validate(function.register_kind(), address, count) {
            Ok(())
        } else {
            Err(ModbusException::IllegalDataAddress)
        }
    }
}

/// Data bytes of a write-multiple payload, bounded by its byte count field
fn write_data(payload: &[u8]) -> Result<&[u8], ModbusException> {
    let (&byte_count, data) = payload
        .get(4..)
        .and_then(<[u8]>::split_first)
        .ok_or(ModbusException::IllegalDataValue)?;
    Ok(&data[..data.len().min(byte_count as usize)])
}

/// Failures that cannot happen after validation
fn internal<E: std::fmt::Display>(err: E) -> ModbusException {
    warn!("Internal error while executing request: {}", err);
    ModbusException::ServerDeviceFailure
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{crc16_bytes, RtuFraming, TcpFraming};
    use crate::databank::RegisterTable;

    fn sample_bank() -> DataBank {
        DataBank::new(
            RegisterTable::new(
                100,
                vec![true, false, true, false, true, false, true, false, true, false],
            ),
            RegisterTable::filled(0, 10, false),
            RegisterTable::filled(200, 100, 42),
            RegisterTable::filled(1000, 10, 1),
        )
    }

    fn engine() -> ProtocolEngine {
        ProtocolEngine::new(1, sample_bank())
    }

    fn rtu(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16_bytes(body));
        frame
    }

    fn pdu(bytes: &[u8]) -> Vec<u8> {
        engine_pdu(&mut engine(), bytes)
    }

    fn engine_pdu(engine: &mut ProtocolEngine, bytes: &[u8]) -> Vec<u8> {
        engine.process_pdu(bytes).as_slice().to_vec()
    }

    #[test]
    fn test_read_holding_registers() {
        let response = pdu(&[0x03, 0x00, 0xC8, 0x00, 0x05]);
        assert_eq!(
            response,
            vec![0x03, 0x0A, 0x00, 0x2A, 0x00, 0x2A, 0x00, 0x2A, 0x00, 0x2A, 0x00, 0x2A]
        );
    }

    #[test]
    fn test_read_coils_bit_packing() {
        let response = pdu(&[0x01, 0x00, 0x64, 0x00, 0x0A]);
        assert_eq!(response, vec![0x01, 0x02, 0x55, 0x01]);
    }

    #[test]
    fn test_read_discrete_and_input() {
        assert_eq!(pdu(&[0x02, 0x00, 0x00, 0x00, 0x03]), vec![0x02, 0x01, 0x00]);
        assert_eq!(
            pdu(&[0x04, 0x03, 0xE8, 0x00, 0x02]),
            vec![0x04, 0x04, 0x00, 0x01, 0x00, 0x01]
        );
    }

    #[test]
    fn test_out_of_range_is_illegal_data_address() {
        // [250, 260) against coils [100, 110)
        assert_eq!(pdu(&[0x01, 0x00, 0xFA, 0x00, 0x0A]), vec![0x81, 0x02]);
        // one past the end of the holding registers
        assert_eq!(pdu(&[0x03, 0x01, 0x2B, 0x00, 0x02]), vec![0x83, 0x02]);
        assert_eq!(pdu(&[0x06, 0x01, 0x2C, 0x00, 0x01]), vec![0x86, 0x02]);
    }

    #[test]
    fn test_unsupported_function() {
        assert_eq!(pdu(&[0x07]), vec![0x87, 0x01]);
        assert_eq!(pdu(&[0x17, 0x00, 0xC8, 0x00, 0x01]), vec![0x97, 0x01]);
    }

    #[test]
    fn test_quantity_limits() {
        assert_eq!(pdu(&[0x03, 0x00, 0xC8, 0x00, 0x00]), vec![0x83, 0x03]);
        assert_eq!(pdu(&[0x03, 0x00, 0xC8, 0x00, 0x7E]), vec![0x83, 0x03]);
        assert_eq!(pdu(&[0x01, 0x00, 0x64, 0x07, 0xD1]), vec![0x81, 0x03]);
    }

    #[test]
    fn test_truncated_payload() {
        assert_eq!(pdu(&[0x03, 0x00, 0xC8]), vec![0x83, 0x03]);
        assert_eq!(pdu(&[0x10, 0x00, 0xC8, 0x00, 0x01]), vec![0x90, 0x03]);
    }

    #[test]
    fn test_write_single_coil() {
        let mut engine = engine();
        let request = [0x05, 0x00, 0x65, 0xFF, 0x00];
        assert_eq!(engine_pdu(&mut engine, &request), request.to_vec());
        assert!(engine.data_bank().coils.get(101, 1).unwrap()[0]);

        let request = [0x05, 0x00, 0x64, 0x00, 0x00];
        assert_eq!(engine_pdu(&mut engine, &request), request.to_vec());
        assert!(!engine.data_bank().coils.get(100, 1).unwrap()[0]);
    }

    #[test]
    fn test_write_single_coil_rejects_other_values() {
        let mut engine = engine();
        let before = engine.data_bank().clone();
        assert_eq!(
            engine_pdu(&mut engine, &[0x05, 0x00, 0x65, 0x12, 0x34]),
            vec![0x85, 0x03]
        );
        assert_eq!(engine.data_bank(), &before);
    }

    #[test]
    fn test_write_single_register_echoes_request() {
        let mut engine = engine();
        let request = [0x06, 0x00, 0xC9, 0xBE, 0xEF];
        assert_eq!(engine_pdu(&mut engine, &request), request.to_vec());
        assert_eq!(
            engine.data_bank().holding_registers.get(200, 2).unwrap(),
            &[42, 0xBEEF]
        );
    }

    #[test]
    fn test_write_multiple_coils() {
        let mut engine = engine();
        let request = PduBuilder::build_write_multiple_coils(102, &[true, true, false, true])
            .unwrap();
        assert_eq!(
            engine_pdu(&mut engine, request.as_slice()),
            vec![0x0F, 0x00, 0x66, 0x00, 0x04]
        );
        assert_eq!(
            engine.data_bank().coils.get(100, 8).unwrap(),
            &[true, false, true, true, false, true, true, false]
        );
    }

    #[test]
    fn test_write_multiple_coils_short_data() {
        let mut engine = engine();
        // 9 coils declared, one data byte supplied
        assert_eq!(
            engine_pdu(&mut engine, &[0x0F, 0x00, 0x64, 0x00, 0x09, 0x01, 0xFF]),
            vec![0x8F, 0x03]
        );
        // byte count says 1 even though two bytes follow
        assert_eq!(
            engine_pdu(&mut engine, &[0x0F, 0x00, 0x64, 0x00, 0x09, 0x01, 0xFF, 0x01]),
            vec![0x8F, 0x03]
        );
        assert_eq!(engine.data_bank(), &sample_bank());
    }

    #[test]
    fn test_write_multiple_registers() {
        let mut engine = engine();
        let request = PduBuilder::build_write_multiple_registers(298, &[7, 8]).unwrap();
        assert_eq!(
            engine_pdu(&mut engine, request.as_slice()),
            vec![0x10, 0x01, 0x2A, 0x00, 0x02]
        );
        assert_eq!(
            engine.data_bank().holding_registers.get(297, 3).unwrap(),
            &[42, 7, 8]
        );

        // range crossing the end is rejected before any write
        let request = PduBuilder::build_write_multiple_registers(299, &[1, 2]).unwrap();
        assert_eq!(engine_pdu(&mut engine, request.as_slice()), vec![0x90, 0x02]);
    }

    #[test]
    fn test_rtu_round_trip() {
        let mut engine = engine();
        let request = rtu(&[0x01, 0x03, 0x00, 0xC8, 0x00, 0x02]);
        let outcome = engine.handle_frame(&RtuFraming, &request);
        let expected = rtu(&[0x01, 0x03, 0x04, 0x00, 0x2A, 0x00, 0x2A]);
        assert_eq!(outcome, FrameOutcome::Response(expected));
    }

    #[test]
    fn test_rtu_exception_frame() {
        let mut engine = engine();
        let request = rtu(&[0x01, 0x05, 0x00, 0x65, 0x12, 0x34]);
        let outcome = engine.handle_frame(&RtuFraming, &request);
        assert_eq!(outcome, FrameOutcome::Response(rtu(&[0x01, 0x85, 0x03])));
    }

    #[test]
    fn test_corrupted_crc_produces_nothing() {
        let mut engine = engine();
        let mut request = rtu(&[0x01, 0x06, 0x00, 0xC8, 0x00, 0x07]);
        let n = request.len();
        request[n - 2] ^= 0xFF;
        request[n - 1] ^= 0xFF;

        let outcome = engine.handle_frame(&RtuFraming, &request);
        assert!(matches!(
            outcome,
            FrameOutcome::Dropped(DropReason::CrcMismatch { .. })
        ));
        assert_eq!(outcome.response(), None);
        // the write was not applied
        assert_eq!(engine.data_bank(), &sample_bank());
    }

    #[test]
    fn test_foreign_server_id_is_ignored() {
        let mut engine = engine();
        let request = rtu(&[0x02, 0x03, 0x00, 0xC8, 0x00, 0x01]);
        assert_eq!(
            engine.handle_frame(&RtuFraming, &request),
            FrameOutcome::Dropped(DropReason::ServerIdMismatch {
                received: 2,
                expected: 1
            })
        );
    }

    #[test]
    fn test_tcp_frame() {
        let mut engine = engine();
        let request = [
            0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0xFA, 0x00, 0x0A,
        ];
        assert_eq!(
            engine.handle_frame(&TcpFraming, &request),
            FrameOutcome::Response(vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x03, 0x01, 0x81, 0x02])
        );
    }

    #[test]
    fn test_repeated_read_is_idempotent() {
        let mut engine = engine();
        let request = rtu(&[0x01, 0x01, 0x00, 0x64, 0x00, 0x0A]);
        let first = engine.handle_frame(&RtuFraming, &request);
        let second = engine.handle_frame(&RtuFraming, &request);
        assert!(first.response().is_some());
        assert_eq!(first, second);
    }
}
