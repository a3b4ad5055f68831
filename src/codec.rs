//! # Modbus Frame Codec
//!
//! Transport envelopes and payload encodings shared by the server.
//!
//! The application layer (PDU) is identical on both transports; only the
//! envelope differs:
//!
//! | Transport | Request layout |
//! |-----------|----------------|
//! | RTU | `[server_id:1][function:1][payload:N][crc16:2 LE]` |
//! | TCP | `[txn_id:2 BE][proto_id:2 BE][length:2 BE][server_id:1][function:1][payload:length-2]` |
//!
//! [`Framing`] captures that difference so the engine can be written once.
//!
//! ## Payload encodings
//!
//! - Words travel big-endian, two bytes each.
//! - Bits are packed eight per byte, LSB first; a partial final byte is
//!   zero-padded.

use std::fmt;

use crc::{Crc, CRC_16_MODBUS};
use thiserror::Error;

use crate::constants::{
    CRC_LEN, MAX_RTU_FRAME_SIZE, MBAP_HEADER_LEN, RTU_MIN_FRAME_LEN, TCP_MIN_FRAME_LEN,
};
use crate::pdu::ModbusPdu;
use crate::protocol::{ModbusException, SlaveId};

/// CRC calculator for RTU (poly 0xA001 reflected, init 0xFFFF)
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

// ============================================================================
// CRC16
// ============================================================================

/// CRC-16/MODBUS over `data`
#[inline]
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// CRC-16/MODBUS packed the way it travels on the wire (little-endian)
#[inline]
pub fn crc16_bytes(data: &[u8]) -> [u8; 2] {
    crc16(data).to_le_bytes()
}

// ============================================================================
// Bit / word packing
// ============================================================================

/// Pack booleans eight per byte, LSB first
pub fn pack_bits(values: &[bool]) -> Vec<u8> {
    values
        .chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .enumerate()
                .fold(0u8, |byte, (i, &bit)| if bit { byte | (1 << i) } else { byte })
        })
        .collect()
}

/// Unpack exactly `count` booleans from LSB-first packed bytes
///
/// Fails with `IllegalDataValue` when `bytes` cannot supply `count` bits.
pub fn unpack_bits(bytes: &[u8], count: usize) -> Result<Vec<bool>, ModbusException> {
    if bytes.len() * 8 < count {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok((0..count)
        .map(|i| bytes[i / 8] & (1 << (i % 8)) != 0)
        .collect())
}

/// Serialize words big-endian
pub fn pack_registers(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_be_bytes()).collect()
}

/// Read exactly `count` big-endian words
///
/// Fails with `IllegalDataValue` when `bytes` holds fewer than `count` words.
pub fn unpack_registers(bytes: &[u8], count: usize) -> Result<Vec<u16>, ModbusException> {
    if bytes.len() < count * 2 {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(bytes
        .chunks_exact(2)
        .take(count)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

// ============================================================================
// Envelopes
// ============================================================================

/// Why a received frame was discarded without a response
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    #[error("frame too short: {len} bytes (min {min})")]
    TooShort { len: usize, min: usize },

    #[error("frame too long: {len} bytes (max {max})")]
    TooLong { len: usize, max: usize },

    #[error("CRC mismatch: received {received:04X}, calculated {calculated:04X}")]
    CrcMismatch { received: u16, calculated: u16 },

    #[error("length field {length} does not fit {available} received bytes")]
    LengthMismatch { length: u16, available: usize },

    #[error("addressed to server {received}, this is server {expected}")]
    ServerIdMismatch { received: SlaveId, expected: SlaveId },
}

/// A request with its transport envelope stripped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame<'a, H> {
    /// Envelope fields echoed on the response
    pub header: H,
    pub server_id: SlaveId,
    /// Function code + payload
    pub pdu: &'a [u8],
}

/// Envelope encode/decode for one transport
pub trait Framing {
    /// Per-request envelope state carried over to the response
    type Header: Copy + fmt::Debug + Send + Sync;

    /// Short transport tag used in logs
    const NAME: &'static str;

    /// Position of the function code inside an encoded frame
    const PDU_OFFSET: usize;

    /// Strip the envelope and check its integrity
    fn decode<'a>(&self, frame: &'a [u8]) -> Result<RequestFrame<'a, Self::Header>, DropReason>;

    /// Wrap a response PDU in the envelope
    fn encode(&self, header: &Self::Header, server_id: SlaveId, pdu: &ModbusPdu) -> Vec<u8>;
}

/// Serial line envelope: server id prefix, CRC16 trailer
#[derive(Debug, Clone, Copy, Default)]
pub struct RtuFraming;

impl Framing for RtuFraming {
    type Header = ();

    const NAME: &'static str = "RTU";
    const PDU_OFFSET: usize = 1;

    fn decode<'a>(&self, frame: &'a [u8]) -> Result<RequestFrame<'a, ()>, DropReason> {
        if frame.len() < RTU_MIN_FRAME_LEN {
            return Err(DropReason::TooShort {
                len: frame.len(),
                min: RTU_MIN_FRAME_LEN,
            });
        }
        if frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(DropReason::TooLong {
                len: frame.len(),
                max: MAX_RTU_FRAME_SIZE,
            });
        }

        let (body, trailer) = frame.split_at(frame.len() - CRC_LEN);
        let received = u16::from_le_bytes([trailer[0], trailer[1]]);
        let calculated = crc16(body);
        if received != calculated {
            return Err(DropReason::CrcMismatch {
                received,
                calculated,
            });
        }

        Ok(RequestFrame {
            header: (),
            server_id: body[0],
            pdu: &body[1..],
        })
    }

    fn encode(&self, _header: &(), server_id: SlaveId, pdu: &ModbusPdu) -> Vec<u8> {
        let mut frame = Vec::with_capacity(1 + pdu.len() + CRC_LEN);
        frame.push(server_id);
        frame.extend_from_slice(pdu.as_slice());
        let crc = crc16_bytes(&frame);
        frame.extend_from_slice(&crc);
        frame
    }
}

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier, echoed on the response
    pub transaction_id: u16,
    /// Protocol identifier (0 for Modbus), not checked on receive
    pub protocol_id: u16,
    /// Byte count of unit id + PDU
    pub length: u16,
    /// Unit identifier (server id)
    pub unit_id: SlaveId,
}

impl MbapHeader {
    /// Parse the first seven bytes of `frame`
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let h = frame.get(..MBAP_HEADER_LEN)?;
        Some(Self {
            transaction_id: u16::from_be_bytes([h[0], h[1]]),
            protocol_id: u16::from_be_bytes([h[2], h[3]]),
            length: u16::from_be_bytes([h[4], h[5]]),
            unit_id: h[6],
        })
    }

    /// Header for a response carrying `pdu_len` PDU bytes
    pub fn for_response(transaction_id: u16, unit_id: SlaveId, pdu_len: usize) -> Self {
        Self {
            transaction_id,
            protocol_id: 0,
            length: (pdu_len + 1) as u16,
            unit_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; MBAP_HEADER_LEN] {
        let t = self.transaction_id.to_be_bytes();
        let p = self.protocol_id.to_be_bytes();
        let l = self.length.to_be_bytes();
        [t[0], t[1], p[0], p[1], l[0], l[1], self.unit_id]
    }
}

/// Socket envelope: 7-byte MBAP header, no CRC
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFraming;

impl Framing for TcpFraming {
    type Header = MbapHeader;

    const NAME: &'static str = "TCP";
    const PDU_OFFSET: usize = MBAP_HEADER_LEN;

    fn decode<'a>(&self, frame: &'a [u8]) -> Result<RequestFrame<'a, MbapHeader>, DropReason> {
        if frame.len() < TCP_MIN_FRAME_LEN {
            return Err(DropReason::TooShort {
                len: frame.len(),
                min: TCP_MIN_FRAME_LEN,
            });
        }
        let header = MbapHeader::parse(frame).ok_or(DropReason::TooShort {
            len: frame.len(),
            min: TCP_MIN_FRAME_LEN,
        })?;

        // length covers unit id + function code + payload
        let end = MBAP_HEADER_LEN - 1 + header.length as usize;
        if header.length < 2 || end > frame.len() {
            return Err(DropReason::LengthMismatch {
                length: header.length,
                available: frame.len(),
            });
        }

        Ok(RequestFrame {
            header,
            server_id: header.unit_id,
            pdu: &frame[MBAP_HEADER_LEN..end],
        })
    }

    fn encode(&self, header: &MbapHeader, server_id: SlaveId, pdu: &ModbusPdu) -> Vec<u8> {
        let response = MbapHeader::for_response(header.transaction_id, server_id, pdu.len());
        let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + pdu.len());
        frame.extend_from_slice(&response.to_bytes());
        frame.extend_from_slice(pdu.as_slice());
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_crc16_reference_frame() {
        // Worked example from the Modbus serial line guide
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03];
        assert_eq!(crc16(&frame), 0x8776);
        assert_eq!(crc16_bytes(&frame), [0x76, 0x87]);
    }

    #[test]
    fn test_unpack_bits_stops_at_count() {
        let bits = unpack_bits(&[0xCD, 0xFF], 10).unwrap();
        assert_eq!(
            bits,
            vec![true, false, true, true, false, false, true, true, true, true]
        );
    }

    #[test]
    fn test_unpack_bits_too_short() {
        assert_eq!(
            unpack_bits(&[0xFF], 9),
            Err(ModbusException::IllegalDataValue)
        );
        assert_eq!(unpack_bits(&[], 0), Ok(vec![]));
    }

    #[test]
    fn test_registers() {
        assert_eq!(pack_registers(&[0x1234, 0x002A]), vec![0x12, 0x34, 0x00, 0x2A]);
        assert_eq!(unpack_registers(&[0x12, 0x34, 0x56], 1), Ok(vec![0x1234]));
        assert_eq!(
            unpack_registers(&[0x12, 0x34, 0x56], 2),
            Err(ModbusException::IllegalDataValue)
        );
    }

    #[test]
    fn test_rtu_decode() {
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87];
        let request = RtuFraming.decode(&frame).unwrap();
        assert_eq!(request.server_id, 0x11);
        assert_eq!(request.pdu, &[0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn test_rtu_decode_rejects_bad_crc_and_short_frames() {
        let frame = [0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x00, 0x00];
        assert_eq!(
            RtuFraming.decode(&frame),
            Err(DropReason::CrcMismatch {
                received: 0x0000,
                calculated: 0x8776
            })
        );
        assert!(matches!(
            RtuFraming.decode(&frame[..7]),
            Err(DropReason::TooShort { len: 7, min: 8 })
        ));
    }

    #[test]
    fn test_rtu_decode_rejects_oversized_frame() {
        // valid CRC, but one byte past the serial line limit
        let mut frame = vec![0x11, 0x10];
        frame.resize(MAX_RTU_FRAME_SIZE - 1, 0x00);
        let crc = crc16_bytes(&frame);
        frame.extend_from_slice(&crc);
        assert_eq!(
            RtuFraming.decode(&frame),
            Err(DropReason::TooLong {
                len: MAX_RTU_FRAME_SIZE + 1,
                max: MAX_RTU_FRAME_SIZE
            })
        );

        frame.truncate(MAX_RTU_FRAME_SIZE - CRC_LEN);
        let crc = crc16_bytes(&frame);
        frame.extend_from_slice(&crc);
        assert!(RtuFraming.decode(&frame).is_ok());
    }

    #[test]
    fn test_rtu_encode_appends_crc() {
        let pdu = ModbusPdu::from_slice(&[0x03, 0x00, 0x6B, 0x00, 0x03]).unwrap();
        assert_eq!(
            RtuFraming.encode(&(), 0x11, &pdu),
            vec![0x11, 0x03, 0x00, 0x6B, 0x00, 0x03, 0x76, 0x87]
        );
    }

    #[test]
    fn test_tcp_decode() {
        let frame = [
            0x00, 0x2A, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0xC8, 0x00, 0x05,
        ];
        let request = TcpFraming.decode(&frame).unwrap();
        assert_eq!(request.header.transaction_id, 0x002A);
        assert_eq!(request.server_id, 0x01);
        assert_eq!(request.pdu, &[0x03, 0x00, 0xC8, 0x00, 0x05]);
    }

    #[test]
    fn test_tcp_decode_ignores_trailing_bytes() {
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x02, 0x01, 0x2B, 0xEE, 0xEE];
        let request = TcpFraming.decode(&frame).unwrap();
        assert_eq!(request.pdu, &[0x2B]);
    }

    #[test]
    fn test_tcp_decode_length_mismatch() {
        // claims 6 bytes after the length field but only 5 follow
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00];
        assert!(matches!(
            TcpFraming.decode(&frame),
            Err(DropReason::LengthMismatch { length: 6, .. })
        ));
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01, 0x03];
        assert!(matches!(
            TcpFraming.decode(&frame),
            Err(DropReason::LengthMismatch { length: 1, .. })
        ));
    }

    #[test]
    fn test_tcp_decode_too_short() {
        // header plus nothing: no function code
        let frame = [0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01];
        assert_eq!(
            TcpFraming.decode(&frame),
            Err(DropReason::TooShort { len: 7, min: 8 })
        );
        assert_eq!(
            TcpFraming.decode(&[]),
            Err(DropReason::TooShort { len: 0, min: 8 })
        );
    }

    #[test]
    fn test_tcp_decode_function_code_only() {
        // length 2 covers unit id and function code, nothing else
        let frame = [0x00, 0x07, 0x00, 0x00, 0x00, 0x02, 0x01, 0x03];
        let request = TcpFraming.decode(&frame).unwrap();
        assert_eq!(request.header.length, 2);
        assert_eq!(request.server_id, 0x01);
        assert_eq!(request.pdu, &[0x03]);
    }

    #[test]
    fn test_tcp_encode_echoes_transaction() {
        let header = MbapHeader {
            transaction_id: 0xBEEF,
            protocol_id: 0,
            length: 6,
            unit_id: 1,
        };
        let pdu = ModbusPdu::from_slice(&[0x83, 0x02]).unwrap();
        assert_eq!(
            TcpFraming.encode(&header, 1, &pdu),
            vec![0xBE, 0xEF, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02]
        );
    }

    proptest! {
        #[test]
        fn prop_bits_survive_packing(values in proptest::collection::vec(any::<bool>(), 0..2000)) {
            let packed = pack_bits(&values);
            prop_assert_eq!(packed.len(), values.len().div_ceil(8));
            prop_assert_eq!(unpack_bits(&packed, values.len()).unwrap(), values);
        }
    }
}
