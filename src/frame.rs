//! Wire frame codec for the Infinity bus protocol.
//!
//! Frames on the bus are laid out as:
//!
//!   `<dest u16><src u16><len u8><reserved [u8;2]><op u8><payload [u8;len]><crc u16>`
//!
//! with all multi-byte integers little-endian. The CRC-16 (polynomial 0x8005,
//! reflected, zero init/final — "ARC") covers the header and payload and is the
//! only integrity signal the protocol carries: there is no sync byte, so the bus
//! engine relies on checksum failures to realign (see [`crate::bus`]).

use std::fmt;

use crc::{Crc, CRC_16_ARC};

use crate::logutil::hex_snippet;

/// Fixed header size in bytes.
pub const HEADER_LEN: usize = 8;
/// Bytes of framing around the payload: header plus trailing checksum.
/// Also the minimum size of any decodable frame (zero-length payload).
pub const FRAME_OVERHEAD: usize = HEADER_LEN + 2;

/// Checksum configuration shared by encode and decode.
const CHECKSUM: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// Compute the frame checksum over header + payload bytes.
pub fn checksum(bytes: &[u8]) -> u16 {
    CHECKSUM.checksum(bytes)
}

/// Errors produced while decoding a candidate frame.
///
/// Both `EmptyFrame` and `ChecksumMismatch` are recoverable by construction:
/// the bus engine answers them with a one-byte resync advance and never
/// surfaces them to callers.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Every candidate byte was zero: idle-line padding, not corruption.
    #[error("no frame content (all zero bytes)")]
    EmptyFrame,
    /// The wire checksum does not match the checksum computed over the
    /// header + payload bytes.
    #[error("frame checksum mismatch: wire {wire:#06x}, computed {computed:#06x}")]
    ChecksumMismatch { wire: u16, computed: u16 },
    /// Buffer is smaller than the minimum frame size. The engine never slices
    /// one this short; guards direct callers of [`Frame::decode`].
    #[error("buffer too short for a frame: {0} bytes (minimum {FRAME_OVERHEAD})")]
    Truncated(usize),
}

/// Operation code carried in the last header byte.
///
/// The table of known values comes from bus captures; codes outside it are
/// valid traffic we simply can't name yet, so they decode to [`OpCode::Unknown`]
/// and round-trip unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Short acknowledge.
    Ack02,
    /// Long acknowledge (carries response data).
    Ack06,
    ReadTableBlock,
    WriteTableBlock,
    ChangeTableName,
    /// Negative acknowledge.
    Nack,
    AlarmPacket,
    ReadObjectData,
    ReadVariable,
    /// Write (force) a variable.
    WriteVariable,
    AutoVariableReport,
    ReadList,
    /// Code not in the known table; raw byte preserved.
    Unknown(u8),
}

impl OpCode {
    /// Raw wire byte for this operation.
    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Ack02 => 0x02,
            OpCode::Ack06 => 0x06,
            OpCode::ReadTableBlock => 0x0b,
            OpCode::WriteTableBlock => 0x0c,
            OpCode::ChangeTableName => 0x10,
            OpCode::Nack => 0x15,
            OpCode::AlarmPacket => 0x1e,
            OpCode::ReadObjectData => 0x22,
            OpCode::ReadVariable => 0x62,
            OpCode::WriteVariable => 0x63,
            OpCode::AutoVariableReport => 0x64,
            OpCode::ReadList => 0x75,
            OpCode::Unknown(raw) => raw,
        }
    }
}

impl From<u8> for OpCode {
    fn from(raw: u8) -> Self {
        match raw {
            0x02 => OpCode::Ack02,
            0x06 => OpCode::Ack06,
            0x0b => OpCode::ReadTableBlock,
            0x0c => OpCode::WriteTableBlock,
            0x10 => OpCode::ChangeTableName,
            0x15 => OpCode::Nack,
            0x1e => OpCode::AlarmPacket,
            0x22 => OpCode::ReadObjectData,
            0x62 => OpCode::ReadVariable,
            0x63 => OpCode::WriteVariable,
            0x64 => OpCode::AutoVariableReport,
            0x75 => OpCode::ReadList,
            other => OpCode::Unknown(other),
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::Ack02 => "ACK02",
            OpCode::Ack06 => "ACK06",
            OpCode::ReadTableBlock => "READ_TABLE_BLOCK",
            OpCode::WriteTableBlock => "WRITE_TABLE_BLOCK",
            OpCode::ChangeTableName => "CHANGE_TABLE_NAME",
            OpCode::Nack => "NACK",
            OpCode::AlarmPacket => "ALARM",
            OpCode::ReadObjectData => "READ_OBJECT_DATA",
            OpCode::ReadVariable => "READ_VARIABLE",
            OpCode::WriteVariable => "WRITE_VARIABLE",
            OpCode::AutoVariableReport => "AUTO_VARIABLE_REPORT",
            OpCode::ReadList => "READ_LIST",
            OpCode::Unknown(raw) => return write!(f, "UNKNOWN({raw:#04x})"),
        };
        f.write_str(name)
    }
}

/// Fixed 8-byte frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub destination: u16,
    pub source: u16,
    /// Payload byte count. Recomputed from the payload on encode; the stored
    /// value is whatever the wire carried.
    pub length: u8,
    /// Two bytes of unknown semantics. Stored verbatim on decode, normalized
    /// to zero on encode.
    pub reserved: [u8; 2],
    pub operation: OpCode,
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#06x} -> {:#06x} {} ({} bytes)",
            self.source,
            self.destination,
            self.operation,
            self.length
        )
    }
}

/// One complete bus message: header, payload, checksum. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    payload: Vec<u8>,
    checksum: u16,
}

impl Frame {
    /// Build an outbound frame. Length and checksum are computed here so the
    /// frame is wire-consistent from the start.
    pub fn new(destination: u16, source: u16, operation: OpCode, payload: Vec<u8>) -> Self {
        let header = Header {
            destination,
            source,
            length: payload.len() as u8,
            reserved: [0, 0],
            operation,
        };
        let mut frame = Frame {
            header,
            payload,
            checksum: 0,
        };
        frame.checksum = checksum(&frame.header_payload_bytes());
        frame
    }

    /// Build a `READ_TABLE_BLOCK` request for one row of a device's table.
    ///
    /// This is the simplest outbound producer seen on real buses: payload is
    /// the table index followed by the row offset. Unlike the header fields,
    /// captures show the table index big-endian on the wire (table 1 appears
    /// as `00 01`). Correlating the eventual `ACK06` response with this
    /// request is up to the caller.
    pub fn read_table_block(destination: u16, source: u16, table: u16, offset: u8) -> Self {
        let table = table.to_be_bytes();
        Frame::new(
            destination,
            source,
            OpCode::ReadTableBlock,
            vec![table[0], table[1], offset],
        )
    }

    /// Decode one candidate frame from `buf`.
    ///
    /// The caller slices `buf` to exactly the candidate's declared size
    /// (`payload length + 10`); this function decides whether those bytes are
    /// a real frame. The buffer is never mutated.
    pub fn decode(buf: &[u8]) -> Result<Frame, DecodeError> {
        if buf.len() < FRAME_OVERHEAD {
            return Err(DecodeError::Truncated(buf.len()));
        }

        // Idle-line padding: all zeros means "nothing here", not corruption.
        if buf.iter().all(|&b| b == 0) {
            return Err(DecodeError::EmptyFrame);
        }

        let body_len = buf.len() - 2;
        let wire = u16::from_le_bytes([buf[body_len], buf[body_len + 1]]);
        let computed = checksum(&buf[..body_len]);
        if wire != computed {
            return Err(DecodeError::ChecksumMismatch { wire, computed });
        }

        Ok(Frame {
            header: Header {
                destination: u16::from_le_bytes([buf[0], buf[1]]),
                source: u16::from_le_bytes([buf[2], buf[3]]),
                length: buf[4],
                reserved: [buf[5], buf[6]],
                operation: OpCode::from(buf[7]),
            },
            payload: buf[HEADER_LEN..body_len].to_vec(),
            checksum: wire,
        })
    }

    /// Serialize to wire bytes. The length field is recomputed from the
    /// payload and the reserved bytes are written as zero (their on-bus
    /// semantics were never determined, so we don't guess).
    pub fn encode(&self) -> Vec<u8> {
        let mut out = self.header_payload_bytes();
        let crc = checksum(&out);
        out.extend_from_slice(&crc.to_le_bytes());
        out
    }

    /// Payload bytes of this frame.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Checksum as found on (or computed for) the wire.
    pub fn checksum_value(&self) -> u16 {
        self.checksum
    }

    /// Total wire size of this frame in bytes.
    pub fn wire_len(&self) -> usize {
        self.payload.len() + FRAME_OVERHEAD
    }

    fn header_payload_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.header.destination.to_le_bytes());
        out.extend_from_slice(&self.header.source.to_le_bytes());
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&[0, 0]);
        out.push(self.header.operation.as_u8());
        out.extend_from_slice(&self.payload);
        out
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.header, hex_snippet(&self.payload, 32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // CRC-16/ARC check value from the published catalogue.
    #[test]
    fn checksum_known_answer() {
        assert_eq!(checksum(b"123456789"), 0xbb3d);
    }

    #[test]
    fn decode_known_capture_bytes() {
        // READ_TABLE_BLOCK request as it appears on the wire.
        let wire = [
            0x01, 0x00, 0xf1, 0xf1, 0x03, 0x00, 0x00, 0x0b, 0x00, 0x01, 0x01, 0x32, 0x94,
        ];
        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.header.destination, 0x0001);
        assert_eq!(frame.header.source, 0xf1f1);
        assert_eq!(frame.header.operation, OpCode::ReadTableBlock);
        assert_eq!(frame.header.length, 3);
        assert_eq!(frame.payload(), &[0x00, 0x01, 0x01]);
        assert_eq!(frame.checksum_value(), 0x9432);
    }

    #[test]
    fn encode_matches_capture_bytes() {
        let frame = Frame::read_table_block(0x0001, 0xf1f1, 0x0001, 0x01);
        // Table index rides big-endian in the payload, unlike the header.
        assert_eq!(frame.payload(), &[0x00, 0x01, 0x01]);
        assert_eq!(
            frame.encode(),
            vec![0x01, 0x00, 0xf1, 0xf1, 0x03, 0x00, 0x00, 0x0b, 0x00, 0x01, 0x01, 0x32, 0x94]
        );
    }

    #[test]
    fn round_trip_preserves_fields() {
        let frame = Frame::new(0x2001, 0xf1f1, OpCode::WriteVariable, vec![1, 2, 3, 4, 5]);
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded.header.destination, 0x2001);
        assert_eq!(decoded.header.source, 0xf1f1);
        assert_eq!(decoded.header.operation, OpCode::WriteVariable);
        assert_eq!(decoded.header.reserved, [0, 0]);
        assert_eq!(decoded.payload(), frame.payload());
    }

    #[test]
    fn round_trip_empty_payload() {
        let frame = Frame::new(0xf1f1, 0x2001, OpCode::Ack06, Vec::new());
        let wire = frame.encode();
        assert_eq!(wire.len(), FRAME_OVERHEAD);
        let decoded = Frame::decode(&wire).unwrap();
        assert_eq!(decoded.header.length, 0);
        assert!(decoded.payload().is_empty());
    }

    #[test]
    fn length_recomputed_on_encode() {
        // A stale header.length must never survive encoding.
        let mut frame = Frame::new(1, 2, OpCode::Ack02, vec![9, 9]);
        frame.header.length = 200;
        let wire = frame.encode();
        assert_eq!(wire[4], 2);
        assert!(Frame::decode(&wire).is_ok());
    }

    #[test]
    fn all_zero_buffer_is_empty_frame() {
        for len in [10usize, 11, 64, 255 + FRAME_OVERHEAD] {
            assert_eq!(Frame::decode(&vec![0u8; len]), Err(DecodeError::EmptyFrame));
        }
    }

    #[test]
    fn short_buffer_is_truncated() {
        assert_eq!(Frame::decode(&[0xff; 9]), Err(DecodeError::Truncated(9)));
        assert_eq!(Frame::decode(&[]), Err(DecodeError::Truncated(0)));
    }

    #[test]
    fn any_single_bit_flip_fails_checksum() {
        let wire = Frame::new(0x0001, 0xf1f1, OpCode::ReadTableBlock, vec![0, 1, 1]).encode();
        let body_len = wire.len() - 2;
        for byte in 0..body_len {
            for bit in 0..8 {
                let mut corrupt = wire.clone();
                corrupt[byte] ^= 1 << bit;
                match Frame::decode(&corrupt) {
                    Err(DecodeError::ChecksumMismatch { .. }) => {}
                    other => panic!("bit {bit} of byte {byte}: expected mismatch, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn opcode_round_trips_including_unknown() {
        for raw in 0..=255u8 {
            assert_eq!(OpCode::from(raw).as_u8(), raw);
        }
        assert_eq!(OpCode::from(0x0b), OpCode::ReadTableBlock);
        assert_eq!(OpCode::from(0xab), OpCode::Unknown(0xab));
    }

    #[test]
    fn reserved_bytes_preserved_on_decode() {
        let mut wire = Frame::new(1, 2, OpCode::Ack06, vec![7]).encode();
        wire[5] = 0xde;
        wire[6] = 0xad;
        let body_len = wire.len() - 2;
        let crc = checksum(&wire[..body_len]).to_le_bytes();
        wire[body_len] = crc[0];
        wire[body_len + 1] = crc[1];
        let frame = Frame::decode(&wire).unwrap();
        assert_eq!(frame.header.reserved, [0xde, 0xad]);
        // ...and normalized back to zero when re-encoded.
        assert_eq!(&frame.encode()[5..7], &[0, 0]);
    }
}
