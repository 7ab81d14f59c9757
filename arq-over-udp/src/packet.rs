//! Wire-format definitions for DATA and ACK packets.
//!
//! Every ARQ datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout.
//! - Framing a [`Packet`] into a byte buffer ready for transmission, with the
//!   session's integrity code filled in.
//! - Parsing a raw byte slice back into a [`Packet`], classifying bad input as
//!   [`PacketError::Malformed`] or [`PacketError::Corrupt`].
//! - Recognising the out-of-band control datagrams ([`Control`]) that are not
//!   part of the sequence-number space or the integrity scheme.
//!
//! No I/O happens here — this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//! DATA
//!  0       1               5               7               9
//! +-------+---------------+---------------+---------------+------------
//! | 0x01  |    seq (u32)  |  length (u16) | integrity u16 | payload ...
//! +-------+---------------+---------------+---------------+------------
//!
//! ACK
//!  0       1               5               7
//! +-------+---------------+---------------+
//! | 0x02  |    seq (u32)  | integrity u16 |
//! +-------+---------------+---------------+
//! ```
//!
//! The integrity code covers the whole datagram with its own field zeroed.
//!
//! Decode checks run in a fixed order: too short for any header → malformed;
//! unknown kind byte → corrupt; integrity mismatch → corrupt; declared length
//! disagreeing with the trailing bytes → malformed.  Because the kind values
//! differ in two bits and the integrity check runs before the length check,
//! every single-bit flip is reported as corrupt.

use thiserror::Error;

use crate::integrity::{Integrity, IntegrityKind};

/// Kind byte of a DATA packet.
pub const KIND_DATA: u8 = 0x01;
/// Kind byte of an ACK packet.
pub const KIND_ACK: u8 = 0x02;

/// Byte length of the DATA header on the wire.
pub const DATA_HEADER_LEN: usize = 9;
/// Byte length of an ACK packet on the wire.
pub const ACK_LEN: usize = 7;

/// Largest payload the 16-bit length field can describe.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;

/// End-of-transfer marker, sent once by the sender after full acknowledgment.
pub const TERMINAL_MARKER: &[u8] = b"END";
/// Application-level completion signal, sent once by the receiver.
pub const COMPLETION_MARKER: &[u8] = b"DONE";

const OFF_KIND: usize = 0;
const OFF_SEQ: usize = 1;
const OFF_DATA_LEN: usize = 5;
const OFF_DATA_CODE: usize = 7;
const OFF_ACK_CODE: usize = 5;

/// A decoded ARQ packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// One payload unit.  A zero-length payload is legal.
    Data { seq: u32, payload: Vec<u8> },
    /// Acknowledgment; cumulative or selective depending on the discipline.
    Ack { seq: u32 },
}

impl Packet {
    /// Sequence number carried by either variant.
    pub fn seq(&self) -> u32 {
        match self {
            Packet::Data { seq, .. } | Packet::Ack { seq } => *seq,
        }
    }
}

/// Ways a datagram can fail structural validation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Malformation {
    #[error("{len} bytes is shorter than any header")]
    TooShort { len: usize },
    #[error("length field says {declared} payload bytes, {actual} present")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("{extra} unexpected bytes after ACK header")]
    TrailingBytes { extra: usize },
}

/// Ways a datagram can fail the integrity check.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Corruption {
    #[error("unknown kind byte {0:#04x}")]
    UnknownKind(u8),
    #[error("declared {declared:#06x}, computed {computed:#06x}")]
    Mismatch { declared: u16, computed: u16 },
}

/// Errors that can arise when framing or parsing a packet.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    #[error("malformed packet: {0}")]
    Malformed(#[from] Malformation),
    #[error("corrupt packet: {0}")]
    Corrupt(#[from] Corruption),
    #[error("payload of {0} bytes does not fit the 16-bit length field")]
    Oversized(usize),
    #[error("{0} packets exceed the 32-bit sequence space")]
    TooManyPackets(usize),
}

impl PacketError {
    pub fn is_corrupt(&self) -> bool {
        matches!(self, PacketError::Corrupt(_))
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, PacketError::Malformed(_))
    }
}

/// Frames and parses packets with one integrity scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketCodec {
    integrity: IntegrityKind,
}

impl PacketCodec {
    pub fn new(integrity: IntegrityKind) -> Self {
        Self { integrity }
    }

    pub fn integrity(&self) -> IntegrityKind {
        self.integrity
    }

    /// Serialise `packet` into a newly allocated byte vector.
    ///
    /// Fails only when a DATA payload exceeds [`MAX_PAYLOAD`].
    pub fn encode(&self, packet: &Packet) -> Result<Vec<u8>, PacketError> {
        let (mut buf, code_at) = match packet {
            Packet::Data { seq, payload } => {
                let len = u16::try_from(payload.len())
                    .map_err(|_| PacketError::Oversized(payload.len()))?;
                let mut buf = vec![0u8; DATA_HEADER_LEN + payload.len()];
                buf[OFF_KIND] = KIND_DATA;
                buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
                buf[OFF_DATA_LEN..OFF_DATA_LEN + 2].copy_from_slice(&len.to_be_bytes());
                buf[DATA_HEADER_LEN..].copy_from_slice(payload);
                (buf, OFF_DATA_CODE)
            }
            Packet::Ack { seq } => {
                let mut buf = vec![0u8; ACK_LEN];
                buf[OFF_KIND] = KIND_ACK;
                buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
                (buf, OFF_ACK_CODE)
            }
        };

        // Integrity field is still zero here.
        let code = self.integrity.compute(&buf);
        buf[code_at..code_at + 2].copy_from_slice(&code.to_be_bytes());
        Ok(buf)
    }

    /// Frame a DATA packet.
    pub fn encode_data(&self, seq: u32, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
        self.encode(&Packet::Data {
            seq,
            payload: payload.to_vec(),
        })
    }

    /// Frame an ACK packet.  Cannot fail.
    pub fn encode_ack(&self, seq: u32) -> Vec<u8> {
        let mut buf = vec![0u8; ACK_LEN];
        buf[OFF_KIND] = KIND_ACK;
        buf[OFF_SEQ..OFF_SEQ + 4].copy_from_slice(&seq.to_be_bytes());
        let code = self.integrity.compute(&buf);
        buf[OFF_ACK_CODE..OFF_ACK_CODE + 2].copy_from_slice(&code.to_be_bytes());
        buf
    }

    /// Parse a [`Packet`] from a raw byte slice.
    pub fn decode(&self, buf: &[u8]) -> Result<Packet, PacketError> {
        if buf.len() < ACK_LEN {
            return Err(Malformation::TooShort { len: buf.len() }.into());
        }

        let code_at = match buf[OFF_KIND] {
            KIND_DATA if buf.len() >= DATA_HEADER_LEN => OFF_DATA_CODE,
            KIND_DATA => return Err(Malformation::TooShort { len: buf.len() }.into()),
            KIND_ACK => OFF_ACK_CODE,
            other => return Err(Corruption::UnknownKind(other).into()),
        };

        let declared = read_u16(buf, code_at);
        let mut scratch = buf.to_vec();
        scratch[code_at..code_at + 2].fill(0);
        let computed = self.integrity.compute(&scratch);
        if computed != declared {
            return Err(Corruption::Mismatch { declared, computed }.into());
        }

        let seq = u32::from_be_bytes([
            buf[OFF_SEQ],
            buf[OFF_SEQ + 1],
            buf[OFF_SEQ + 2],
            buf[OFF_SEQ + 3],
        ]);

        if buf[OFF_KIND] == KIND_ACK {
            if buf.len() != ACK_LEN {
                return Err(Malformation::TrailingBytes {
                    extra: buf.len() - ACK_LEN,
                }
                .into());
            }
            return Ok(Packet::Ack { seq });
        }

        let declared_len = usize::from(read_u16(buf, OFF_DATA_LEN));
        let actual = buf.len() - DATA_HEADER_LEN;
        if declared_len != actual {
            return Err(Malformation::LengthMismatch {
                declared: declared_len,
                actual,
            }
            .into());
        }

        Ok(Packet::Data {
            seq,
            payload: buf[DATA_HEADER_LEN..].to_vec(),
        })
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

// ---------------------------------------------------------------------------
// Control datagrams
// ---------------------------------------------------------------------------

/// Out-of-band datagrams recognised by equality rather than decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// [`TERMINAL_MARKER`].
    Terminal,
    /// [`COMPLETION_MARKER`].
    Complete,
    /// Decimal ASCII total byte count announced before the first DATA packet.
    Bootstrap(u64),
}

impl Control {
    /// Classify `buf`, returning `None` for anything that should go to the codec.
    pub fn parse(buf: &[u8]) -> Option<Control> {
        if buf == TERMINAL_MARKER {
            return Some(Control::Terminal);
        }
        if buf == COMPLETION_MARKER {
            return Some(Control::Complete);
        }
        if !buf.is_empty() && buf.len() <= 20 && buf.iter().all(u8::is_ascii_digit) {
            return std::str::from_utf8(buf)
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Control::Bootstrap);
        }
        None
    }

    /// Bytes to put on the wire.
    pub fn to_bytes(self) -> Vec<u8> {
        match self {
            Control::Terminal => TERMINAL_MARKER.to_vec(),
            Control::Complete => COMPLETION_MARKER.to_vec(),
            Control::Bootstrap(total) => total.to_string().into_bytes(),
        }
    }
}
