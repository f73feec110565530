//! Outer transport frame
//!
//! ```text
//! ┌────────┬──────────┬──────────┬───────────┬──────────┬────────┐
//! │ FA D4  │ len: u16 │ seq: u32 │ payload   │ crc: u16 │ 2D DF  │
//! │ magic  │ LE       │ LE       │ len bytes │ LE       │ end    │
//! └────────┴──────────┴──────────┴───────────┴──────────┴────────┘
//! ```
//!
//! The checksum is CRC-16/XMODEM over the payload bytes.

use bytes::{BufMut, Bytes, BytesMut};
use crc::{CRC_16_XMODEM, Crc};

use super::Unpacker;
use crate::{GatewayError, Result};

/// First two bytes of every frame.
pub const FRAME_MAGIC: [u8; 2] = [0xFA, 0xD4];

/// Last two bytes of every frame.
pub const FRAME_END: [u8; 2] = [0x2D, 0xDF];

/// Bytes surrounding the payload: magic, length, sequence, checksum, end marker.
pub const FRAME_OVERHEAD: usize = 12;

/// Sequence number the cloud uses on its downlink frames.
pub const DOWNLINK_SEQUENCE: u32 = 0xFFFF_FFFF;

const XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Decoded transport frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(sequence: u32, payload: impl Into<Bytes>) -> Self {
        Self { sequence, payload: payload.into() }
    }

    /// Integrity trailer checksum for a payload.
    pub fn checksum(payload: &[u8]) -> u16 {
        XMODEM.checksum(payload)
    }

    /// Decode a datagram, rejecting frames with a bad magic, length, end
    /// marker or checksum.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < FRAME_OVERHEAD {
            return Err(GatewayError::Truncated {
                context: "frame".to_string(),
                offset: 0,
                needed: FRAME_OVERHEAD,
                available: data.len(),
            });
        }

        let mut unpack = Unpacker::with_context(data, "frame");
        let magic = unpack.array::<2>()?;
        if magic != FRAME_MAGIC {
            return Err(GatewayError::decode(
                "frame",
                format!("bad magic {:02X} {:02X}", magic[0], magic[1]),
            ));
        }

        let length = unpack.u16()? as usize;
        if data.len() != length + FRAME_OVERHEAD {
            return Err(GatewayError::decode(
                "frame",
                format!(
                    "declared payload length {} does not match datagram size {}",
                    length,
                    data.len()
                ),
            ));
        }

        let sequence = unpack.u32()?;
        let payload = unpack.bytes(length)?;
        let found = unpack.u16()?;
        let end = unpack.array::<2>()?;
        if end != FRAME_END {
            return Err(GatewayError::decode(
                "frame",
                format!("bad end marker {:02X} {:02X}", end[0], end[1]),
            ));
        }

        let expected = Self::checksum(payload);
        if expected != found {
            return Err(GatewayError::Checksum { expected, found });
        }

        Ok(Self { sequence, payload: Bytes::copy_from_slice(payload) })
    }

    /// Encode the frame, computing the checksum trailer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.payload.len() + FRAME_OVERHEAD);
        buf.put_slice(&FRAME_MAGIC);
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_u32_le(self.sequence);
        buf.put_slice(&self.payload);
        buf.put_u16_le(Self::checksum(&self.payload));
        buf.put_slice(&FRAME_END);
        buf.freeze()
    }
}
