//! Inner message envelope carried in a frame payload
//!
//! ```text
//! ┌───────────┬──────────┬───────────────┬──────────────────────────────┐
//! │ type: u8  │ flags:u8 │ body_len: u16 │ common header (8) + body     │
//! └───────────┴──────────┴───────────────┴──────────────────────────────┘
//! ```
//!
//! `body_len` counts the bytes after the 8-byte common header
//! (cseq, two reserved fields, device id).

use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

use super::{Opcode, Unpacker};
use crate::{GatewayError, Result};

/// Wrapper header size in bytes.
pub const WRAPPER_HEADER_LEN: usize = 4;

/// Common message header size (cseq, reserved1, reserved2, device id).
pub const COMMON_HEADER_LEN: usize = 8;

const FLAG_WRITE: u8 = 0x01;
const FLAG_RESPONSE: u8 = 0x02;
const FLAG_DOWNLINK: u8 = 0x04;
/// Set while the device holds cloud sync.
const FLAG_CLOUD_SYNC: u8 = 0x08;

/// Direction of travel of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Device to cloud
    Uplink,
    /// Cloud to device
    Downlink,
}

/// Decoded inner envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wrapper {
    pub msg_type: Opcode,
    pub downlink: bool,
    pub response: bool,
    pub write: bool,
    pub cloud_sync_lost: bool,
    /// Common header followed by the message body
    pub payload: Bytes,
}

impl Wrapper {
    /// Build a cloud-to-device wrapper.
    pub fn downlink(msg_type: Opcode, payload: impl Into<Bytes>, response: bool, write: bool) -> Self {
        Self {
            msg_type,
            downlink: true,
            response,
            write,
            cloud_sync_lost: false,
            payload: payload.into(),
        }
    }

    pub fn direction(&self) -> Direction {
        if self.downlink { Direction::Downlink } else { Direction::Uplink }
    }

    /// Raw flags byte.
    pub fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.write {
            flags |= FLAG_WRITE;
        }
        if self.response {
            flags |= FLAG_RESPONSE;
        }
        if self.downlink {
            flags |= FLAG_DOWNLINK;
        }
        if !self.cloud_sync_lost {
            flags |= FLAG_CLOUD_SYNC;
        }
        flags
    }

    /// Decode a frame payload expected to travel in `direction`.
    ///
    /// A downlink bit that disagrees with `direction` is logged and kept as
    /// decoded.
    pub fn decode(data: &[u8], direction: Direction) -> Result<Self> {
        let mut unpack = Unpacker::with_context(data, "wrapper");
        let msg_type = Opcode::from(unpack.u8()?);
        let flags = unpack.u8()?;
        let body_len = unpack.u16()? as usize;
        let payload = unpack.rest();

        if payload.len() != body_len + COMMON_HEADER_LEN {
            return Err(GatewayError::decode(
                "wrapper",
                format!(
                    "{} declares {} body bytes but carries {}",
                    msg_type,
                    body_len,
                    payload.len().saturating_sub(COMMON_HEADER_LEN)
                ),
            ));
        }

        let wrapper = Self {
            msg_type,
            downlink: flags & FLAG_DOWNLINK != 0,
            response: flags & FLAG_RESPONSE != 0,
            write: flags & FLAG_WRITE != 0,
            cloud_sync_lost: flags & FLAG_CLOUD_SYNC == 0,
            payload: Bytes::copy_from_slice(payload),
        };

        if wrapper.direction() != direction {
            debug!(
                "{} decoded as {:?} but flags {:#04x} say {:?}",
                msg_type,
                direction,
                flags,
                wrapper.direction()
            );
        }

        Ok(wrapper)
    }

    /// Encode into a frame payload.
    pub fn encode(&self) -> Bytes {
        let body_len = self.payload.len().saturating_sub(COMMON_HEADER_LEN);
        let mut buf = BytesMut::with_capacity(WRAPPER_HEADER_LEN + self.payload.len());
        buf.put_u8(self.msg_type.value());
        buf.put_u8(self.flags());
        buf.put_u16_le(body_len as u16);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

impl std::fmt::Display for Wrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "msgType={} synclost={} downlink={} response={} write={} flags={:#x} len={}",
            self.msg_type,
            self.cloud_sync_lost as u8,
            self.downlink as u8,
            self.response as u8,
            self.write as u8,
            self.flags(),
            self.payload.len()
        )
    }
}
