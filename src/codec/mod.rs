//! Binary codec for the thermostat UDP protocol.
//!
//! A datagram is a [`Frame`] whose payload is a [`Wrapper`]; the wrapper's
//! inner payload starts with the 8-byte common header and is read field by
//! field with an [`Unpacker`].
//!
//! ```rust
//! use shadowgate::codec::{Direction, Frame, Opcode, Wrapper};
//!
//! let header = [0xFF, 0x02, 0x04, 0x00, 0xAA, 0xF2, 0x8D, 0x23, 0x01, 0x00];
//! let wrapper = Wrapper::downlink(Opcode::Ping, header.to_vec(), false, false);
//! let datagram = Frame::new(0xFFFF_FFFF, wrapper.encode()).encode();
//!
//! let frame = Frame::decode(&datagram)?;
//! let decoded = Wrapper::decode(&frame.payload, Direction::Downlink)?;
//! assert_eq!(decoded.msg_type, Opcode::Ping);
//! # Ok::<(), shadowgate::GatewayError>(())
//! ```

mod frame;
mod opcode;
mod unpacker;
mod wrapper;

pub use frame::{DOWNLINK_SEQUENCE, FRAME_END, FRAME_MAGIC, FRAME_OVERHEAD, Frame};
pub use opcode::{Opcode, SetAttribute, ValueWidth};
pub use unpacker::{Packer, Unpacker};
pub use wrapper::{COMMON_HEADER_LEN, Direction, WRAPPER_HEADER_LEN, Wrapper};

/// Render bytes as space separated upper-case hex, `FA D4 2A 00`.
pub fn hexdump(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len() * 3);
    for (i, byte) in data.iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push_str(&format!("{:02X}", byte));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hexdump_format() {
        assert_eq!(hexdump(&[0xFA, 0xD4, 0x2A, 0x00]), "FA D4 2A 00");
        assert_eq!(hexdump(&[]), "");
        assert_eq!(hexdump(&[0x58]), "58");
    }
}
