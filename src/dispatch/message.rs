//! Typed view of a wrapper's inner payload
//!
//! [`Header`] is the 8-byte prefix every message carries. [`Message`] is one
//! variant per opcode class with an [`Message::Unknown`] arm, so the
//! dispatcher's routing is a single exhaustive match. Reserved fields are
//! kept as read so replies can echo them.

use bytes::Bytes;

use crate::codec::{Opcode, Packer, SetAttribute, Unpacker, ValueWidth};
use crate::state::DayProgram;
use crate::Result;

/// Size of one STATUS room block.
pub const STATUS_ROOM_LEN: usize = 12;

const ROOM_FLAG_HEATING: u8 = 0x01;
const ROOM_FLAG_BOILER: u8 = 0x02;
const ROOM_FLAG_DHW: u8 = 0x04;

/// Common message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Command sequence, `0xFF` when unused
    pub cseq: u8,
    pub reserved1: u8,
    pub reserved2: u16,
    pub device_id: u32,
}

impl Header {
    pub fn read(unpack: &mut Unpacker<'_>) -> Result<Self> {
        Ok(Self {
            cseq: unpack.u8()?,
            reserved1: unpack.u8()?,
            reserved2: unpack.u16()?,
            device_id: unpack.u32()?,
        })
    }

    /// Read the header at the start of an inner payload.
    pub fn peek(payload: &[u8]) -> Result<Self> {
        Self::read(&mut Unpacker::with_context(payload, "header"))
    }

    pub fn write(&self, packer: &mut Packer) {
        packer.u8(self.cseq).u8(self.reserved1).u16(self.reserved2).u32(self.device_id);
    }
}

/// One room block of a STATUS report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoomReport {
    pub room: u32,
    /// Tenths of °C
    pub temp: i16,
    /// Tenths of °C
    pub set_temp: i16,
    pub flags: u8,
    pub mode: u8,
    pub reserved: u16,
}

impl RoomReport {
    fn read(unpack: &mut Unpacker<'_>) -> Result<Self> {
        Ok(Self {
            room: unpack.u32()?,
            temp: unpack.i16()?,
            set_temp: unpack.i16()?,
            flags: unpack.u8()?,
            mode: unpack.u8()?,
            reserved: unpack.u16()?,
        })
    }

    fn write(&self, packer: &mut Packer) {
        packer
            .u32(self.room)
            .i16(self.temp)
            .i16(self.set_temp)
            .u8(self.flags)
            .u8(self.mode)
            .u16(self.reserved);
    }

    pub fn heating(&self) -> bool {
        self.flags & ROOM_FLAG_HEATING != 0
    }

    pub fn boiler_on(&self) -> bool {
        self.flags & ROOM_FLAG_BOILER != 0
    }

    pub fn dhw(&self) -> bool {
        self.flags & ROOM_FLAG_DHW != 0
    }
}

/// Decoded message body.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Status { last_seen: u32, rooms: Vec<RoomReport> },
    Program { room: u32, day: u16, program: DayProgram },
    ProgEnd { room: u32, reserved: u16 },
    /// Unix seconds followed by a field that is echoed untouched
    DeviceTime { time: u32, reserved: u32 },
    GetProg { room: u32, reserved: u32 },
    Ping { reserved: u16 },
    Refresh,
    SwVersion { version: Option<String> },
    /// Tenths of °C
    OutsideTemp { temp: i16 },
    Set { attribute: SetAttribute, room: u32, value: u32 },
    Unknown { opcode: u8 },
}

/// A decoded message and whatever bytes its handler did not consume.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub header: Header,
    pub message: Message,
    pub tail: Bytes,
}

impl Decoded {
    /// True when the handler consumed exactly the declared payload.
    pub fn is_complete(&self) -> bool {
        self.tail.is_empty()
    }
}

impl Message {
    /// Decode an inner payload (common header plus body) for `opcode`.
    ///
    /// Unknown opcodes consume only the header; the rest lands in the tail.
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Decoded> {
        let mut unpack = Unpacker::with_context(payload, opcode.name());
        let header = Header::read(&mut unpack)?;

        let message = match opcode {
            Opcode::Status => {
                let last_seen = unpack.u32()?;
                let count = unpack.remaining() / STATUS_ROOM_LEN;
                let rooms = unpack.repeat(count, RoomReport::read)?;
                Message::Status { last_seen, rooms }
            }
            Opcode::Program => Message::Program {
                room: unpack.u32()?,
                day: unpack.u16()?,
                program: unpack.array::<24>()?,
            },
            Opcode::ProgEnd => Message::ProgEnd { room: unpack.u32()?, reserved: unpack.u16()? },
            Opcode::DeviceTime => Message::DeviceTime { time: unpack.u32()?, reserved: unpack.u32()? },
            Opcode::GetProg => Message::GetProg { room: unpack.u32()?, reserved: unpack.u32()? },
            Opcode::Ping => Message::Ping { reserved: unpack.u16()? },
            Opcode::Refresh => Message::Refresh,
            Opcode::SwVersion => {
                let text = String::from_utf8_lossy(unpack.rest());
                let text = text.trim_matches(char::from(0)).trim();
                Message::SwVersion { version: (!text.is_empty()).then(|| text.to_string()) }
            }
            Opcode::OutsideTemp => Message::OutsideTemp { temp: unpack.i16()? },
            Opcode::Set(attribute) => {
                let room = unpack.u32()?;
                let value = match attribute.width() {
                    ValueWidth::U8 => unpack.u8()? as u32,
                    ValueWidth::U16 => unpack.u16()? as u32,
                    ValueWidth::U32 => unpack.u32()?,
                };
                Message::Set { attribute, room, value }
            }
            Opcode::Unknown(value) => Message::Unknown { opcode: value },
        };

        let tail = Bytes::copy_from_slice(unpack.rest());
        Ok(Decoded { header, message, tail })
    }

    /// Encode header plus body as an inner payload.
    ///
    /// Unknown messages have no body of their own and encode as the header
    /// only.
    pub fn encode(&self, header: &Header) -> Bytes {
        let mut packer = Packer::with_capacity(40);
        header.write(&mut packer);
        match self {
            Message::Status { last_seen, rooms } => {
                packer.u32(*last_seen);
                for room in rooms {
                    room.write(&mut packer);
                }
            }
            Message::Program { room, day, program } => {
                packer.u32(*room).u16(*day).bytes(program);
            }
            Message::ProgEnd { room, reserved } => {
                packer.u32(*room).u16(*reserved);
            }
            Message::DeviceTime { time, reserved } => {
                packer.u32(*time).u32(*reserved);
            }
            Message::GetProg { room, reserved } => {
                packer.u32(*room).u32(*reserved);
            }
            Message::Ping { reserved } => {
                packer.u16(*reserved);
            }
            Message::Refresh | Message::Unknown { .. } => {}
            Message::SwVersion { version } => {
                if let Some(version) = version {
                    packer.bytes(version.as_bytes());
                }
            }
            Message::OutsideTemp { temp } => {
                packer.i16(*temp);
            }
            Message::Set { attribute, room, value } => {
                packer.u32(*room);
                match attribute.width() {
                    ValueWidth::U8 => packer.u8(*value as u8),
                    ValueWidth::U16 => packer.u16(*value as u16),
                    ValueWidth::U32 => packer.u32(*value),
                };
            }
        }
        packer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayError;
    use crate::codec::{Direction, Frame, Wrapper};
    use crate::test_utils::{CAPTURED_DEVICE, CAPTURED_PROG_END, CAPTURED_PROGRAM, CAPTURED_ROOM, status_body};
    use proptest::prelude::*;

    fn captured(data: &[u8]) -> Wrapper {
        let frame = Frame::decode(data).unwrap();
        Wrapper::decode(&frame.payload, Direction::Downlink).unwrap()
    }

    #[test]
    fn captured_program_consumes_exactly() {
        let wrapper = captured(CAPTURED_PROGRAM);
        let decoded = Message::decode(wrapper.msg_type, &wrapper.payload).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.header.device_id, CAPTURED_DEVICE);
        assert_eq!(decoded.header.cseq, 0xFF);
        match decoded.message {
            Message::Program { room, day, program } => {
                assert_eq!(room, CAPTURED_ROOM);
                assert_eq!(day, 6);
                assert_eq!(program[8], 0x11);
                assert_eq!(program[23], 0x00);
            }
            other => panic!("expected PROGRAM, got {other:?}"),
        }
        assert_eq!(decoded.message.encode(&decoded.header), wrapper.payload);
    }

    #[test]
    fn captured_prog_end_consumes_exactly() {
        let wrapper = captured(CAPTURED_PROG_END);
        let decoded = Message::decode(wrapper.msg_type, &wrapper.payload).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.message, Message::ProgEnd { room: CAPTURED_ROOM, reserved: 0 });
    }

    #[test]
    fn status_room_count_follows_length() {
        let mut payload = vec![0xFF, 0x02, 0x00, 0x00, 0xAA, 0xF2, 0x8D, 0x23];
        payload.extend_from_slice(&status_body(1234, &[(1, 205, 210, 0x03), (2, 180, 190, 0x04)]));
        let decoded = Message::decode(Opcode::Status, &payload).unwrap();
        assert!(decoded.is_complete());
        let Message::Status { last_seen, rooms } = decoded.message else {
            panic!("expected STATUS");
        };
        assert_eq!(last_seen, 1234);
        assert_eq!(rooms.len(), 2);
        assert!(rooms[0].heating() && rooms[0].boiler_on() && !rooms[0].dhw());
        assert!(rooms[1].dhw());

        // a partial block is left undecoded
        payload.extend_from_slice(&[0xAB, 0xCD, 0xEF]);
        let decoded = Message::decode(Opcode::Status, &payload).unwrap();
        assert_eq!(decoded.tail.as_ref(), &[0xAB, 0xCD, 0xEF]);
    }

    #[test]
    fn set_width_follows_attribute() {
        let header = [0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00];
        let mut payload = header.to_vec();
        payload.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0xD7, 0x00]);
        let decoded = Message::decode(Opcode::Set(SetAttribute::T1), &payload).unwrap();
        assert!(decoded.is_complete());
        assert_eq!(decoded.message, Message::Set { attribute: SetAttribute::T1, room: 2, value: 215 });

        // the same bytes as SET_MODE leave one byte over
        let decoded = Message::decode(Opcode::Set(SetAttribute::Mode), &payload).unwrap();
        assert_eq!(decoded.tail.len(), 1);

        // and are too short for SET_BOOST
        assert!(matches!(
            Message::decode(Opcode::Set(SetAttribute::Boost), &payload),
            Err(GatewayError::Truncated { .. })
        ));
    }

    #[test]
    fn sw_version_is_optional() {
        let header = [0xFF, 0x00, 0x00, 0x00, 0xAA, 0xF2, 0x8D, 0x23];
        let decoded = Message::decode(Opcode::SwVersion, &header).unwrap();
        assert_eq!(decoded.message, Message::SwVersion { version: None });

        let mut payload = header.to_vec();
        payload.extend_from_slice(b"06549180111");
        let decoded = Message::decode(Opcode::SwVersion, &payload).unwrap();
        assert_eq!(decoded.message, Message::SwVersion { version: Some("06549180111".to_string()) });
    }

    #[test]
    fn unknown_keeps_body_as_tail() {
        let payload = [0x01, 0x00, 0x00, 0x00, 0x07, 0x00, 0x00, 0x00, 0xDE, 0xAD];
        let decoded = Message::decode(Opcode::Unknown(0x77), &payload).unwrap();
        assert_eq!(decoded.message, Message::Unknown { opcode: 0x77 });
        assert_eq!(decoded.tail.as_ref(), &[0xDE, 0xAD]);
    }

    proptest! {
        #[test]
        fn truncated_payloads_never_panic(
            opcode in any::<u8>(),
            payload in prop::collection::vec(any::<u8>(), 0..48),
        ) {
            match Message::decode(Opcode::from(opcode), &payload) {
                Ok(decoded) => prop_assert!(decoded.tail.len() <= payload.len()),
                Err(err) => prop_assert!(err.is_anomaly()),
            }
        }
    }
}
