//! Opcode catalogue for the thermostat protocol

use std::fmt;

/// Width of the trailing value carried by a `SET_<attribute>` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueWidth {
    U8,
    U16,
    U32,
}

impl ValueWidth {
    /// Size in bytes on the wire.
    pub fn size(self) -> usize {
        match self {
            ValueWidth::U8 => 1,
            ValueWidth::U16 => 2,
            ValueWidth::U32 => 4,
        }
    }
}

/// Room attribute written by the `SET_<attribute>` opcode family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SetAttribute {
    /// Frost protection set-point (tenths of °C)
    T3,
    /// Economy set-point (tenths of °C)
    T2,
    /// Comfort set-point (tenths of °C)
    T1,
    MaxSetpoint,
    MinSetpoint,
    Units,
    Season,
    SensorInfluence,
    Mode,
    Curve,
    Advance,
    /// Boost expiry as unix seconds, zero clears the boost
    Boost,
}

impl SetAttribute {
    pub const ALL: [SetAttribute; 12] = [
        SetAttribute::T3,
        SetAttribute::T2,
        SetAttribute::T1,
        SetAttribute::MaxSetpoint,
        SetAttribute::MinSetpoint,
        SetAttribute::Units,
        SetAttribute::Season,
        SetAttribute::SensorInfluence,
        SetAttribute::Mode,
        SetAttribute::Curve,
        SetAttribute::Advance,
        SetAttribute::Boost,
    ];

    /// Width of the value that follows the room id.
    pub fn width(self) -> ValueWidth {
        match self {
            SetAttribute::T3
            | SetAttribute::T2
            | SetAttribute::T1
            | SetAttribute::MaxSetpoint
            | SetAttribute::MinSetpoint => ValueWidth::U16,
            SetAttribute::Units
            | SetAttribute::Season
            | SetAttribute::SensorInfluence
            | SetAttribute::Mode
            | SetAttribute::Curve
            | SetAttribute::Advance => ValueWidth::U8,
            SetAttribute::Boost => ValueWidth::U32,
        }
    }

    fn code(self) -> u8 {
        match self {
            SetAttribute::T3 => 0x0B,
            SetAttribute::T2 => 0x0C,
            SetAttribute::T1 => 0x0D,
            SetAttribute::MaxSetpoint => 0x0E,
            SetAttribute::MinSetpoint => 0x0F,
            SetAttribute::Units => 0x10,
            SetAttribute::Season => 0x11,
            SetAttribute::SensorInfluence => 0x12,
            SetAttribute::Mode => 0x13,
            SetAttribute::Curve => 0x14,
            SetAttribute::Advance => 0x16,
            SetAttribute::Boost => 0x17,
        }
    }

    fn name(self) -> &'static str {
        match self {
            SetAttribute::T3 => "SET_T3",
            SetAttribute::T2 => "SET_T2",
            SetAttribute::T1 => "SET_T1",
            SetAttribute::MaxSetpoint => "SET_MAX_SETPOINT",
            SetAttribute::MinSetpoint => "SET_MIN_SETPOINT",
            SetAttribute::Units => "SET_UNITS",
            SetAttribute::Season => "SET_SEASON",
            SetAttribute::SensorInfluence => "SET_SENSOR_INFLUENCE",
            SetAttribute::Mode => "SET_MODE",
            SetAttribute::Curve => "SET_CURVE",
            SetAttribute::Advance => "SET_ADVANCE",
            SetAttribute::Boost => "SET_BOOST",
        }
    }
}

/// Protocol message type.
///
/// The catalogue is open: values the gateway does not know are kept as
/// [`Opcode::Unknown`] so they survive a decode/encode cycle unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Program,
    GetProg,
    Status,
    Ping,
    Refresh,
    ProgEnd,
    DeviceTime,
    SwVersion,
    OutsideTemp,
    Set(SetAttribute),
    Unknown(u8),
}

impl Opcode {
    /// Wire value of this opcode.
    pub fn value(self) -> u8 {
        match self {
            Opcode::Program => 0x0A,
            Opcode::GetProg => 0x1B,
            Opcode::Status => 0x24,
            Opcode::Ping => 0x25,
            Opcode::Refresh => 0x29,
            Opcode::ProgEnd => 0x2A,
            Opcode::DeviceTime => 0x2B,
            Opcode::SwVersion => 0x2C,
            Opcode::OutsideTemp => 0x2E,
            Opcode::Set(attribute) => attribute.code(),
            Opcode::Unknown(value) => value,
        }
    }

    /// Protocol name, `UNKNOWN` for values outside the catalogue.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Program => "PROGRAM",
            Opcode::GetProg => "GET_PROG",
            Opcode::Status => "STATUS",
            Opcode::Ping => "PING",
            Opcode::Refresh => "REFRESH",
            Opcode::ProgEnd => "PROG_END",
            Opcode::DeviceTime => "DEVICE_TIME",
            Opcode::SwVersion => "SWVERSION",
            Opcode::OutsideTemp => "OUTSIDE_TEMP",
            Opcode::Set(attribute) => attribute.name(),
            Opcode::Unknown(_) => "UNKNOWN",
        }
    }

    /// Trailing value width for the `SET_<attribute>` family.
    pub fn set_width(self) -> Option<ValueWidth> {
        match self {
            Opcode::Set(attribute) => Some(attribute.width()),
            _ => None,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, Opcode::Unknown(_))
    }
}

impl From<u8> for Opcode {
    fn from(value: u8) -> Self {
        match value {
            0x0A => Opcode::Program,
            0x1B => Opcode::GetProg,
            0x24 => Opcode::Status,
            0x25 => Opcode::Ping,
            0x29 => Opcode::Refresh,
            0x2A => Opcode::ProgEnd,
            0x2B => Opcode::DeviceTime,
            0x2C => Opcode::SwVersion,
            0x2E => Opcode::OutsideTemp,
            other => SetAttribute::ALL
                .iter()
                .copied()
                .find(|attribute| attribute.code() == other)
                .map(Opcode::Set)
                .unwrap_or(Opcode::Unknown(other)),
        }
    }
}

impl From<Opcode> for u8 {
    fn from(opcode: Opcode) -> Self {
        opcode.value()
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Opcode::Unknown(value) => write!(f, "UNKNOWN({:#04x})", value),
            known => f.write_str(known.name()),
        }
    }
}
