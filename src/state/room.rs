//! Per-room thermostat record

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::codec::SetAttribute;

/// Daily program: one byte per hour slot.
pub type DayProgram = [u8; 24];

/// Convert a wire temperature in tenths of °C.
pub fn tenths_to_celsius(raw: i16) -> f32 {
    raw as f32 / 10.0
}

/// State of one room (thermostat) of a device.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RoomState {
    pub room: u32,
    /// Measured temperature (°C)
    pub temp: Option<f32>,
    /// Active set-point (°C)
    pub set_temp: Option<f32>,
    /// Comfort set-point (°C)
    pub t1: Option<f32>,
    /// Economy set-point (°C)
    pub t2: Option<f32>,
    /// Frost set-point (°C)
    pub t3: Option<f32>,
    pub heating: bool,
    pub min_setpoint: Option<f32>,
    pub max_setpoint: Option<f32>,
    pub mode: Option<u8>,
    pub units: Option<u8>,
    pub season: Option<u8>,
    pub sensor_influence: Option<u8>,
    pub curve: Option<u8>,
    pub advance: Option<u8>,
    /// Weekly schedule indexed by day, `None` until the day's program is seen
    pub days: [Option<DayProgram>; 7],
    pub boost_expiry: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl RoomState {
    pub fn new(room: u32) -> Self {
        Self { room, ..Default::default() }
    }

    /// Apply a `SET_<attribute>` value as carried on the wire.
    pub fn apply(&mut self, attribute: SetAttribute, value: u32) {
        let temp = || tenths_to_celsius(value as u16 as i16);
        match attribute {
            SetAttribute::T1 => self.t1 = Some(temp()),
            SetAttribute::T2 => self.t2 = Some(temp()),
            SetAttribute::T3 => self.t3 = Some(temp()),
            SetAttribute::MaxSetpoint => self.max_setpoint = Some(temp()),
            SetAttribute::MinSetpoint => self.min_setpoint = Some(temp()),
            SetAttribute::Units => self.units = Some(value as u8),
            SetAttribute::Season => self.season = Some(value as u8),
            SetAttribute::SensorInfluence => self.sensor_influence = Some(value as u8),
            SetAttribute::Mode => self.mode = Some(value as u8),
            SetAttribute::Curve => self.curve = Some(value as u8),
            SetAttribute::Advance => self.advance = Some(value as u8),
            SetAttribute::Boost => {
                self.boost_expiry = match value {
                    0 => None,
                    secs => DateTime::from_timestamp(secs as i64, 0),
                }
            }
        }
    }

    /// Store a day's program. Days outside 0..7 are ignored.
    pub fn set_day(&mut self, day: u16, program: DayProgram) -> bool {
        match self.days.get_mut(day as usize) {
            Some(slot) => {
                *slot = Some(program);
                true
            }
            None => false,
        }
    }

    /// Whether a boost is armed and has not yet expired at `now`.
    pub fn boost_active(&self, now: DateTime<Utc>) -> bool {
        self.boost_expiry.is_some_and(|expiry| expiry > now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_setpoints_in_tenths() {
        let mut room = RoomState::new(0x0443_27A6);
        room.apply(SetAttribute::T1, 215);
        room.apply(SetAttribute::T3, 50);
        room.apply(SetAttribute::MinSetpoint, (-50i16) as u16 as u32);
        assert_eq!(room.t1, Some(21.5));
        assert_eq!(room.t3, Some(5.0));
        assert_eq!(room.min_setpoint, Some(-5.0));
    }

    #[test]
    fn boost_zero_clears() {
        let mut room = RoomState::new(1);
        room.apply(SetAttribute::Boost, 2_000_000_000);
        assert!(room.boost_expiry.is_some());
        assert!(room.boost_active(DateTime::from_timestamp(1_999_999_999, 0).unwrap()));
        room.apply(SetAttribute::Boost, 0);
        assert!(room.boost_expiry.is_none());
    }

    #[test]
    fn day_index_is_bounded() {
        let mut room = RoomState::new(1);
        assert!(room.set_day(6, [0x11; 24]));
        assert!(!room.set_day(7, [0x11; 24]));
        assert_eq!(room.days[6], Some([0x11; 24]));
    }
}
