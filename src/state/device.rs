//! Per-device record

use std::collections::BTreeMap;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::RoomState;

/// State of one thermostat gateway device, keyed by its 32-bit id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceState {
    pub device_id: u32,
    /// UDP peer that last spoke for this device
    pub peer: Option<SocketAddr>,
    pub last_seen: Option<DateTime<Utc>>,
    /// Last-seen value as reported inside STATUS messages
    pub reported_last_seen: Option<u32>,
    pub firmware_version: Option<String>,
    pub boiler_on: bool,
    pub dhw_mode: bool,
    /// Command sequence of a locally issued command awaiting its reply
    pub pending_sequence: Option<u8>,
    pub rooms: BTreeMap<u32, RoomState>,
}

impl DeviceState {
    pub fn new(device_id: u32) -> Self {
        Self { device_id, ..Default::default() }
    }

    /// Room record, created on first reference.
    pub fn room_mut(&mut self, room: u32) -> &mut RoomState {
        self.rooms.entry(room).or_insert_with(|| RoomState::new(room))
    }

    pub fn room(&self, room: u32) -> Option<&RoomState> {
        self.rooms.get(&room)
    }

    /// Mark the device as seen now.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.last_seen = Some(now);
    }
}
