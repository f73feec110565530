//! In-memory device and room state.
//!
//! The store is owned by the dispatcher, which is the only writer. Readers
//! receive immutable snapshots through the gateway handle.

mod device;
mod room;

use std::collections::BTreeMap;
use std::net::SocketAddr;

use serde::Serialize;

pub use device::DeviceState;
pub use room::{DayProgram, RoomState, tenths_to_celsius};

/// Process-lifetime cache of every device the gateway has heard about.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateStore {
    devices: BTreeMap<u32, DeviceState>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Device record, created on first reference.
    pub fn device_mut(&mut self, device_id: u32) -> &mut DeviceState {
        self.devices.entry(device_id).or_insert_with(|| DeviceState::new(device_id))
    }

    pub fn device(&self, device_id: u32) -> Option<&DeviceState> {
        self.devices.get(&device_id)
    }

    pub fn room(&self, device_id: u32, room: u32) -> Option<&RoomState> {
        self.device(device_id).and_then(|device| device.room(room))
    }

    pub fn room_mut(&mut self, device_id: u32, room: u32) -> &mut RoomState {
        self.device_mut(device_id).room_mut(room)
    }

    /// Peer address recorded as owning `device_id`.
    pub fn peer_of(&self, device_id: u32) -> Option<SocketAddr> {
        self.device(device_id).and_then(|device| device.peer)
    }

    /// Record `peer` as the address of `device_id`. Returns true if it changed.
    pub fn bind_peer(&mut self, device_id: u32, peer: SocketAddr) -> bool {
        let device = self.device_mut(device_id);
        if device.peer == Some(peer) {
            return false;
        }
        device.peer = Some(peer);
        true
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceState> {
        self.devices.values()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_created_on_first_reference() {
        let mut store = StateStore::new();
        assert!(store.device(0x238D_F2AA).is_none());

        store.room_mut(0x238D_F2AA, 0x0443_27A6).heating = true;
        assert_eq!(store.len(), 1);
        assert!(store.room(0x238D_F2AA, 0x0443_27A6).unwrap().heating);
    }

    #[test]
    fn bind_peer_reports_changes() {
        let mut store = StateStore::new();
        let peer: SocketAddr = "192.168.1.50:6199".parse().unwrap();
        assert!(store.bind_peer(7, peer));
        assert!(!store.bind_peer(7, peer));
        assert_eq!(store.peer_of(7), Some(peer));
        assert_eq!(store.peer_of(8), None);
    }
}
