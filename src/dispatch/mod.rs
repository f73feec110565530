//! Per-opcode message dispatcher
//!
//! The [`Dispatcher`] owns the [`StateStore`] and is its only writer. Each
//! datagram is decoded into a [`Message`], applied to state, and answered
//! with zero or more [`Outbound`] datagrams:
//!
//! - cloud-origin (downlink) messages are forwarded verbatim to the device's
//!   peer;
//! - device-origin messages with `response == false` are acknowledged to the
//!   sender with the same opcode and `response == true`;
//! - a SET reply matching an outstanding command wakes its waiter and is not
//!   answered;
//! - anything the dispatcher cannot fully account for is recorded as an
//!   [`UnknownMessageRecord`] and left unanswered.

mod boost;
mod message;

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};

use crate::codec::{DOWNLINK_SEQUENCE, Direction, Frame, Opcode, SetAttribute, Wrapper, hexdump};
use crate::persistence::{
    self, OutsideTemperatureRecord, Persistence, TemperatureRecord, UnknownMessageRecord,
};
use crate::rendezvous::{CommandReply, Rendezvous, UNUSED_CSEQ};
use crate::state::{StateStore, tenths_to_celsius};
use crate::{GatewayError, Result};

pub use boost::BoostTimers;
pub use message::{Decoded, Header, Message, RoomReport, STATUS_ROOM_LEN};

/// Where an outbound datagram should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Back to the peer the triggering datagram came from
    Sender,
    /// To the peer currently bound to a device
    Device(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub destination: Destination,
    pub datagram: Bytes,
}

/// Result of dispatching one datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    /// Message name used for tracing
    pub name: String,
    pub device_id: Option<u32>,
    pub outbound: Vec<Outbound>,
}

impl Dispatched {
    fn handled(name: String, device_id: Option<u32>) -> Self {
        Self { name, device_id, outbound: Vec::new() }
    }
}

/// Result of shadowing a relayed datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub name: String,
    pub device_id: Option<u32>,
    /// The datagram answers a command issued by this gateway
    pub local_reply: bool,
}

pub struct Dispatcher {
    state: StateStore,
    rendezvous: Arc<Rendezvous>,
    persistence: Arc<dyn Persistence>,
    boosts: BoostTimers,
}

impl Dispatcher {
    pub fn new(rendezvous: Arc<Rendezvous>, persistence: Arc<dyn Persistence>) -> Self {
        Self { state: StateStore::new(), rendezvous, persistence, boosts: BoostTimers::new() }
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    pub fn rendezvous(&self) -> &Arc<Rendezvous> {
        &self.rendezvous
    }

    /// Socket address for `destination`.
    pub fn resolve(&self, destination: Destination, sender: Option<SocketAddr>) -> Result<SocketAddr> {
        match destination {
            Destination::Sender => {
                sender.ok_or_else(|| GatewayError::invariant("reply has no sender to return to"))
            }
            Destination::Device(device_id) => {
                self.state.peer_of(device_id).ok_or(GatewayError::NoPeer { device_id })
            }
        }
    }

    /// Decode and handle a datagram addressed to the gateway.
    ///
    /// Frames that do not decode are recorded and returned as errors; every
    /// other anomaly is recorded and treated as handled.
    pub async fn dispatch(
        &mut self,
        datagram: &[u8],
        sender: SocketAddr,
        direction: Direction,
    ) -> Result<Dispatched> {
        self.process(datagram, sender, direction, Utc::now()).await
    }

    /// Shadow a datagram that is being relayed: state is updated and replies
    /// are discarded.
    pub async fn observe(
        &mut self,
        datagram: &[u8],
        sender: SocketAddr,
        direction: Direction,
    ) -> Result<Observation> {
        let local_reply = self.is_local_reply(datagram);
        let dispatched = self.process(datagram, sender, direction, Utc::now()).await?;
        if !dispatched.outbound.is_empty() {
            trace!("Suppressed {} shadow replies to {}", dispatched.outbound.len(), dispatched.name);
        }
        Ok(Observation { name: dispatched.name, device_id: dispatched.device_id, local_reply })
    }

    fn is_local_reply(&self, datagram: &[u8]) -> bool {
        let Ok(frame) = Frame::decode(datagram) else {
            return false;
        };
        let Ok(wrapper) = Wrapper::decode(&frame.payload, Direction::Uplink) else {
            return false;
        };
        let Ok(header) = Header::peek(&wrapper.payload) else {
            return false;
        };
        wrapper.response
            && header.cseq != UNUSED_CSEQ
            && self.rendezvous.is_waiting(header.device_id, header.cseq)
    }

    /// Build a `SET_<attribute>` command for a device.
    pub fn command(
        &mut self,
        device_id: u32,
        room: u32,
        attribute: SetAttribute,
        value: u32,
        cseq: u8,
    ) -> Outbound {
        if cseq != UNUSED_CSEQ {
            self.state.device_mut(device_id).pending_sequence = Some(cseq);
        }
        let header = Header { cseq, reserved1: 0, reserved2: 0, device_id };
        let payload = Message::Set { attribute, room, value }.encode(&header);
        let wrapper = Wrapper::downlink(Opcode::Set(attribute), payload, false, true);
        debug!("Command {} room {:#010x} value {} to {:#010x}", wrapper.msg_type, room, value, device_id);
        Outbound {
            destination: Destination::Device(device_id),
            datagram: Frame::new(DOWNLINK_SEQUENCE, wrapper.encode()).encode(),
        }
    }

    /// Clear an expired boost and tell the device.
    pub fn expire_boost(&mut self, device_id: u32, room: u32) -> Outbound {
        info!("Boost expired for {:#010x}/{:#010x}", device_id, room);
        self.state.room_mut(device_id, room).boost_expiry = None;
        self.boosts.cancel(device_id, room);
        self.command(device_id, room, SetAttribute::Boost, 0, UNUSED_CSEQ)
    }

    /// Handle a fired boost timer. A boost whose expiry lies beyond the
    /// timer's maximum delay is re-armed instead of cleared.
    pub fn boost_timer_fired(&mut self, device_id: u32, room: u32) -> Option<Outbound> {
        let now = Utc::now();
        let pending = self.state.room(device_id, room).and_then(|state| state.boost_expiry);
        match pending {
            Some(expiry) if expiry > now + chrono::Duration::seconds(1) => {
                self.boosts.arm(device_id, room, expiry, now);
                None
            }
            _ => Some(self.expire_boost(device_id, room)),
        }
    }

    /// Wait for the next boost timer. Resolves to `None` when none is armed.
    pub async fn next_boost_expiry(&mut self) -> Option<(u32, u32)> {
        self.boosts.next_expired().await
    }

    pub fn has_boosts(&self) -> bool {
        !self.boosts.is_empty()
    }

    async fn process(
        &mut self,
        datagram: &[u8],
        sender: SocketAddr,
        direction: Direction,
        now: DateTime<Utc>,
    ) -> Result<Dispatched> {
        trace!("From {} {} bytes: {}", sender, datagram.len(), hexdump(datagram));

        let frame = match Frame::decode(datagram) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("Undecodable frame from {}: {}", sender, err);
                self.record_unknown(sender, "UNDECODABLE", None, datagram, Bytes::new(), None, now)
                    .await;
                return Err(err);
            }
        };

        let wrapper = match Wrapper::decode(&frame.payload, direction) {
            Ok(wrapper) => wrapper,
            Err(err) => {
                warn!("Undecodable wrapper from {}: {}", sender, err);
                let opcode = frame.payload.first().copied();
                self.record_unknown(sender, "UNDECODABLE", opcode, datagram, frame.payload.clone(), None, now)
                    .await;
                return Err(err);
            }
        };

        let opcode = wrapper.msg_type;
        let name = opcode.to_string();
        debug!("{:?} seq={} {}", direction, frame.sequence, wrapper);

        let decoded = match Message::decode(opcode, &wrapper.payload) {
            Ok(decoded) => decoded,
            Err(err) => {
                warn!("Incomplete {} from {}: {}", name, sender, err);
                self.record_unknown(sender, opcode.name(), Some(opcode.value()), datagram, wrapper.payload.clone(), None, now)
                    .await;
                return Ok(Dispatched::handled(name, None));
            }
        };

        let header = decoded.header;
        let device_id = header.device_id;
        self.state.device_mut(device_id).touch(now);
        if !wrapper.downlink && self.state.bind_peer(device_id, sender) {
            info!("Device {:#010x} is at {}", device_id, sender);
        }

        if let Message::Unknown { .. } = decoded.message {
            warn!("Unhandled message {} from {} len={}", name, sender, wrapper.payload.len());
            self.record_unknown(sender, opcode.name(), Some(opcode.value()), datagram, wrapper.payload.clone(), None, now)
                .await;
            return Ok(Dispatched::handled(name, Some(device_id)));
        }

        if !decoded.is_complete() {
            warn!(
                "Incomplete read of {}: {} of {} bytes undecoded",
                name,
                decoded.tail.len(),
                wrapper.payload.len()
            );
            self.record_unknown(
                sender,
                opcode.name(),
                Some(opcode.value()),
                datagram,
                wrapper.payload.clone(),
                Some(decoded.tail.clone()),
                now,
            )
            .await;
            return Ok(Dispatched::handled(name, Some(device_id)));
        }

        let outbound = self.apply(datagram, &wrapper, &decoded, now).await;
        Ok(Dispatched { name, device_id: Some(device_id), outbound })
    }

    async fn apply(
        &mut self,
        datagram: &[u8],
        wrapper: &Wrapper,
        decoded: &Decoded,
        now: DateTime<Utc>,
    ) -> Vec<Outbound> {
        let header = decoded.header;
        let device_id = header.device_id;

        match &decoded.message {
            Message::Ping { reserved } => {
                check_ping(&header, *reserved);
                if wrapper.response {
                    return Vec::new();
                }
                let reply = Wrapper::downlink(Opcode::Ping, wrapper.payload.clone(), false, false);
                return vec![to_sender(reply)];
            }
            Message::Status { last_seen, rooms } => {
                let mut samples = Vec::with_capacity(rooms.len());
                let device = self.state.device_mut(device_id);
                device.reported_last_seen = Some(*last_seen);
                device.boiler_on = rooms.iter().any(RoomReport::boiler_on);
                device.dhw_mode = rooms.iter().any(RoomReport::dhw);
                for report in rooms {
                    let room = device.room_mut(report.room);
                    room.temp = Some(tenths_to_celsius(report.temp));
                    room.set_temp = Some(tenths_to_celsius(report.set_temp));
                    room.heating = report.heating();
                    room.mode = Some(report.mode);
                    room.last_seen = Some(now);
                    samples.push(TemperatureRecord {
                        timestamp: now,
                        device_id,
                        room: report.room,
                        temp: tenths_to_celsius(report.temp),
                        set_temp: tenths_to_celsius(report.set_temp),
                        heating: report.heating(),
                    });
                }
                for sample in samples {
                    persistence::report("log_temperature", self.persistence.log_temperature(sample).await);
                }
            }
            Message::Program { room, day, program } => {
                let state = self.state.room_mut(device_id, *room);
                state.last_seen = Some(now);
                if !state.set_day(*day, *program) {
                    warn!("PROGRAM for {:#010x} has day {} out of range", room, day);
                }
            }
            Message::ProgEnd { room, .. } | Message::GetProg { room, .. } => {
                self.state.room_mut(device_id, *room).last_seen = Some(now);
            }
            Message::DeviceTime { .. } | Message::Refresh => {}
            Message::SwVersion { version } => {
                if let Some(version) = version {
                    info!("Device {:#010x} firmware {}", device_id, version);
                    self.state.device_mut(device_id).firmware_version = Some(version.clone());
                }
            }
            Message::OutsideTemp { temp } => {
                let record = OutsideTemperatureRecord { timestamp: now, device_id, temp: tenths_to_celsius(*temp) };
                persistence::report(
                    "log_outside_temperature",
                    self.persistence.log_outside_temperature(record).await,
                );
            }
            Message::Set { attribute, room, value } => {
                let state = self.state.room_mut(device_id, *room);
                state.apply(*attribute, *value);
                state.last_seen = Some(now);
                if *attribute == SetAttribute::Boost {
                    match state.boost_expiry.filter(|expiry| *expiry > now) {
                        Some(expiry) => self.boosts.arm(device_id, *room, expiry, now),
                        None => {
                            self.boosts.cancel(device_id, *room);
                        }
                    }
                }

                if wrapper.response && header.cseq != UNUSED_CSEQ {
                    let reply = CommandReply { opcode: wrapper.msg_type, room: *room, value: *value };
                    if self.rendezvous.signal_sequence(device_id, header.cseq, reply) {
                        let device = self.state.device_mut(device_id);
                        if device.pending_sequence == Some(header.cseq) {
                            device.pending_sequence = None;
                        }
                        return Vec::new();
                    }
                }
            }
            Message::Unknown { .. } => return Vec::new(),
        }

        if wrapper.downlink {
            return vec![Outbound {
                destination: Destination::Device(device_id),
                datagram: Bytes::copy_from_slice(datagram),
            }];
        }

        if wrapper.response {
            return Vec::new();
        }

        let payload = match &decoded.message {
            Message::Status { .. } => {
                Message::Status { last_seen: unix_seconds(now), rooms: Vec::new() }.encode(&header)
            }
            Message::DeviceTime { reserved, .. } => {
                Message::DeviceTime { time: unix_seconds(now), reserved: *reserved }.encode(&header)
            }
            _ => wrapper.payload.clone(),
        };
        let ack = Wrapper::downlink(wrapper.msg_type, payload, true, wrapper.write);
        vec![to_sender(ack)]
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_unknown(
        &self,
        peer: SocketAddr,
        opcode_name: &str,
        opcode_value: Option<u8>,
        raw_frame: &[u8],
        payload: Bytes,
        undecoded_tail: Option<Bytes>,
        now: DateTime<Utc>,
    ) {
        let record = UnknownMessageRecord {
            timestamp: now,
            peer,
            opcode_name: opcode_name.to_string(),
            opcode_value,
            raw_frame: Bytes::copy_from_slice(raw_frame),
            payload,
            undecoded_tail,
        };
        persistence::report("log_unknown_message", self.persistence.log_unknown_message(record).await);
    }
}

fn to_sender(wrapper: Wrapper) -> Outbound {
    Outbound {
        destination: Destination::Sender,
        datagram: Frame::new(DOWNLINK_SEQUENCE, wrapper.encode()).encode(),
    }
}

fn unix_seconds(now: DateTime<Utc>) -> u32 {
    now.timestamp().clamp(0, u32::MAX as i64) as u32
}

fn check_ping(header: &Header, reserved: u16) {
    if header.cseq != UNUSED_CSEQ {
        warn!("PING: unexpected cseq={:#x}", header.cseq);
    }
    if header.reserved1 != 0x02 {
        warn!("PING: unexpected reserved1={:#x}", header.reserved1);
    }
    // 4 while in sync, 0 otherwise
    if header.reserved2 != 0x04 && header.reserved2 != 0 {
        warn!("PING: unexpected reserved2={:#x}", header.reserved2);
    }
    if reserved != 1 {
        warn!("PING: unexpected trailing field={:#x}", reserved);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryStore;
    use crate::test_utils::*;
    use std::time::Duration;

    fn dispatcher() -> (Dispatcher, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (Dispatcher::new(Rendezvous::new(), store.clone()), store)
    }

    fn peer() -> SocketAddr {
        "192.168.1.50:6199".parse().unwrap()
    }

    fn reply_wrapper(outbound: &Outbound) -> Wrapper {
        let frame = Frame::decode(&outbound.datagram).unwrap();
        assert_eq!(frame.sequence, DOWNLINK_SEQUENCE);
        Wrapper::decode(&frame.payload, Direction::Downlink).unwrap()
    }

    #[tokio::test]
    async fn status_updates_state_and_acks_sender() {
        let (mut dispatcher, store) = dispatcher();
        let datagram = status_datagram(205, 210, 0x03);

        let dispatched = dispatcher.dispatch(&datagram, peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatched.name, "STATUS");
        assert_eq!(dispatched.device_id, Some(CAPTURED_DEVICE));

        let device = dispatcher.state().device(CAPTURED_DEVICE).unwrap();
        assert!(device.last_seen.is_some());
        assert_eq!(device.peer, Some(peer()));
        assert_eq!(device.reported_last_seen, Some(1_700_000_000));
        assert!(device.boiler_on);
        let room = device.room(CAPTURED_ROOM).unwrap();
        assert_eq!(room.temp, Some(20.5));
        assert_eq!(room.set_temp, Some(21.0));
        assert!(room.heating);

        assert_eq!(store.latest_temperature(CAPTURED_DEVICE, CAPTURED_ROOM).unwrap().temp, 20.5);

        assert_eq!(dispatched.outbound.len(), 1);
        assert_eq!(dispatched.outbound[0].destination, Destination::Sender);
        let ack = reply_wrapper(&dispatched.outbound[0]);
        assert_eq!(ack.msg_type, Opcode::Status);
        assert!(ack.response && ack.downlink);
        let Message::Status { last_seen, rooms } = Message::decode(ack.msg_type, &ack.payload).unwrap().message else {
            panic!("expected STATUS ack");
        };
        assert!(last_seen > 1_700_000_000);
        assert!(rooms.is_empty());
    }

    #[tokio::test]
    async fn ping_is_answered_with_ping() {
        let (mut dispatcher, _) = dispatcher();
        let dispatched = dispatcher.dispatch(&ping_datagram(), peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatched.name, "PING");
        let reply = reply_wrapper(&dispatched.outbound[0]);
        assert_eq!(reply.msg_type, Opcode::Ping);
        assert!(!reply.response);
        assert_eq!(dispatcher.resolve(dispatched.outbound[0].destination, Some(peer())).unwrap(), peer());
    }

    #[tokio::test]
    async fn cloud_program_is_forwarded_to_device_peer() {
        let (mut dispatcher, _) = dispatcher();
        let cloud: SocketAddr = "104.46.56.16:6199".parse().unwrap();

        let dispatched = dispatcher.dispatch(CAPTURED_PROGRAM, cloud, Direction::Downlink).await.unwrap();
        assert_eq!(dispatched.name, "PROGRAM");
        assert_eq!(dispatched.outbound.len(), 1);
        let outbound = &dispatched.outbound[0];
        assert_eq!(outbound.destination, Destination::Device(CAPTURED_DEVICE));
        assert_eq!(outbound.datagram.as_ref(), CAPTURED_PROGRAM);

        let room = dispatcher.state().room(CAPTURED_DEVICE, CAPTURED_ROOM).unwrap();
        assert_eq!(room.days[6].unwrap()[9], 0x21);

        // the cloud is never bound as the device peer
        assert!(matches!(
            dispatcher.resolve(outbound.destination, Some(cloud)),
            Err(GatewayError::NoPeer { device_id: CAPTURED_DEVICE })
        ));
        dispatcher.dispatch(&ping_datagram(), peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatcher.resolve(outbound.destination, Some(cloud)).unwrap(), peer());
    }

    #[tokio::test]
    async fn unknown_opcode_is_recorded_without_reply() {
        let (mut dispatcher, store) = dispatcher();
        let datagram = uplink_datagram(
            Opcode::Unknown(0x77),
            false,
            false,
            inner_payload(0xFF, 0, 0, CAPTURED_DEVICE, &[0xDE, 0xAD]),
        );

        let dispatched = dispatcher.dispatch(&datagram, peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatched.name, "UNKNOWN(0x77)");
        assert!(dispatched.outbound.is_empty());

        let unknown = store.unknown_messages();
        assert_eq!(unknown.len(), 1);
        assert_eq!(unknown[0].opcode_value, Some(0x77));
        assert_eq!(unknown[0].raw_frame, datagram);
    }

    #[tokio::test]
    async fn incomplete_read_keeps_tail() {
        let (mut dispatcher, store) = dispatcher();
        let datagram = uplink_datagram(
            Opcode::Ping,
            false,
            false,
            inner_payload(0xFF, 0x02, 0, CAPTURED_DEVICE, &[0x01, 0x00, 0x99]),
        );

        let dispatched = dispatcher.dispatch(&datagram, peer(), Direction::Uplink).await.unwrap();
        assert!(dispatched.outbound.is_empty());
        let unknown = store.unknown_messages();
        assert_eq!(unknown[0].undecoded_tail.as_deref(), Some(&[0x99][..]));
    }

    #[tokio::test]
    async fn garbage_is_recorded_and_reported() {
        let (mut dispatcher, store) = dispatcher();
        let err = dispatcher.dispatch(&[0x01, 0x02, 0x03], peer(), Direction::Uplink).await.unwrap_err();
        assert!(err.is_anomaly());
        assert_eq!(store.unknown_messages()[0].opcode_name, "UNDECODABLE");
    }

    #[tokio::test]
    async fn set_reply_wakes_waiter() {
        let (mut dispatcher, _) = dispatcher();
        let rendezvous = dispatcher.rendezvous().clone();
        dispatcher.dispatch(&ping_datagram(), peer(), Direction::Uplink).await.unwrap();

        let cseq = rendezvous.next_sequence(CAPTURED_DEVICE);
        let waiter = rendezvous.register(CAPTURED_DEVICE, cseq).unwrap();
        let command = dispatcher.command(CAPTURED_DEVICE, CAPTURED_ROOM, SetAttribute::T1, 215, cseq);
        assert_eq!(dispatcher.resolve(command.destination, None).unwrap(), peer());
        assert_eq!(dispatcher.state().device(CAPTURED_DEVICE).unwrap().pending_sequence, Some(cseq));

        let mut body = CAPTURED_ROOM.to_le_bytes().to_vec();
        body.extend_from_slice(&215u16.to_le_bytes());
        let reply = uplink_datagram(
            Opcode::Set(SetAttribute::T1),
            true,
            true,
            inner_payload(cseq, 0, 0, CAPTURED_DEVICE, &body),
        );

        let observation = dispatcher.observe(&reply, peer(), Direction::Uplink).await.unwrap();
        assert!(observation.local_reply);
        assert_eq!(waiter.wait(Duration::from_millis(100)).await.unwrap().value, 215);

        let device = dispatcher.state().device(CAPTURED_DEVICE).unwrap();
        assert_eq!(device.pending_sequence, None);
        assert_eq!(device.room(CAPTURED_ROOM).unwrap().t1, Some(21.5));
    }

    #[tokio::test]
    async fn boost_arms_and_expires() {
        let (mut dispatcher, _) = dispatcher();
        let expiry = (Utc::now().timestamp() + 3600) as u32;
        let mut body = CAPTURED_ROOM.to_le_bytes().to_vec();
        body.extend_from_slice(&expiry.to_le_bytes());
        let datagram = uplink_datagram(
            Opcode::Set(SetAttribute::Boost),
            false,
            true,
            inner_payload(0xFF, 0, 0, CAPTURED_DEVICE, &body),
        );

        let dispatched = dispatcher.dispatch(&datagram, peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatched.name, "SET_BOOST");
        assert!(dispatcher.has_boosts());

        let outbound = dispatcher.expire_boost(CAPTURED_DEVICE, CAPTURED_ROOM);
        assert_eq!(outbound.destination, Destination::Device(CAPTURED_DEVICE));
        let wrapper = reply_wrapper(&outbound);
        let decoded = Message::decode(wrapper.msg_type, &wrapper.payload).unwrap();
        assert_eq!(
            decoded.message,
            Message::Set { attribute: SetAttribute::Boost, room: CAPTURED_ROOM, value: 0 }
        );
        assert!(dispatcher.state().room(CAPTURED_DEVICE, CAPTURED_ROOM).unwrap().boost_expiry.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn far_boost_expiry_survives_timer() {
        let (mut dispatcher, _) = dispatcher();
        let mut body = CAPTURED_ROOM.to_le_bytes().to_vec();
        body.extend_from_slice(&u32::MAX.to_le_bytes());
        let datagram = uplink_datagram(
            Opcode::Set(SetAttribute::Boost),
            false,
            true,
            inner_payload(0xFF, 0, 0, CAPTURED_DEVICE, &body),
        );

        let dispatched = dispatcher.dispatch(&datagram, peer(), Direction::Uplink).await.unwrap();
        assert_eq!(dispatched.name, "SET_BOOST");
        assert!(dispatcher.has_boosts());

        assert!(dispatcher.boost_timer_fired(CAPTURED_DEVICE, CAPTURED_ROOM).is_none());
        assert!(dispatcher.has_boosts());
        assert!(dispatcher.state().room(CAPTURED_DEVICE, CAPTURED_ROOM).unwrap().boost_expiry.is_some());

        dispatcher.state.room_mut(CAPTURED_DEVICE, CAPTURED_ROOM).boost_expiry = None;
        assert!(dispatcher.boost_timer_fired(CAPTURED_DEVICE, CAPTURED_ROOM).is_some());
        assert!(!dispatcher.has_boosts());
    }
}
