//! Test utilities: captured traffic and datagram builders
//!
//! The captured frames were recorded between a real device and the vendor
//! cloud and are the reference for every codec test.

#![cfg(any(test, feature = "benchmark"))]

use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use http::{Method, Request, Response};

use crate::codec::{Frame, Opcode, Packer, Wrapper};
use crate::proxy::{LocalApp, Upstream, request_host};
use crate::{GatewayError, Result};

/// Device id seen in the captured traffic.
pub const CAPTURED_DEVICE: u32 = 0x238D_F2AA;

/// Room id seen in the captured traffic.
pub const CAPTURED_ROOM: u32 = 0x0443_27A6;

/// Cloud PROGRAM downlink for day 6 of room `0x044327A6`.
pub const CAPTURED_PROGRAM: &[u8] = &[
    0xFA, 0xD4, 0x2A, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x0A, 0x0F, 0x1E, 0x00, 0xFF, 0x00, 0x00, 0x00,
    0xAA, 0xF2, 0x8D, 0x23, 0xA6, 0x27, 0x43, 0x04, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x11, 0x21, 0x22, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x11,
    0x11, 0x00, 0x63, 0xD7, 0x2D, 0xDF,
];

/// Cloud PROG_END downlink for room `0x044327A6`.
pub const CAPTURED_PROG_END: &[u8] = &[
    0xFA, 0xD4, 0x12, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0x2A, 0x0F, 0x06, 0x00, 0xFF, 0x00, 0x00, 0x00,
    0xAA, 0xF2, 0x8D, 0x23, 0xA6, 0x27, 0x43, 0x04, 0x14, 0x0A, 0xD1, 0xBF, 0x2D, 0xDF,
];

/// Common header followed by `body`.
pub fn inner_payload(cseq: u8, reserved1: u8, reserved2: u16, device_id: u32, body: &[u8]) -> Bytes {
    let mut packer = Packer::new();
    packer.u8(cseq).u8(reserved1).u16(reserved2).u32(device_id).bytes(body);
    packer.finish()
}

/// Encode a device-origin datagram.
pub fn uplink_datagram(opcode: Opcode, response: bool, write: bool, payload: Bytes) -> Bytes {
    let wrapper = Wrapper {
        msg_type: opcode,
        downlink: false,
        response,
        write,
        cloud_sync_lost: false,
        payload,
    };
    Frame::new(1, wrapper.encode()).encode()
}

/// STATUS body with one 12-byte block per `(room, temp, set_temp, flags)`.
pub fn status_body(last_seen: u32, rooms: &[(u32, i16, i16, u8)]) -> Bytes {
    let mut packer = Packer::new();
    packer.u32(last_seen);
    for &(room, temp, set_temp, flags) in rooms {
        packer.u32(room).i16(temp).i16(set_temp).u8(flags).u8(0).u16(0);
    }
    packer.finish()
}

/// Device STATUS report for [`CAPTURED_DEVICE`] with a single room.
pub fn status_datagram(temp: i16, set_temp: i16, flags: u8) -> Bytes {
    let body = status_body(1_700_000_000, &[(CAPTURED_ROOM, temp, set_temp, flags)]);
    uplink_datagram(Opcode::Status, false, false, inner_payload(0xFF, 0x02, 0, CAPTURED_DEVICE, &body))
}

/// Device PING with the reserved fields it normally carries.
pub fn ping_datagram() -> Bytes {
    uplink_datagram(Opcode::Ping, false, false, inner_payload(0xFF, 0x02, 0x0004, CAPTURED_DEVICE, &[0x01, 0x00]))
}

/// Local app answering every request with a fixed body.
pub struct StubApp {
    routes: Vec<String>,
    body: &'static str,
    calls: AtomicUsize,
}

impl StubApp {
    pub fn new(routes: &[&str], body: &'static str) -> Self {
        Self {
            routes: routes.iter().map(|route| route.to_string()).collect(),
            body,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl LocalApp for StubApp {
    fn route_exists(&self, path: &str, _method: &Method) -> bool {
        self.routes.iter().any(|route| route == path)
    }

    async fn handle(&self, _request: Request<Bytes>) -> Response<Bytes> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Response::new(Bytes::from_static(self.body.as_bytes()))
    }
}

/// Upstream answering with a fixed body, or failing every request.
pub struct StubUpstream {
    body: Option<&'static str>,
    calls: AtomicUsize,
}

impl StubUpstream {
    pub fn ok(body: &'static str) -> Self {
        Self { body: Some(body), calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { body: None, calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Upstream for StubUpstream {
    async fn forward(&self, request: &Request<Bytes>) -> Result<Response<Bytes>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.body {
            Some(body) => Ok(Response::new(Bytes::from_static(body.as_bytes()))),
            None => Err(GatewayError::upstream_unavailable(
                request_host(request).unwrap_or_default(),
                "connection refused",
            )),
        }
    }
}
