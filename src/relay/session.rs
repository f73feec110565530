//! Per-peer knock tracking
//!
//! A peer switches its next datagram to DIRECT handling by sending three
//! consecutive single-byte `0x58` datagrams. Any other datagram consumes the
//! armed state and resets the count.

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::debug;

/// Payload of a knock datagram.
pub const KNOCK: u8 = 0x58;

/// Consecutive knocks needed to arm DIRECT mode.
pub const KNOCKS_TO_ARM: u8 = 3;

/// How a non-knock datagram is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Forwarded verbatim and shadowed
    Relay,
    /// Decoded and answered locally as cloud-origin traffic
    Direct,
}

#[derive(Debug, Default)]
pub struct Sessions {
    knocks: HashMap<SocketAddr, u8>,
}

impl Sessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_knock(datagram: &[u8]) -> bool {
        datagram == [KNOCK]
    }

    /// Count a knock from `peer`.
    pub fn knock(&mut self, peer: SocketAddr) -> u8 {
        let count = self.knocks.entry(peer).or_default();
        *count = count.saturating_add(1);
        if *count == KNOCKS_TO_ARM {
            debug!("{} armed DIRECT mode", peer);
        }
        *count
    }

    /// Mode for a datagram from `peer`, resetting its knock count.
    pub fn take_mode(&mut self, peer: SocketAddr) -> Mode {
        match self.knocks.remove(&peer) {
            Some(count) if count >= KNOCKS_TO_ARM => Mode::Direct,
            _ => Mode::Relay,
        }
    }

    /// Mode the next datagram from `peer` would get.
    pub fn mode(&self, peer: SocketAddr) -> Mode {
        match self.knocks.get(&peer) {
            Some(count) if *count >= KNOCKS_TO_ARM => Mode::Direct,
            _ => Mode::Relay,
        }
    }

    /// Classify a datagram. Knocks return `None`.
    pub fn classify(&mut self, peer: SocketAddr, datagram: &[u8]) -> Option<Mode> {
        if Self::is_knock(datagram) {
            self.knock(peer);
            return None;
        }
        Some(self.take_mode(peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn three_knocks_arm_one_datagram() {
        let mut sessions = Sessions::new();
        for _ in 0..3 {
            assert_eq!(sessions.classify(peer(1), &[KNOCK]), None);
        }
        assert_eq!(sessions.mode(peer(1)), Mode::Direct);
        assert_eq!(sessions.classify(peer(1), &[0xFA, 0xD4]), Some(Mode::Direct));
        assert_eq!(sessions.classify(peer(1), &[0xFA, 0xD4]), Some(Mode::Relay));
    }

    #[test]
    fn two_knocks_stay_relay() {
        let mut sessions = Sessions::new();
        sessions.classify(peer(1), &[KNOCK]);
        sessions.classify(peer(1), &[KNOCK]);
        assert_eq!(sessions.classify(peer(1), &[0x00]), Some(Mode::Relay));
    }

    #[test]
    fn knocks_are_per_peer() {
        let mut sessions = Sessions::new();
        for _ in 0..3 {
            sessions.classify(peer(1), &[KNOCK]);
        }
        assert_eq!(sessions.classify(peer(2), &[0x00]), Some(Mode::Relay));
        assert_eq!(sessions.classify(peer(1), &[0x00]), Some(Mode::Direct));
    }

    #[test]
    fn knock_must_be_exactly_one_byte() {
        assert!(Sessions::is_knock(&[KNOCK]));
        assert!(!Sessions::is_knock(&[KNOCK, KNOCK]));
        assert!(!Sessions::is_knock(&[]));
    }

    proptest! {
        #[test]
        fn direct_only_after_three_consecutive_knocks(
            seq in prop::collection::vec(prop::bool::ANY, 0..24),
        ) {
            let mut sessions = Sessions::new();
            let mut run = 0u32;
            for is_knock in seq {
                if is_knock {
                    prop_assert_eq!(sessions.classify(peer(9), &[KNOCK]), None);
                    run += 1;
                } else {
                    let expected = if run >= 3 { Mode::Direct } else { Mode::Relay };
                    prop_assert_eq!(sessions.classify(peer(9), &[0x01, 0x02]), Some(expected));
                    run = 0;
                }
            }
        }
    }
}
