//! Boost expiry timers
//!
//! One delay-queue entry per `(device, room)` with an armed boost. The relay
//! loop polls [`BoostTimers::next_expired`] next to its socket, so expiry runs
//! on the same task that owns the state.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::poll_fn;
use tokio_util::time::DelayQueue;
use tokio_util::time::delay_queue::Key;
use tracing::{debug, warn};

type RoomKey = (u32, u32);

/// Longest delay a timer is armed with. `DelayQueue` rejects delays beyond
/// roughly two years; later expiries are re-checked when this one fires.
pub const MAX_BOOST_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Default)]
pub struct BoostTimers {
    queue: DelayQueue<RoomKey>,
    keys: HashMap<RoomKey, Key>,
}

impl BoostTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm or re-arm the timer for a room to fire at `expiry`.
    pub fn arm(&mut self, device_id: u32, room: u32, expiry: DateTime<Utc>, now: DateTime<Utc>) {
        let mut delay = (expiry - now).to_std().unwrap_or(Duration::ZERO);
        if delay > MAX_BOOST_DELAY {
            warn!(
                "Boost for {:#010x}/{:#010x} expires at {}, clamping timer to {:?}",
                device_id, room, expiry, MAX_BOOST_DELAY
            );
            delay = MAX_BOOST_DELAY;
        }
        let key = (device_id, room);
        match self.keys.get(&key) {
            Some(existing) => self.queue.reset(existing, delay),
            None => {
                let entry = self.queue.insert(key, delay);
                self.keys.insert(key, entry);
            }
        }
        debug!("Boost for {:#010x}/{:#010x} expires in {:?}", device_id, room, delay);
    }

    /// Drop a pending timer. Returns false if none was armed.
    pub fn cancel(&mut self, device_id: u32, room: u32) -> bool {
        match self.keys.remove(&(device_id, room)) {
            Some(entry) => {
                self.queue.remove(&entry);
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, device_id: u32, room: u32) -> bool {
        self.keys.contains_key(&(device_id, room))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Wait for the next timer to fire.
    ///
    /// Resolves to `None` immediately when nothing is armed, so callers guard
    /// on [`is_empty`](Self::is_empty) inside `select!`.
    pub async fn next_expired(&mut self) -> Option<(u32, u32)> {
        let expired = poll_fn(|cx| self.queue.poll_expired(cx)).await?;
        let key = expired.into_inner();
        self.keys.remove(&key);
        Some(key)
    }
}
