//! Command-sequence rendezvous
//!
//! Correlates a locally issued command with the device's asynchronous reply.
//! A caller registers a [`Waiter`] for `(device, cseq)` before the command is
//! sent; the dispatcher signals the key when the reply arrives. Waiters that
//! time out or are dropped remove their own registration, so a late signal is
//! simply dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::codec::Opcode;
use crate::{GatewayError, Result};

/// Command sequence value meaning "no command".
pub const UNUSED_CSEQ: u8 = 0xFF;

/// Value delivered to a waiter when its reply arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandReply {
    pub opcode: Opcode,
    pub room: u32,
    pub value: u32,
}

type Key = (u32, u8);

struct Registration {
    id: u64,
    sender: oneshot::Sender<CommandReply>,
}

#[derive(Default)]
struct Inner {
    waiters: HashMap<Key, Registration>,
    issued: HashMap<u32, u8>,
}

/// Shared registry of outstanding command waiters.
#[derive(Default)]
pub struct Rendezvous {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl Rendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Last sequence handed out for `device_id`.
    pub fn last_issued_sequence(&self, device_id: u32) -> Option<u8> {
        self.lock().issued.get(&device_id).copied()
    }

    /// Allocate the next command sequence for `device_id`, skipping
    /// [`UNUSED_CSEQ`].
    pub fn next_sequence(&self, device_id: u32) -> u8 {
        let mut inner = self.lock();
        let next = match inner.issued.get(&device_id) {
            Some(last) if last.wrapping_add(1) != UNUSED_CSEQ => last.wrapping_add(1),
            Some(_) => 0,
            None => 0,
        };
        inner.issued.insert(device_id, next);
        next
    }

    /// Register interest in the reply to `(device_id, sequence)`.
    ///
    /// Registering the same key twice is an invariant violation.
    pub fn register(self: &Arc<Self>, device_id: u32, sequence: u8) -> Result<Waiter> {
        let mut inner = self.lock();
        let key = (device_id, sequence);
        if inner.waiters.contains_key(&key) {
            return Err(GatewayError::invariant(format!(
                "waiter already registered for device {:#010x} sequence {:#04x}",
                device_id, sequence
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        inner.waiters.insert(key, Registration { id, sender });
        trace!("Registered waiter {} for {:#010x}/{:#04x}", id, device_id, sequence);

        Ok(Waiter { key, id, receiver, rendezvous: Arc::clone(self) })
    }

    /// Register and wait for the reply to `(device_id, sequence)`.
    pub async fn await_sequence(
        self: &Arc<Self>,
        device_id: u32,
        sequence: u8,
        timeout: Duration,
    ) -> Result<CommandReply> {
        self.register(device_id, sequence)?.wait(timeout).await
    }

    /// Deliver `reply` to the waiter for `(device_id, sequence)`.
    ///
    /// Returns false when nobody is waiting.
    pub fn signal_sequence(&self, device_id: u32, sequence: u8, reply: CommandReply) -> bool {
        let registration = self.lock().waiters.remove(&(device_id, sequence));
        match registration {
            Some(registration) => {
                if registration.sender.send(reply).is_err() {
                    debug!(
                        "Waiter for {:#010x}/{:#04x} went away before delivery",
                        device_id, sequence
                    );
                    return false;
                }
                true
            }
            None => {
                debug!("No waiter for {:#010x}/{:#04x}, reply dropped", device_id, sequence);
                false
            }
        }
    }

    pub fn is_waiting(&self, device_id: u32, sequence: u8) -> bool {
        self.lock().waiters.contains_key(&(device_id, sequence))
    }

    /// Number of outstanding registrations.
    pub fn pending(&self) -> usize {
        self.lock().waiters.len()
    }

    fn unregister(&self, key: Key, id: u64) {
        let mut inner = self.lock();
        if inner.waiters.get(&key).is_some_and(|registration| registration.id == id) {
            inner.waiters.remove(&key);
            trace!("Removed waiter {} for {:#010x}/{:#04x}", id, key.0, key.1);
        }
    }
}

/// Registration handle returned by [`Rendezvous::register`].
pub struct Waiter {
    key: Key,
    id: u64,
    receiver: oneshot::Receiver<CommandReply>,
    rendezvous: Arc<Rendezvous>,
}

impl Waiter {
    pub fn sequence(&self) -> u8 {
        self.key.1
    }

    /// Wait up to `timeout` for the reply.
    pub async fn wait(mut self, timeout: Duration) -> Result<CommandReply> {
        let (device_id, sequence) = self.key;
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(GatewayError::Closed),
            Err(_) => Err(GatewayError::Timeout { device_id, sequence, duration: timeout }),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.rendezvous.unregister(self.key, self.id);
    }
}
